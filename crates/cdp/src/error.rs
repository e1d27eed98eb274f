//! Driver errors and their mapping onto the engine taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CdpError>;

#[derive(Debug, Error)]
pub enum CdpError {
	#[error("no Chrome/Chromium executable found; install one or pass --browser")]
	BrowserNotFound,

	#[error("failed to launch browser: {0}")]
	Launch(String),

	#[error("debugging endpoint unavailable: {0}")]
	Endpoint(String),

	#[error("websocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("devtools connection closed")]
	ConnectionClosed,

	#[error("{method} timed out after {secs}s")]
	Timeout { method: String, secs: u64 },

	#[error("protocol error {code}: {message}")]
	Protocol { code: i64, message: String },

	#[error("script failed: {0}")]
	Script(String),

	#[error("element not found: {0}")]
	ElementNotFound(String),

	#[error("site profile: {0}")]
	Profile(String),

	#[error(transparent)]
	Http(#[from] reqwest::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl From<CdpError> for slotwatch::Error {
	fn from(err: CdpError) -> Self {
		match err {
			CdpError::BrowserNotFound | CdpError::Profile(_) => slotwatch::Error::Config(err.to_string()),
			CdpError::Launch(_)
			| CdpError::Endpoint(_)
			| CdpError::WebSocket(_)
			| CdpError::ConnectionClosed
			| CdpError::Timeout { .. }
			| CdpError::Http(_) => slotwatch::Error::ConnectivityLost(err.to_string()),
			CdpError::Protocol { .. } | CdpError::Script(_) | CdpError::ElementNotFound(_) | CdpError::Json(_) | CdpError::Io(_) => {
				slotwatch::Error::Driver(err.to_string())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transport_failures_become_connectivity_loss() {
		let mapped: slotwatch::Error = CdpError::ConnectionClosed.into();
		assert!(mapped.is_connectivity());
		let mapped: slotwatch::Error = CdpError::Timeout {
			method: "Runtime.evaluate".into(),
			secs: 30,
		}
		.into();
		assert!(mapped.is_connectivity());
	}

	#[test]
	fn missing_browser_is_a_configuration_problem() {
		let mapped: slotwatch::Error = CdpError::BrowserNotFound.into();
		assert!(matches!(mapped, slotwatch::Error::Config(_)));
	}

	#[test]
	fn page_failures_stay_driver_errors() {
		let mapped: slotwatch::Error = CdpError::ElementNotFound("#submit".into()).into();
		assert!(matches!(mapped, slotwatch::Error::Driver(_)));
	}
}
