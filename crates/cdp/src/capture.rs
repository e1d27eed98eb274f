//! Network response capture.
//!
//! `Network.responseReceived` only carries headers; the body is available once
//! `Network.loadingFinished` fires for the same request. JSON XHR/fetch
//! responses are tracked between the two events and then read with
//! `Network.getResponseBody`.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

/// What to do after feeding one event to [`ResponseCapture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStep {
	/// Body is ready to be read.
	ReadBody { request_id: String, url: String },
	/// Tracked request failed before its body arrived.
	Failed { url: String, reason: String },
}

#[derive(Debug, Default)]
pub struct ResponseCapture {
	tracked: HashMap<String, String>,
}

fn is_json(mime: &str) -> bool {
	let mime = mime.to_ascii_lowercase();
	mime.contains("json")
}

impl ResponseCapture {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn tracked(&self) -> usize {
		self.tracked.len()
	}

	pub fn on_event(&mut self, method: &str, params: &Value) -> Option<CaptureStep> {
		let request_id = params.get("requestId")?.as_str()?;
		match method {
			"Network.responseReceived" => {
				let kind = params.get("type").and_then(Value::as_str).unwrap_or_default();
				let response = params.get("response")?;
				let mime = response.get("mimeType").and_then(Value::as_str).unwrap_or_default();
				if matches!(kind, "XHR" | "Fetch") && is_json(mime) {
					let url = response.get("url").and_then(Value::as_str)?;
					self.tracked.insert(request_id.to_string(), url.to_string());
				}
				None
			}
			"Network.loadingFinished" => self.tracked.remove(request_id).map(|url| CaptureStep::ReadBody {
				request_id: request_id.to_string(),
				url,
			}),
			"Network.loadingFailed" => self.tracked.remove(request_id).map(|url| CaptureStep::Failed {
				url,
				reason: params
					.get("errorText")
					.and_then(Value::as_str)
					.unwrap_or("loading failed")
					.to_string(),
			}),
			_ => None,
		}
	}
}

/// Parses a `Network.getResponseBody` result into JSON.
pub fn parse_body(result: &Value) -> Result<Value, String> {
	let body = result.get("body").and_then(Value::as_str).ok_or("response body missing")?;
	let encoded = result.get("base64Encoded").and_then(Value::as_bool).unwrap_or(false);
	if encoded {
		let bytes = STANDARD.decode(body).map_err(|err| err.to_string())?;
		serde_json::from_slice(&bytes).map_err(|err| err.to_string())
	} else {
		serde_json::from_str(body).map_err(|err| err.to_string())
	}
}
