//! Collaborator contract with the browser-automation driver.
//!
//! The engine never touches markup or transport. A [`SessionFactory`] opens
//! isolated sessions under a [`NetworkIdentity`]; each [`PortalSession`]
//! exposes the handful of portal actions the engine needs, and a passive
//! [`ResponseStream`] yields every intercepted response in arrival order.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// One intercepted network response.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
	pub url: String,
	/// Parsed JSON body, or the reason it could not be read.
	pub body: std::result::Result<Value, String>,
}

impl ResponseEvent {
	pub fn json(url: impl Into<String>, body: Value) -> Self {
		Self {
			url: url.into(),
			body: Ok(body),
		}
	}
}

/// Passive stream of responses for one session.
pub type ResponseStream = mpsc::UnboundedReceiver<ResponseEvent>;

/// Login credentials. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
	pub email: String,
	password: String,
}

impl Credentials {
	pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			email: email.into(),
			password: password.into(),
		}
	}

	pub fn password(&self) -> &str {
		&self.password
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials").field("email", &self.email).field("password", &"<redacted>").finish()
	}
}

/// Outbound proxy endpoint shared by all sessions; rotation happens through the username.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
	/// `scheme://host:port` or `host:port`.
	pub server: String,
	pub username: Option<String>,
	pub password: Option<String>,
}

impl ProxyEndpoint {
	/// Username carrying the rotation token: `{session}` is substituted when
	/// present, otherwise `-session-<token>` is appended.
	pub fn username_for(&self, token: &str) -> Option<String> {
		self.username.as_ref().map(|base| {
			if base.contains("{session}") {
				base.replace("{session}", token)
			} else {
				format!("{base}-session-{token}")
			}
		})
	}
}

impl fmt::Debug for ProxyEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProxyEndpoint")
			.field("server", &self.server)
			.field("username", &self.username)
			.field("password", &self.password.as_ref().map(|_| "<redacted>"))
			.finish()
	}
}

/// Outbound network identity for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
	pub proxy: Option<ProxyEndpoint>,
	pub session_token: String,
}

impl NetworkIdentity {
	/// Identity with a freshly generated rotation token.
	pub fn fresh(proxy: Option<ProxyEndpoint>) -> Self {
		let mut token = uuid::Uuid::new_v4().simple().to_string();
		token.truncate(12);
		Self { proxy, session_token: token }
	}

	/// Proxy username for this identity, if a proxy with credentials is configured.
	pub fn proxy_username(&self) -> Option<String> {
		self.proxy.as_ref().and_then(|proxy| proxy.username_for(&self.session_token))
	}
}

/// Lifecycle state of one live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
	Unauthenticated,
	Authenticating,
	Navigating,
	Monitoring,
	Booking,
	Terminated,
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			SessionState::Unauthenticated => "unauthenticated",
			SessionState::Authenticating => "authenticating",
			SessionState::Navigating => "navigating",
			SessionState::Monitoring => "monitoring",
			SessionState::Booking => "booking",
			SessionState::Terminated => "terminated",
		};
		f.write_str(label)
	}
}

/// Portal actions available on one authenticated browser session.
#[async_trait]
pub trait PortalSession: Send + Sync {
	/// Submits credentials. Rejections are `AuthenticationFailed`, lockouts `AccountLocked`.
	async fn login(&self, credentials: &Credentials) -> Result<()>;

	/// Opens the scheduling page and returns the facility options it offers.
	async fn open_schedule(&self) -> Result<Vec<String>>;

	async fn select_facility(&self, option: &str) -> Result<()>;

	/// Forces the remote service to emit a fresh availability response.
	async fn requery(&self) -> Result<()>;

	/// Visible text of the current page.
	async fn page_text(&self) -> Result<String>;

	/// Trivial round-trip used as a liveness check.
	async fn probe(&self) -> Result<()>;

	async fn select_date(&self, date: NaiveDate) -> Result<()>;

	async fn select_time(&self, time: &str) -> Result<()>;

	async fn submit_booking(&self) -> Result<()>;

	/// Whether the booking submission form is still on the page.
	async fn booking_form_present(&self) -> Result<bool>;

	async fn close(&self) -> Result<()>;
}

/// A session plus the response stream it feeds.
pub struct OpenedSession {
	pub session: Box<dyn PortalSession>,
	pub responses: ResponseStream,
}

/// Opens isolated browser sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
	async fn open(&self, identity: &NetworkIdentity) -> Result<OpenedSession>;
}

/// Case-insensitive substring match of `wanted` against the offered options.
pub fn match_facility<'a>(options: &'a [String], wanted: &str) -> Option<&'a str> {
	let needle = wanted.trim().to_lowercase();
	if needle.is_empty() {
		return None;
	}
	options.iter().map(String::as_str).find(|option| option.to_lowercase().contains(&needle))
}

/// Opens the schedule page and selects the configured facility.
pub async fn navigate_to_facility(session: &dyn PortalSession, facility: &str) -> Result<String> {
	let options = session.open_schedule().await?;
	let Some(option) = match_facility(&options, facility) else {
		return Err(Error::NavigationFailed(format!(
			"no facility option matches {facility:?} among {} offered",
			options.len()
		)));
	};
	let option = option.to_string();
	debug!(target = "slotwatch.session", %option, "selecting facility");
	session.select_facility(&option).await?;
	Ok(option)
}
