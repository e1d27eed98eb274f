//! [`PortalSession`] over one DevTools page target.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use slotwatch::session::{Credentials, PortalSession, ResponseEvent, ResponseStream};
use slotwatch::slot::DATE_FORMAT;

use crate::capture::{CaptureStep, ResponseCapture, parse_body};
use crate::connection::{CdpConnection, CdpEvent, EventStream};
use crate::error::{CdpError, Result};
use crate::launcher::BrowserProcess;
use crate::profile::SiteProfile;
use crate::script;

const LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const LOGIN_SETTLE_TIMEOUT: Duration = Duration::from_secs(20);
const ELEMENT_WAIT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Credentials answered to proxy authentication challenges.
#[derive(Clone)]
pub struct ProxyAuth {
	pub username: String,
	pub password: String,
}

impl std::fmt::Debug for ProxyAuth {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxyAuth").field("username", &self.username).finish_non_exhaustive()
	}
}

pub struct CdpSession {
	connection: Arc<CdpConnection>,
	profile: Arc<SiteProfile>,
	browser: tokio::sync::Mutex<Option<BrowserProcess>>,
	pump: JoinHandle<()>,
}

impl CdpSession {
	/// Enables the protocol domains on an open connection and starts the event pump.
	///
	/// `browser` is the process backing the connection, killed on [`PortalSession::close`].
	pub async fn attach(
		connection: Arc<CdpConnection>,
		events: EventStream,
		profile: Arc<SiteProfile>,
		auth: Option<ProxyAuth>,
		browser: Option<BrowserProcess>,
	) -> Result<(Self, ResponseStream)> {
		let (responses_tx, responses_rx) = mpsc::unbounded_channel();
		let pump = tokio::spawn(pump_events(Arc::clone(&connection), events, responses_tx, auth.clone()));

		for domain in ["Network.enable", "Page.enable", "Runtime.enable"] {
			connection.send(domain, json!({})).await?;
		}
		if auth.is_some() {
			connection
				.send("Fetch.enable", json!({"handleAuthRequests": true, "patterns": [{"urlPattern": "*"}]}))
				.await?;
		}

		let session = Self {
			connection,
			profile,
			browser: tokio::sync::Mutex::new(browser),
			pump,
		};
		Ok((session, responses_rx))
	}

	async fn evaluate(&self, expression: &str) -> Result<Value> {
		let result = self
			.connection
			.send(
				"Runtime.evaluate",
				json!({"expression": expression, "returnByValue": true, "awaitPromise": true}),
			)
			.await?;
		if let Some(details) = result.get("exceptionDetails") {
			let text = details
				.pointer("/exception/description")
				.or_else(|| details.get("text"))
				.and_then(Value::as_str)
				.unwrap_or("uncaught exception");
			return Err(CdpError::Script(text.to_string()));
		}
		Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
	}

	/// Runs an element script; `false` from the page means the element is missing.
	async fn act(&self, selector: &str, expression: &str) -> Result<()> {
		match self.evaluate(expression).await? {
			Value::Bool(true) => Ok(()),
			_ => Err(CdpError::ElementNotFound(selector.to_string())),
		}
	}

	/// Retries [`Self::act`] until the element shows up or `wait` elapses.
	async fn act_when_ready(&self, selector: &str, expression: &str, wait: Duration) -> Result<()> {
		let deadline = Instant::now() + wait;
		loop {
			match self.act(selector, expression).await {
				Ok(()) => return Ok(()),
				Err(CdpError::ElementNotFound(_) | CdpError::Protocol { .. }) if Instant::now() < deadline => {
					tokio::time::sleep(POLL_INTERVAL).await;
				}
				Err(err) => return Err(err),
			}
		}
	}

	async fn exists(&self, selector: &str) -> Result<bool> {
		Ok(self.evaluate(&script::exists(selector)).await?.as_bool().unwrap_or(false))
	}

	async fn text(&self) -> Result<String> {
		Ok(self.evaluate(&script::body_text()).await?.as_str().unwrap_or_default().to_string())
	}

	async fn navigate(&self, url: &str) -> Result<()> {
		let result = self.connection.send("Page.navigate", json!({"url": url})).await?;
		if let Some(error) = result.get("errorText").and_then(Value::as_str) {
			return Err(CdpError::Endpoint(format!("{url}: {error}")));
		}
		self.wait_loaded().await
	}

	async fn wait_loaded(&self) -> Result<()> {
		let deadline = Instant::now() + LOAD_TIMEOUT;
		loop {
			// Evaluation fails while the old document is torn down.
			if let Ok(Value::String(state)) = self.evaluate(&script::ready_state()).await {
				if state == "complete" {
					return Ok(());
				}
			}
			if Instant::now() >= deadline {
				return Err(CdpError::Timeout {
					method: "page load".into(),
					secs: LOAD_TIMEOUT.as_secs(),
				});
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}

	/// Waits for the login form to go away or for the portal to explain why it did not.
	async fn settle_login(&self) -> slotwatch::Result<()> {
		let deadline = Instant::now() + LOGIN_SETTLE_TIMEOUT;
		loop {
			tokio::time::sleep(POLL_INTERVAL).await;
			if let Ok(text) = self.text().await {
				if self.profile.mentions_lock(&text) {
					return Err(slotwatch::Error::AccountLocked("portal reports the account locked".into()));
				}
				if self.profile.mentions_invalid_credentials(&text) {
					return Err(slotwatch::Error::AuthenticationFailed("credentials rejected".into()));
				}
				if let Ok(false) = self.exists(&self.profile.selectors.email).await {
					return Ok(());
				}
			}
			if Instant::now() >= deadline {
				return Err(slotwatch::Error::AuthenticationFailed("login form still present".into()));
			}
		}
	}
}

impl Drop for CdpSession {
	fn drop(&mut self) {
		self.pump.abort();
	}
}

#[async_trait]
impl PortalSession for CdpSession {
	async fn login(&self, credentials: &Credentials) -> slotwatch::Result<()> {
		let selectors = &self.profile.selectors;
		self.navigate(&self.profile.login_url).await?;
		self.act_when_ready(&selectors.email, &script::fill(&selectors.email, &credentials.email), ELEMENT_WAIT)
			.await?;
		self.act(&selectors.password, &script::fill(&selectors.password, credentials.password()))
			.await?;
		if let Some(terms) = &selectors.terms {
			self.act(terms, &script::check(terms)).await?;
		}
		self.act(&selectors.sign_in, &script::click(&selectors.sign_in)).await?;
		debug!(target = "slotwatch.cdp", email = %credentials.email, "credentials submitted");
		self.settle_login().await
	}

	async fn open_schedule(&self) -> slotwatch::Result<Vec<String>> {
		let facility = &self.profile.selectors.facility;
		self.navigate(&self.profile.schedule_url).await?;
		let deadline = Instant::now() + ELEMENT_WAIT;
		loop {
			if let Ok(Value::Array(labels)) = self.evaluate(&script::option_labels(facility)).await {
				let labels: Vec<String> = labels.into_iter().filter_map(|label| label.as_str().map(str::to_string)).collect();
				if !labels.is_empty() {
					return Ok(labels);
				}
			}
			if Instant::now() >= deadline {
				return Err(slotwatch::Error::NavigationFailed(format!("no facility options under {facility}")));
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}

	async fn select_facility(&self, option: &str) -> slotwatch::Result<()> {
		let facility = &self.profile.selectors.facility;
		Ok(self.act(facility, &script::select_by_label(facility, option)).await?)
	}

	async fn requery(&self) -> slotwatch::Result<()> {
		let selector = self.profile.requery_selector();
		Ok(self.act(selector, &script::redispatch_change(selector)).await?)
	}

	async fn page_text(&self) -> slotwatch::Result<String> {
		Ok(self.text().await?)
	}

	async fn probe(&self) -> slotwatch::Result<()> {
		match self.evaluate(&script::liveness()).await? {
			Value::Number(n) if n.as_i64() == Some(2) => Ok(()),
			other => Err(slotwatch::Error::ConnectivityLost(format!("liveness probe returned {other}"))),
		}
	}

	async fn select_date(&self, date: NaiveDate) -> slotwatch::Result<()> {
		let selector = &self.profile.selectors.date;
		let value = date.format(DATE_FORMAT).to_string();
		Ok(self.act(selector, &script::fill(selector, &value)).await?)
	}

	async fn select_time(&self, time: &str) -> slotwatch::Result<()> {
		let selector = &self.profile.selectors.time;
		Ok(self.act_when_ready(selector, &script::select_by_label(selector, time), ELEMENT_WAIT).await?)
	}

	async fn submit_booking(&self) -> slotwatch::Result<()> {
		let selectors = &self.profile.selectors;
		self.act(&selectors.submit, &script::click(&selectors.submit)).await?;
		if let Some(confirm) = &selectors.confirm {
			self.act_when_ready(confirm, &script::click(confirm), ELEMENT_WAIT).await?;
		}
		info!(target = "slotwatch.cdp", "booking submitted");
		Ok(())
	}

	async fn booking_form_present(&self) -> slotwatch::Result<bool> {
		if let Err(err) = self.wait_loaded().await {
			debug!(target = "slotwatch.cdp", error = %err, "page still loading after submit");
		}
		Ok(self.exists(&self.profile.selectors.submit).await?)
	}

	async fn close(&self) -> slotwatch::Result<()> {
		if let Err(err) = self.connection.send("Browser.close", json!({})).await {
			trace!(target = "slotwatch.cdp", error = %err, "Browser.close not acknowledged");
		}
		self.connection.close().await;
		self.pump.abort();
		if let Some(mut browser) = self.browser.lock().await.take() {
			browser.kill().await;
		}
		Ok(())
	}
}

/// Drains protocol events: captured JSON responses go to `responses`, proxy
/// challenges are answered and paused requests resumed.
pub async fn pump_events(
	connection: Arc<CdpConnection>,
	mut events: EventStream,
	responses: mpsc::UnboundedSender<ResponseEvent>,
	auth: Option<ProxyAuth>,
) {
	let mut capture = ResponseCapture::new();
	while let Some(CdpEvent { method, params }) = events.recv().await {
		if method.starts_with("Fetch.") {
			let connection = Arc::clone(&connection);
			let auth = auth.clone();
			tokio::spawn(async move { answer_fetch(&connection, &method, &params, auth.as_ref()).await });
			continue;
		}
		match capture.on_event(&method, &params) {
			Some(CaptureStep::ReadBody { request_id, url }) => {
				let body = match connection.send("Network.getResponseBody", json!({"requestId": request_id})).await {
					Ok(result) => parse_body(&result),
					Err(err) => Err(err.to_string()),
				};
				let _ = responses.send(ResponseEvent { url, body });
			}
			Some(CaptureStep::Failed { url, reason }) => {
				let _ = responses.send(ResponseEvent { url, body: Err(reason) });
			}
			None => {}
		}
	}
	debug!(target = "slotwatch.cdp", "event pump stopped");
}

async fn answer_fetch(connection: &CdpConnection, method: &str, params: &Value, auth: Option<&ProxyAuth>) {
	let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
		return;
	};
	let result = if method == "Fetch.authRequired" {
		let response = match auth {
			Some(auth) => json!({"response": "ProvideCredentials", "username": auth.username, "password": auth.password}),
			None => json!({"response": "CancelAuth"}),
		};
		connection
			.send("Fetch.continueWithAuth", json!({"requestId": request_id, "authChallengeResponse": response}))
			.await
	} else {
		connection.send("Fetch.continueRequest", json!({"requestId": request_id})).await
	};
	if let Err(err) = result {
		warn!(target = "slotwatch.cdp", method, error = %err, "paused request not resumed");
	}
}
