use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use slotwatch::session::{NetworkIdentity, OpenedSession, SessionFactory};

use crate::connection::CdpConnection;
use crate::launcher::{BrowserProcess, LaunchOptions};
use crate::page::{CdpSession, ProxyAuth};
use crate::profile::SiteProfile;

/// Launches one isolated browser per session.
pub struct CdpFactory {
	profile: Arc<SiteProfile>,
	launch: LaunchOptions,
}

impl CdpFactory {
	pub fn new(profile: SiteProfile) -> Self {
		Self {
			profile: Arc::new(profile),
			launch: LaunchOptions::default(),
		}
	}

	pub fn with_executable(mut self, executable: PathBuf) -> Self {
		self.launch.executable = Some(executable);
		self
	}

	pub fn headful(mut self, headful: bool) -> Self {
		self.launch.headful = headful;
		self
	}

	pub fn launch_options(&self, identity: &NetworkIdentity) -> LaunchOptions {
		let mut options = self.launch.clone();
		options.proxy_server = identity.proxy.as_ref().map(|proxy| proxy.server.clone());
		options
	}
}

/// Proxy credentials for `identity`, present only when both halves are configured.
pub fn proxy_auth(identity: &NetworkIdentity) -> Option<ProxyAuth> {
	let username = identity.proxy_username()?;
	let password = identity.proxy.as_ref()?.password.clone()?;
	Some(ProxyAuth { username, password })
}

#[async_trait]
impl SessionFactory for CdpFactory {
	async fn open(&self, identity: &NetworkIdentity) -> slotwatch::Result<OpenedSession> {
		let browser = BrowserProcess::launch(&self.launch_options(identity)).await?;
		let (connection, events) = CdpConnection::connect(browser.page_ws_url()).await?;
		info!(
			target = "slotwatch.cdp",
			port = browser.port(),
			session = %identity.session_token,
			proxied = identity.proxy.is_some(),
			"browser session opened"
		);
		let (session, responses) =
			CdpSession::attach(connection, events, Arc::clone(&self.profile), proxy_auth(identity), Some(browser)).await?;
		Ok(OpenedSession {
			session: Box::new(session),
			responses,
		})
	}
}

#[cfg(test)]
mod tests {
	use slotwatch::ProxyEndpoint;

	use super::*;

	fn identity(username: Option<&str>, password: Option<&str>) -> NetworkIdentity {
		NetworkIdentity {
			proxy: Some(ProxyEndpoint {
				server: "http://proxy.example:8000".into(),
				username: username.map(str::to_string),
				password: password.map(str::to_string),
			}),
			session_token: "tok123".into(),
		}
	}

	#[test]
	fn proxy_auth_carries_rotated_username() {
		let auth = proxy_auth(&identity(Some("acme"), Some("pw"))).unwrap();
		assert_eq!(auth.username, "acme-session-tok123");
		assert_eq!(auth.password, "pw");
	}

	#[test]
	fn proxy_auth_needs_both_halves() {
		assert!(proxy_auth(&identity(Some("acme"), None)).is_none());
		assert!(proxy_auth(&identity(None, Some("pw"))).is_none());
		assert!(proxy_auth(&NetworkIdentity::fresh(None)).is_none());
	}

	#[test]
	fn launch_options_follow_the_identity_proxy() {
		let profile = SiteProfile::from_json(
			r##"{"loginUrl": "https://p.example/in", "scheduleUrl": "https://p.example/s",
			"selectors": {"email": "#e", "password": "#p", "signIn": "#go", "facility": "#f",
			"date": "#d", "time": "#t", "submit": "#s"}}"##,
		)
		.unwrap();
		let factory = CdpFactory::new(profile).headful(true);
		let options = factory.launch_options(&identity(Some("acme"), Some("pw")));
		assert_eq!(options.proxy_server.as_deref(), Some("http://proxy.example:8000"));
		assert!(options.headful);
		assert!(factory.launch_options(&NetworkIdentity::fresh(None)).proxy_server.is_none());
	}
}
