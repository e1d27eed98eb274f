//! Browser process launch with a throwaway profile directory.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::{CdpError, Result};
use crate::finder::find_browser;
use crate::probe::{fetch_version, first_page, list_targets};

const STARTUP_POLLS: u32 = 50;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
	/// Explicit executable; discovered when `None`.
	pub executable: Option<PathBuf>,
	pub headful: bool,
	/// Value for `--proxy-server`.
	pub proxy_server: Option<String>,
	pub extra_args: Vec<String>,
}

/// A running browser. Killed on drop; its profile directory is removed with it.
pub struct BrowserProcess {
	child: Child,
	port: u16,
	page_ws_url: String,
	_profile_dir: TempDir,
}

fn free_port() -> Result<u16> {
	let listener = TcpListener::bind("127.0.0.1:0")?;
	Ok(listener.local_addr()?.port())
}

pub fn browser_args(port: u16, profile_dir: &std::path::Path, options: &LaunchOptions) -> Vec<String> {
	let mut args = vec![
		format!("--remote-debugging-port={port}"),
		format!("--user-data-dir={}", profile_dir.display()),
		"--no-first-run".to_string(),
		"--no-default-browser-check".to_string(),
		"--disable-background-networking".to_string(),
		"--disable-extensions".to_string(),
	];
	if !options.headful {
		args.push("--headless=new".to_string());
	}
	if let Some(proxy) = &options.proxy_server {
		args.push(format!("--proxy-server={proxy}"));
	}
	args.extend(options.extra_args.iter().cloned());
	args.push("about:blank".to_string());
	args
}

impl BrowserProcess {
	pub async fn launch(options: &LaunchOptions) -> Result<Self> {
		let executable = match &options.executable {
			Some(path) => path.clone(),
			None => find_browser().ok_or(CdpError::BrowserNotFound)?,
		};
		let profile_dir = tempfile::Builder::new().prefix("slotwatch-profile-").tempdir()?;
		let port = free_port()?;
		let args = browser_args(port, profile_dir.path(), options);

		let mut child = Command::new(&executable)
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|err| CdpError::Launch(format!("{}: {err}", executable.display())))?;
		debug!(target = "slotwatch.cdp", executable = %executable.display(), port, headful = options.headful, "browser spawned");

		let mut last_error = "endpoint not reachable".to_string();
		for _ in 0..STARTUP_POLLS {
			tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
			if let Ok(Some(status)) = child.try_wait() {
				return Err(CdpError::Launch(format!("browser exited during startup ({status})")));
			}
			match Self::page_endpoint(port).await {
				Ok(page_ws_url) => {
					info!(target = "slotwatch.cdp", port, "browser ready");
					return Ok(Self {
						child,
						port,
						page_ws_url,
						_profile_dir: profile_dir,
					});
				}
				Err(err) => last_error = err.to_string(),
			}
		}

		let _ = child.start_kill();
		Err(CdpError::Endpoint(format!("port {port}: {last_error}")))
	}

	async fn page_endpoint(port: u16) -> Result<String> {
		let version = fetch_version(port).await?;
		debug!(target = "slotwatch.cdp", browser = version.browser.as_deref().unwrap_or("?"), "devtools endpoint up");
		let targets = list_targets(port).await?;
		first_page(&targets).ok_or_else(|| CdpError::Endpoint("no page target yet".into()))
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn page_ws_url(&self) -> &str {
		&self.page_ws_url
	}

	pub async fn kill(&mut self) {
		if let Err(err) = self.child.kill().await {
			debug!(target = "slotwatch.cdp", error = %err, "browser already gone");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn headless_by_default_with_proxy() {
		let options = LaunchOptions {
			proxy_server: Some("http://proxy.example:8000".into()),
			..LaunchOptions::default()
		};
		let args = browser_args(9333, std::path::Path::new("/tmp/p"), &options);
		assert!(args.contains(&"--remote-debugging-port=9333".to_string()));
		assert!(args.contains(&"--user-data-dir=/tmp/p".to_string()));
		assert!(args.contains(&"--headless=new".to_string()));
		assert!(args.contains(&"--proxy-server=http://proxy.example:8000".to_string()));
		assert_eq!(args.last().map(String::as_str), Some("about:blank"));
	}

	#[test]
	fn headful_omits_headless_flag() {
		let options = LaunchOptions {
			headful: true,
			..LaunchOptions::default()
		};
		let args = browser_args(9333, std::path::Path::new("/tmp/p"), &options);
		assert!(!args.iter().any(|arg| arg.starts_with("--headless")));
	}

	#[tokio::test]
	async fn missing_executable_fails_to_launch() {
		let options = LaunchOptions {
			executable: Some(PathBuf::from("/nonexistent/slotwatch-browser")),
			..LaunchOptions::default()
		};
		assert!(matches!(BrowserProcess::launch(&options).await, Err(CdpError::Launch(_))));
	}
}
