//! DevTools HTTP endpoint probing.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CdpError, Result};

/// `/json/version` subset.
#[derive(Debug, Deserialize)]
pub struct VersionInfo {
	#[serde(rename = "Browser")]
	pub browser: Option<String>,
	#[serde(rename = "webSocketDebuggerUrl")]
	pub web_socket_debugger_url: String,
}

/// One `/json/list` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub url: String,
	pub web_socket_debugger_url: Option<String>,
}

fn client() -> Result<reqwest::Client> {
	Ok(reqwest::Client::builder().timeout(Duration::from_millis(800)).build()?)
}

async fn get<T: serde::de::DeserializeOwned>(url: &str) -> Result<T> {
	let response = client()?.get(url).send().await?;
	if !response.status().is_success() {
		return Err(CdpError::Endpoint(format!("{url} answered {}", response.status())));
	}
	Ok(response.json().await?)
}

pub async fn fetch_version(port: u16) -> Result<VersionInfo> {
	get(&format!("http://127.0.0.1:{port}/json/version")).await
}

pub async fn list_targets(port: u16) -> Result<Vec<TargetInfo>> {
	get(&format!("http://127.0.0.1:{port}/json/list")).await
}

/// Websocket URL of the first page target.
pub fn first_page(targets: &[TargetInfo]) -> Option<String> {
	targets
		.iter()
		.filter(|target| target.kind == "page")
		.find_map(|target| target.web_socket_debugger_url.clone())
}
