//! Site profile: URLs, selectors and page phrases for one scheduling portal.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CdpError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selectors {
	pub email: String,
	pub password: String,
	/// Terms checkbox some login forms require.
	#[serde(default)]
	pub terms: Option<String>,
	pub sign_in: String,
	pub facility: String,
	pub date: String,
	pub time: String,
	pub submit: String,
	/// Confirmation button of a modal shown after submit.
	#[serde(default)]
	pub confirm: Option<String>,
	/// Control whose `change` event makes the portal re-fetch availability.
	/// Defaults to the facility select.
	#[serde(default)]
	pub requery: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phrases {
	#[serde(default = "default_locked")]
	pub locked: Vec<String>,
	#[serde(default = "default_invalid")]
	pub invalid_credentials: Vec<String>,
}

fn default_locked() -> Vec<String> {
	vec!["account locked".into(), "your account is locked".into()]
}

fn default_invalid() -> Vec<String> {
	vec!["invalid email or password".into()]
}

impl Default for Phrases {
	fn default() -> Self {
		Self {
			locked: default_locked(),
			invalid_credentials: default_invalid(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteProfile {
	pub login_url: String,
	pub schedule_url: String,
	pub selectors: Selectors,
	#[serde(default)]
	pub phrases: Phrases,
}

impl SiteProfile {
	pub fn from_json(raw: &str) -> Result<Self> {
		let profile: SiteProfile = serde_json::from_str(raw).map_err(|err| CdpError::Profile(err.to_string()))?;
		profile.validate()?;
		Ok(profile)
	}

	pub fn load(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path).map_err(|err| CdpError::Profile(format!("{}: {err}", path.display())))?;
		Self::from_json(&raw)
	}

	pub fn requery_selector(&self) -> &str {
		self.selectors.requery.as_deref().unwrap_or(&self.selectors.facility)
	}

	fn validate(&self) -> Result<()> {
		for (name, url) in [("loginUrl", &self.login_url), ("scheduleUrl", &self.schedule_url)] {
			if !(url.starts_with("https://") || url.starts_with("http://")) {
				return Err(CdpError::Profile(format!("{name} must be an http(s) URL, got {url:?}")));
			}
		}
		Ok(())
	}

	/// Page text says the account is locked.
	pub fn mentions_lock(&self, text: &str) -> bool {
		contains_any(text, &self.phrases.locked)
	}

	pub fn mentions_invalid_credentials(&self, text: &str) -> bool {
		contains_any(text, &self.phrases.invalid_credentials)
	}
}

fn contains_any(text: &str, phrases: &[String]) -> bool {
	let text = text.to_lowercase();
	phrases.iter().any(|phrase| text.contains(&phrase.to_lowercase()))
}
