//! Engine configuration from environment-style key/value pairs.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::governor;
use crate::poll::Cadence;
use crate::session::{Credentials, ProxyEndpoint};
use crate::slot::{DateWindow, parse_date};

pub const DEFAULT_CHECKS_PER_MINUTE: u32 = 60;
pub const MIN_CHECKS_PER_MINUTE: u32 = 20;
pub const MAX_CHECKS_PER_MINUTE: u32 = 240;
pub const DEFAULT_LEDGER_PATH: &str = "slotwatch-ledger.json";

/// Ceiling for every minute-valued key: one year.
pub const MAX_MINUTES: u64 = 60 * 24 * 365;

const REDACTED: &str = "<redacted>";

/// Timers and thresholds of the monitoring loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
	/// Credentials are re-submitted on the live session this often.
	pub rotation: Duration,
	pub busy_pause: Duration,
	pub restart_backoff: Duration,
	/// Liveness probe runs every this many poll cycles.
	pub liveness_every_cycles: u64,
	pub observation_timeout: Duration,
	/// Deadline recorded for a credential after repeated busy signals.
	pub cooldown: Duration,
}

impl Default for Timings {
	fn default() -> Self {
		Self {
			rotation: Duration::from_secs(15 * 60),
			busy_pause: Duration::from_secs(60),
			restart_backoff: Duration::from_secs(10),
			liveness_every_cycles: 10,
			observation_timeout: Duration::from_millis(10_000),
			cooldown: Duration::from_secs(30 * 60),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifySettings {
	pub credentials: Credentials,
	pub interval: Duration,
}

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramSettings {
	pub bot_token: String,
	pub chat_id: String,
}

impl fmt::Debug for TelegramSettings {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TelegramSettings")
			.field("bot_token", &REDACTED)
			.field("chat_id", &self.chat_id)
			.finish()
	}
}

/// Everything the engine needs to run one credential against one facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
	pub primary: Credentials,
	/// `None` disables freshness verification.
	pub verify: Option<VerifySettings>,
	pub cadence: Cadence,
	pub window: DateWindow,
	pub facility: String,
	pub proxy: Option<ProxyEndpoint>,
	pub telegram: Option<TelegramSettings>,
	pub ledger_path: PathBuf,
	pub timings: Timings,
}

struct Vars(HashMap<String, String>);

impl Vars {
	fn optional(&self, key: &str) -> Option<String> {
		self.0.get(key).map(|value| value.trim()).filter(|value| !value.is_empty()).map(str::to_string)
	}

	fn required(&self, key: &str) -> Result<String> {
		self.optional(key).ok_or_else(|| Error::Config(format!("{key} is required")))
	}

	fn number<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
		match self.optional(key) {
			None => Ok(default),
			Some(raw) => raw
				.parse()
				.map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}"))),
		}
	}

	fn minutes(&self, key: &str, default: u64) -> Result<Duration> {
		let minutes: u64 = self.number(key, default)?;
		if minutes > MAX_MINUTES {
			return Err(Error::Config(format!("{key} must be at most {MAX_MINUTES}, got {minutes}")));
		}
		Ok(Duration::from_secs(minutes * 60))
	}

	fn date(&self, key: &str) -> Result<chrono::NaiveDate> {
		let raw = self.required(key)?;
		parse_date(&raw).ok_or_else(|| Error::Config(format!("{key} must be YYYY-MM-DD, got {raw:?}")))
	}
}

impl EngineConfig {
	/// Parses and validates the configuration. Unknown keys are ignored.
	pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		let vars = Vars(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());

		let primary = Credentials::new(vars.required("PRIMARY_EMAIL")?, vars.required("PRIMARY_PASSWORD")?);

		let verify = match (vars.optional("VERIFY_EMAIL"), vars.optional("VERIFY_PASSWORD")) {
			(Some(email), Some(password)) => {
				if governor::key(&email) == governor::key(&primary.email) {
					return Err(Error::Config("VERIFY_EMAIL must differ from PRIMARY_EMAIL".into()));
				}
				let interval = vars.minutes("VERIFY_INTERVAL_MINUTES", 5)?;
				if interval.is_zero() {
					return Err(Error::Config("VERIFY_INTERVAL_MINUTES must be at least 1".into()));
				}
				Some(VerifySettings {
					credentials: Credentials::new(email, password),
					interval,
				})
			}
			(None, None) => None,
			_ => return Err(Error::Config("VERIFY_EMAIL and VERIFY_PASSWORD must be set together".into())),
		};

		let checks: u32 = vars.number("CHECKS_PER_MINUTE", DEFAULT_CHECKS_PER_MINUTE)?;
		if !(MIN_CHECKS_PER_MINUTE..=MAX_CHECKS_PER_MINUTE).contains(&checks) {
			return Err(Error::Config(format!(
				"CHECKS_PER_MINUTE must be between {MIN_CHECKS_PER_MINUTE} and {MAX_CHECKS_PER_MINUTE}, got {checks}"
			)));
		}
		let overhead: u64 = vars.number("POLL_OVERHEAD_MS", 100)?;
		let cadence = Cadence::new(checks, Duration::from_millis(overhead));

		let window = DateWindow::new(vars.date("DATE_START")?, vars.date("DATE_END")?)?;
		let facility = vars.required("FACILITY")?;

		let proxy = match vars.optional("PROXY_URL") {
			Some(server) => Some(ProxyEndpoint {
				server,
				username: vars.optional("PROXY_USERNAME"),
				password: vars.optional("PROXY_PASSWORD"),
			}),
			None if vars.optional("PROXY_USERNAME").is_some() || vars.optional("PROXY_PASSWORD").is_some() => {
				return Err(Error::Config("PROXY_USERNAME/PROXY_PASSWORD need PROXY_URL".into()));
			}
			None => None,
		};

		let telegram = match (vars.optional("TELEGRAM_BOT_TOKEN"), vars.optional("TELEGRAM_CHAT_ID")) {
			(Some(bot_token), Some(chat_id)) => Some(TelegramSettings { bot_token, chat_id }),
			(None, None) => None,
			_ => return Err(Error::Config("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together".into())),
		};

		let defaults = Timings::default();
		let timings = Timings {
			rotation: vars.minutes("ROTATION_MINUTES", defaults.rotation.as_secs() / 60)?,
			busy_pause: Duration::from_secs(vars.number("BUSY_PAUSE_SECONDS", defaults.busy_pause.as_secs())?),
			restart_backoff: Duration::from_secs(vars.number("RESTART_BACKOFF_SECONDS", defaults.restart_backoff.as_secs())?),
			liveness_every_cycles: vars.number("LIVENESS_EVERY_CYCLES", defaults.liveness_every_cycles)?.max(1),
			observation_timeout: Duration::from_millis(vars.number("OBSERVATION_TIMEOUT_MS", defaults.observation_timeout.as_millis() as u64)?),
			cooldown: vars.minutes("COOLDOWN_MINUTES", defaults.cooldown.as_secs() / 60)?,
		};
		if timings.rotation.is_zero() {
			return Err(Error::Config("ROTATION_MINUTES must be at least 1".into()));
		}

		Ok(Self {
			primary,
			verify,
			cadence,
			window,
			facility,
			proxy,
			telegram,
			ledger_path: vars.optional("LEDGER_PATH").unwrap_or_else(|| DEFAULT_LEDGER_PATH.to_string()).into(),
			timings,
		})
	}

	/// Effective configuration with every secret replaced.
	pub fn redacted(&self) -> Value {
		json!({
			"primary": { "email": self.primary.email, "password": REDACTED },
			"verify": self.verify.as_ref().map(|verify| json!({
				"email": verify.credentials.email,
				"password": REDACTED,
				"intervalMinutes": verify.interval.as_secs() / 60,
			})),
			"checksPerMinute": self.cadence.checks_per_minute(),
			"pollDelayMs": self.cadence.delay().as_millis() as u64,
			"window": self.window,
			"facility": self.facility,
			"proxy": self.proxy.as_ref().map(|proxy| json!({
				"server": proxy.server,
				"username": proxy.username,
				"password": proxy.password.as_ref().map(|_| REDACTED),
			})),
			"telegram": self.telegram.as_ref().map(|telegram| json!({
				"botToken": REDACTED,
				"chatId": telegram.chat_id,
			})),
			"ledgerPath": self.ledger_path.display().to_string(),
			"timings": {
				"rotationMinutes": self.timings.rotation.as_secs() / 60,
				"busyPauseSeconds": self.timings.busy_pause.as_secs(),
				"restartBackoffSeconds": self.timings.restart_backoff.as_secs(),
				"livenessEveryCycles": self.timings.liveness_every_cycles,
				"observationTimeoutMs": self.timings.observation_timeout.as_millis() as u64,
				"cooldownMinutes": self.timings.cooldown.as_secs() / 60,
			},
		})
	}
}
