//! Credential bans and cooldowns.
//!
//! The ledger is process-wide, append-only during a run, and consulted before
//! any session starts. Bans are permanent; cooldowns are advisory deadlines for
//! an external scheduler and are persisted so that scheduler can read them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};

const LEDGER_SCHEMA_VERSION: u32 = 1;

/// Consecutive rejected logins after which a credential is retired.
pub const AUTH_FAILURE_THRESHOLD: u32 = 3;

/// Permanent retirement of a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBanRecord {
	pub email: String,
	pub reason: String,
	pub banned_at: DateTime<Utc>,
}

/// Time-boxed suppression of new sessions for a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownRecord {
	pub email: String,
	pub reason: String,
	pub until: DateTime<Utc>,
}

/// On-disk ledger format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerFile {
	pub schema: u32,
	#[serde(default)]
	pub bans: Vec<CredentialBanRecord>,
	#[serde(default)]
	pub cooldowns: Vec<CooldownRecord>,
}

impl Default for LedgerFile {
	fn default() -> Self {
		Self {
			schema: LEDGER_SCHEMA_VERSION,
			bans: Vec::new(),
			cooldowns: Vec::new(),
		}
	}
}

/// Pluggable persistence for the ledger.
pub trait LedgerStore: Send + Sync {
	fn load(&self) -> Result<LedgerFile>;
	fn save(&self, ledger: &LedgerFile) -> Result<()>;
}

/// Ledger kept only in memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
	file: Mutex<LedgerFile>,
}

impl MemoryLedger {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_file(file: LedgerFile) -> Self {
		Self { file: Mutex::new(file) }
	}
}

impl LedgerStore for MemoryLedger {
	fn load(&self) -> Result<LedgerFile> {
		Ok(self.file.lock().clone())
	}

	fn save(&self, ledger: &LedgerFile) -> Result<()> {
		*self.file.lock() = ledger.clone();
		Ok(())
	}
}

/// Ledger persisted as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonLedger {
	path: PathBuf,
}

impl JsonLedger {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl LedgerStore for JsonLedger {
	/// A missing file is an empty ledger; an unreadable one is an error, since
	/// silently forgetting a ban would let a retired credential back in.
	fn load(&self) -> Result<LedgerFile> {
		match fs::read_to_string(&self.path) {
			Ok(content) => Ok(serde_json::from_str(&content)?),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(LedgerFile::default()),
			Err(err) => Err(err.into()),
		}
	}

	fn save(&self, ledger: &LedgerFile) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() {
				fs::create_dir_all(parent)?;
			}
		}
		let json = serde_json::to_string_pretty(ledger)?;
		let tmp = self.path.with_extension("json.tmp");
		fs::write(&tmp, json)?;
		fs::rename(&tmp, &self.path)?;
		Ok(())
	}
}

/// Result of recording a rejected login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureOutcome {
	/// Still below the threshold.
	Retry { failures: u32 },
	/// Threshold reached; the credential is now banned.
	Banned,
}

#[derive(Debug, Default)]
struct GovernorState {
	ledger: LedgerFile,
	consecutive_failures: HashMap<String, u32>,
}

/// Tracks login failures and lockouts, and retires credentials.
pub struct AccountGovernor {
	store: Arc<dyn LedgerStore>,
	clock: Arc<dyn Clock>,
	threshold: u32,
	state: Mutex<GovernorState>,
}

pub(crate) fn key(email: &str) -> String {
	email.trim().to_lowercase()
}

impl AccountGovernor {
	/// Loads the persisted ledger.
	pub fn load(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Result<Self> {
		let ledger = store.load()?;
		debug!(
			target = "slotwatch.governor",
			bans = ledger.bans.len(),
			cooldowns = ledger.cooldowns.len(),
			"ledger loaded"
		);
		Ok(Self {
			store,
			clock,
			threshold: AUTH_FAILURE_THRESHOLD,
			state: Mutex::new(GovernorState {
				ledger,
				consecutive_failures: HashMap::new(),
			}),
		})
	}

	pub fn is_banned(&self, email: &str) -> bool {
		let email = key(email);
		self.state.lock().ledger.bans.iter().any(|ban| key(&ban.email) == email)
	}

	pub fn ban_record(&self, email: &str) -> Option<CredentialBanRecord> {
		let email = key(email);
		self.state.lock().ledger.bans.iter().find(|ban| key(&ban.email) == email).cloned()
	}

	pub fn bans(&self) -> Vec<CredentialBanRecord> {
		self.state.lock().ledger.bans.clone()
	}

	/// Permanently retires `email`. Banning twice keeps the first record.
	pub fn ban(&self, email: &str, reason: &str) -> Result<CredentialBanRecord> {
		let mut state = self.state.lock();
		let normalized = key(email);
		if let Some(existing) = state.ledger.bans.iter().find(|ban| key(&ban.email) == normalized) {
			return Ok(existing.clone());
		}

		let record = CredentialBanRecord {
			email: email.trim().to_string(),
			reason: reason.to_string(),
			banned_at: self.clock.now(),
		};
		warn!(target = "slotwatch.governor", email = %record.email, reason, "credential banned");
		state.ledger.bans.push(record.clone());
		state.consecutive_failures.remove(&normalized);
		self.store.save(&state.ledger)?;
		Ok(record)
	}

	/// Counts a rejected login; bans on reaching the threshold.
	pub fn record_auth_failure(&self, email: &str, reason: &str) -> Result<AuthFailureOutcome> {
		let failures = {
			let mut state = self.state.lock();
			let counter = state.consecutive_failures.entry(key(email)).or_insert(0);
			*counter += 1;
			*counter
		};
		info!(target = "slotwatch.governor", email, failures, threshold = self.threshold, "login rejected");

		if failures >= self.threshold {
			self.ban(email, &format!("{failures} consecutive login failures: {reason}"))?;
			return Ok(AuthFailureOutcome::Banned);
		}
		Ok(AuthFailureOutcome::Retry { failures })
	}

	/// Applies a failed login to the ledger: lockouts ban at once, rejections
	/// count toward the threshold. Returns the ban record when this error retired
	/// the credential.
	pub fn record_login_error(&self, email: &str, err: &Error) -> Result<Option<CredentialBanRecord>> {
		match err {
			Error::AccountLocked(reason) => self.ban(email, &format!("account locked: {reason}")).map(Some),
			Error::AuthenticationFailed(reason) => match self.record_auth_failure(email, reason)? {
				AuthFailureOutcome::Banned => Ok(self.ban_record(email)),
				AuthFailureOutcome::Retry { .. } => Ok(None),
			},
			_ => Ok(None),
		}
	}

	pub fn record_auth_success(&self, email: &str) {
		self.state.lock().consecutive_failures.remove(&key(email));
	}

	pub fn consecutive_failures(&self, email: &str) -> u32 {
		self.state.lock().consecutive_failures.get(&key(email)).copied().unwrap_or(0)
	}

	/// Active cooldown deadline for `email`, if any.
	pub fn cooldown_until(&self, email: &str) -> Option<DateTime<Utc>> {
		let email = key(email);
		let now = self.clock.now();
		self.state
			.lock()
			.ledger
			.cooldowns
			.iter()
			.filter(|cooldown| key(&cooldown.email) == email && cooldown.until > now)
			.map(|cooldown| cooldown.until)
			.max()
	}

	pub fn set_cooldown(&self, email: &str, reason: &str, until: DateTime<Utc>) -> Result<CooldownRecord> {
		let record = CooldownRecord {
			email: email.trim().to_string(),
			reason: reason.to_string(),
			until,
		};
		info!(target = "slotwatch.governor", email = %record.email, %until, reason, "cooldown recorded");
		let mut state = self.state.lock();
		state.ledger.cooldowns.push(record.clone());
		self.store.save(&state.ledger)?;
		Ok(record)
	}

	/// Drops cooldowns whose deadline has passed; returns how many were removed.
	pub fn prune_expired_cooldowns(&self) -> Result<usize> {
		let now = self.clock.now();
		let mut state = self.state.lock();
		let before = state.ledger.cooldowns.len();
		state.ledger.cooldowns.retain(|cooldown| cooldown.until > now);
		let removed = before - state.ledger.cooldowns.len();
		if removed > 0 {
			self.store.save(&state.ledger)?;
		}
		Ok(removed)
	}

	pub fn snapshot(&self) -> LedgerFile {
		self.state.lock().ledger.clone()
	}
}
