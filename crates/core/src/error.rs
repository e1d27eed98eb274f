//! Engine error taxonomy.
//!
//! Variants map one-to-one onto the failure classes the supervisor reacts to.
//! Plumbing variants (`Driver`, `Config`, `Io`, `Json`) cover everything that
//! is not a domain decision.

use chrono::NaiveDate;
use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
	/// Credentials were rejected; retried until the governor's threshold.
	#[error("authentication failed: {0}")]
	AuthenticationFailed(String),

	/// The remote service locked the account. Never retried.
	#[error("account locked: {0}")]
	AccountLocked(String),

	/// The remote service asked us to slow down.
	#[error("system busy")]
	SystemBusy,

	#[error("navigation failed: {0}")]
	NavigationFailed(String),

	#[error("connectivity lost: {0}")]
	ConnectivityLost(String),

	/// The primary session disagrees with the verification session.
	#[error("stale data: primary {primary:?}, verifier {secondary:?}")]
	StaleData {
		primary: Option<NaiveDate>,
		secondary: Option<NaiveDate>,
	},

	#[error("booking attempt failed: {0}")]
	BookingAttemptFailed(String),

	/// The verification session could not produce a comparison.
	#[error("verification failed: {0}")]
	VerificationFailed(String),

	/// Unclassified failure reported by the browser driver.
	#[error("driver error: {0}")]
	Driver(String),

	#[error("invalid configuration: {0}")]
	Config(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns `true` when the session transport is gone and only a rebuild helps.
	pub fn is_connectivity(&self) -> bool {
		matches!(self, Error::ConnectivityLost(_))
	}

	/// Short machine-friendly label used in logs and notifications.
	pub fn kind(&self) -> &'static str {
		match self {
			Error::AuthenticationFailed(_) => "authentication_failed",
			Error::AccountLocked(_) => "account_locked",
			Error::SystemBusy => "system_busy",
			Error::NavigationFailed(_) => "navigation_failed",
			Error::ConnectivityLost(_) => "connectivity_lost",
			Error::StaleData { .. } => "stale_data",
			Error::BookingAttemptFailed(_) => "booking_attempt_failed",
			Error::VerificationFailed(_) => "verification_failed",
			Error::Driver(_) => "driver",
			Error::Config(_) => "config",
			Error::Io(_) => "io",
			Error::Json(_) => "json",
		}
	}
}
