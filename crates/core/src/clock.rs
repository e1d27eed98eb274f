//! Wall-clock source.
//!
//! Timestamps on observations and ledger records come from a [`Clock`] so tests
//! can pin "today" without touching the system clock. Interval timers use
//! `tokio::time` directly.

use chrono::{DateTime, Local, NaiveDate, Utc};

/// Source of wall-clock time and the operator's calendar date.
pub trait Clock: Send + Sync {
	fn now(&self) -> DateTime<Utc>;

	/// Calendar date in the operator's local timezone.
	fn today(&self) -> NaiveDate;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}

	fn today(&self) -> NaiveDate {
		Local::now().date_naive()
	}
}
