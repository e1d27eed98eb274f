//! Re-query cadence and latency bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::clock::Clock;
use crate::error::Result;
use crate::observer::Observation;
use crate::session::PortalSession;

/// Converts a target rate into the sleep between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
	checks_per_minute: u32,
	overhead: Duration,
}

impl Cadence {
	/// `overhead` is the fixed per-cycle cost already spent outside the sleep.
	pub fn new(checks_per_minute: u32, overhead: Duration) -> Self {
		Self {
			checks_per_minute: checks_per_minute.max(1),
			overhead,
		}
	}

	pub fn checks_per_minute(&self) -> u32 {
		self.checks_per_minute
	}

	/// Wall time budgeted for one full cycle.
	pub fn interval(&self) -> Duration {
		Duration::from_secs(60) / self.checks_per_minute
	}

	/// Sleep after a cycle, so the effective rate converges on the target. Never negative.
	pub fn delay(&self) -> Duration {
		self.interval().saturating_sub(self.overhead)
	}
}

/// Issues re-query actions on the live session and remembers when.
pub struct PollDriver {
	cadence: Cadence,
	clock: Arc<dyn Clock>,
	last_request_at: Option<DateTime<Utc>>,
	ticks: u64,
}

impl PollDriver {
	pub fn new(cadence: Cadence, clock: Arc<dyn Clock>) -> Self {
		Self {
			cadence,
			clock,
			last_request_at: None,
			ticks: 0,
		}
	}

	pub fn cadence(&self) -> Cadence {
		self.cadence
	}

	pub fn ticks(&self) -> u64 {
		self.ticks
	}

	pub fn last_request_at(&self) -> Option<DateTime<Utc>> {
		self.last_request_at
	}

	/// Issues one re-query. The request time is recorded even when the action fails,
	/// and nothing waits for an answer here.
	pub async fn tick(&mut self, session: &dyn PortalSession) -> Result<()> {
		self.last_request_at = Some(self.clock.now());
		self.ticks += 1;
		trace!(target = "slotwatch.poll", tick = self.ticks, "requery");
		session.requery().await
	}

	/// Time from the latest request to the latest observation, when the
	/// observation arrived after that request. Observability only.
	pub fn latency(&self, observation: &Observation) -> Option<Duration> {
		let requested = self.last_request_at?;
		let observed = observation.last_slot_at()?;
		if observed < requested {
			return None;
		}
		(observed - requested).to_std().ok()
	}
}
