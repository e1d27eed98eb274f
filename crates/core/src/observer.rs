//! Latest-known slot state fed by intercepted responses.
//!
//! The response pump is the only writer. Readers take a cloned
//! [`Observation`] snapshot, so a value that changes mid-cycle never tears.
//! Freshness here means "most recently arrived", never "answer to the most
//! recent request": the remote service may reorder responses.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::classify::{ResponseKind, classify};
use crate::clock::Clock;
use crate::session::{ResponseEvent, ResponseStream};
use crate::slot::{ClosestSlotTracker, SlotCandidate};

/// Point-in-time copy of everything the observer has captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
	pub slot: Option<SlotCandidate>,
	/// Bumped on every recorded slot.
	pub slot_generation: u64,
	pub time: Option<String>,
	/// Bumped on every recorded time.
	pub time_generation: u64,
}

impl Observation {
	pub fn slot_date(&self) -> Option<NaiveDate> {
		self.slot.as_ref().map(|slot| slot.date)
	}

	pub fn last_slot_at(&self) -> Option<DateTime<Utc>> {
		self.slot.as_ref().map(|slot| slot.observed_at)
	}
}

/// Turns the unordered response stream of one session into a coherent latest slot.
pub struct SlotObserver {
	clock: Arc<dyn Clock>,
	state: watch::Sender<Observation>,
	tracker: Option<Arc<Mutex<ClosestSlotTracker>>>,
}

impl SlotObserver {
	/// Creates an observer; when `tracker` is set, every qualifying slot is offered to it.
	pub fn new(clock: Arc<dyn Clock>, tracker: Option<Arc<Mutex<ClosestSlotTracker>>>) -> Self {
		let (state, _) = watch::channel(Observation::default());
		Self { clock, state, tracker }
	}

	/// Classifies one response and records whatever it carries.
	pub fn on_response(&self, event: &ResponseEvent) {
		let body = match &event.body {
			Ok(body) => body,
			Err(reason) => {
				trace!(target = "slotwatch.observer", url = %event.url, %reason, "skipping unreadable body");
				return;
			}
		};

		match classify(&event.url, body) {
			ResponseKind::SlotList(dates) => {
				if let Some(date) = dates.first() {
					self.record_slot(*date);
				}
			}
			ResponseKind::TimeList(times) => {
				if let Some(time) = times.into_iter().next() {
					self.record_time(time);
				}
			}
			ResponseKind::Unrecognized => {}
		}
	}

	/// Records a new latest slot and offers it to the closest-slot tracker.
	pub fn record_slot(&self, date: NaiveDate) {
		let candidate = SlotCandidate::new(date, self.clock.now());
		debug!(target = "slotwatch.observer", %date, "slot observed");

		if let Some(tracker) = &self.tracker {
			let mut tracker = tracker.lock();
			if tracker.offer(&candidate, self.clock.today()) {
				info!(target = "slotwatch.observer", %date, "new closest slot");
			}
		}

		self.state.send_modify(|observation| {
			observation.slot = Some(candidate);
			observation.slot_generation += 1;
		});
	}

	pub fn record_time(&self, time: String) {
		debug!(target = "slotwatch.observer", %time, "time observed");
		self.state.send_modify(|observation| {
			observation.time = Some(time);
			observation.time_generation += 1;
		});
	}

	pub fn snapshot(&self) -> Observation {
		self.state.borrow().clone()
	}

	/// Waits until a slot newer than the one present at call time arrives, or
	/// `timeout` elapses. Returns the latest slot either way.
	pub async fn wait_for_fresh_observation(&self, timeout: Duration) -> Option<SlotCandidate> {
		let mut rx = self.state.subscribe();
		let start = rx.borrow_and_update().slot_generation;
		let fresh = tokio::time::timeout(timeout, rx.wait_for(|observation| observation.slot_generation > start))
			.await
			.is_ok();
		if !fresh {
			trace!(target = "slotwatch.observer", timeout_ms = timeout.as_millis() as u64, "no fresh observation");
		}
		self.snapshot().slot
	}

	/// Spawns the single writer: drains `responses` into this observer until the stream closes.
	pub fn spawn_pump(self: &Arc<Self>, mut responses: ResponseStream) -> JoinHandle<()> {
		let observer = Arc::clone(self);
		tokio::spawn(async move {
			while let Some(event) = responses.recv().await {
				observer.on_response(&event);
			}
			trace!(target = "slotwatch.observer", "response stream closed");
		})
	}
}
