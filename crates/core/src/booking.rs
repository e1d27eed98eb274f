//! Exclusive, bounded attempt to claim a slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::notify::{Event, EventSink};
use crate::observer::SlotObserver;
use crate::session::PortalSession;
use crate::slot::{DateWindow, SlotCandidate};

pub const MAX_ATTEMPTS: u32 = 3;

/// How often the time-wait re-reads the observer.
pub const TIME_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pause between two failed attempts.
pub const ATTEMPT_PAUSE: Duration = Duration::from_secs(1);

/// The time wait checks the session is still alive every this many polls.
pub const SESSION_CHECK_POLLS: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
	/// Confirmed: the submission form went away.
	Booked { date: NaiveDate, time: Option<String> },
	/// Every attempt failed; the session keeps monitoring.
	Exhausted { attempts: u32 },
	/// Outside the window. Nothing was touched.
	NotEligible,
	/// Another attempt holds the flag.
	AlreadyActive,
	/// The session transport went away mid-attempt; only a rebuild helps.
	SessionLost { reason: String },
}

/// Held while an attempt sequence runs; releases the exclusion flag on drop.
#[derive(Debug)]
pub struct BookingGuard {
	active: Arc<AtomicBool>,
}

impl Drop for BookingGuard {
	fn drop(&mut self) {
		self.active.store(false, Ordering::Release);
	}
}

/// Drives up to [`MAX_ATTEMPTS`] claims of one slot while the rest of the
/// engine stays quiet.
pub struct BookingCoordinator {
	window: DateWindow,
	max_attempts: u32,
	time_poll: Duration,
	attempt_pause: Duration,
	time_wait_limit: Option<Duration>,
	active: Arc<AtomicBool>,
	sink: Arc<dyn EventSink>,
}

impl BookingCoordinator {
	pub fn new(window: DateWindow, sink: Arc<dyn EventSink>) -> Self {
		Self {
			window,
			max_attempts: MAX_ATTEMPTS,
			time_poll: TIME_POLL_INTERVAL,
			attempt_pause: ATTEMPT_PAUSE,
			time_wait_limit: None,
			active: Arc::new(AtomicBool::new(false)),
			sink,
		}
	}

	/// Bounds the wait for a time to show up after selecting a date. Unbounded by default.
	pub fn with_time_wait_limit(mut self, limit: Duration) -> Self {
		self.time_wait_limit = Some(limit);
		self
	}

	pub fn window(&self) -> DateWindow {
		self.window
	}

	pub fn qualifies(&self, slot: &SlotCandidate) -> bool {
		self.window.contains(slot.date)
	}

	pub fn is_active(&self) -> bool {
		self.active.load(Ordering::Acquire)
	}

	/// Takes the exclusion flag, or `None` if an attempt is already running.
	pub fn try_begin(&self) -> Option<BookingGuard> {
		self.active
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| BookingGuard {
				active: Arc::clone(&self.active),
			})
	}

	/// Runs the attempt sequence for `slot`. Out-of-window slots return
	/// [`BookingOutcome::NotEligible`] without side effects.
	pub async fn attempt(&self, session: &dyn PortalSession, observer: &SlotObserver, slot: &SlotCandidate) -> BookingOutcome {
		if !self.qualifies(slot) {
			debug!(target = "slotwatch.booking", date = %slot.date, window = %self.window, "slot outside window");
			return BookingOutcome::NotEligible;
		}
		let Some(_guard) = self.try_begin() else {
			return BookingOutcome::AlreadyActive;
		};

		let date = slot.date;
		info!(target = "slotwatch.booking", %date, "booking started");
		self.sink.notify(Event::BookingStarted { date });

		for attempt in 1..=self.max_attempts {
			let mut selected_time = None;
			let mut submitted = false;
			let result = self.attempt_once(session, observer, date, &mut selected_time, &mut submitted).await;
			if let Err(err) = &result {
				warn!(target = "slotwatch.booking", attempt, submitted, error = %err, "booking attempt errored");
			}

			// Only a submission can make the form go away in our favour.
			if submitted {
				match session.booking_form_present().await {
					Ok(false) => {
						let time = selected_time.or_else(|| observer.snapshot().time);
						info!(target = "slotwatch.booking", %date, time = time.as_deref().unwrap_or("?"), attempt, "booking confirmed");
						self.sink.notify(Event::BookingSucceeded {
							date,
							time: time.clone().unwrap_or_default(),
						});
						return BookingOutcome::Booked { date, time };
					}
					Ok(true) => debug!(target = "slotwatch.booking", attempt, "submission form still present"),
					Err(Error::ConnectivityLost(reason)) => return self.session_lost(date, attempt, reason),
					Err(err) => warn!(target = "slotwatch.booking", attempt, error = %err, "could not read confirmation state"),
				}
			} else if let Err(Error::ConnectivityLost(reason)) = result {
				return self.session_lost(date, attempt, reason);
			}

			if attempt < self.max_attempts {
				tokio::time::sleep(self.attempt_pause).await;
			}
		}

		warn!(target = "slotwatch.booking", %date, attempts = self.max_attempts, "booking attempts exhausted");
		self.sink.notify(Event::BookingFailed {
			date,
			attempts: self.max_attempts,
		});
		BookingOutcome::Exhausted {
			attempts: self.max_attempts,
		}
	}

	fn session_lost(&self, date: NaiveDate, attempt: u32, reason: String) -> BookingOutcome {
		warn!(target = "slotwatch.booking", %date, attempt, %reason, "session lost during booking");
		BookingOutcome::SessionLost { reason }
	}

	/// One claim. `submitted` is set once the submit step has been reached.
	async fn attempt_once(
		&self,
		session: &dyn PortalSession,
		observer: &SlotObserver,
		date: NaiveDate,
		selected_time: &mut Option<String>,
		submitted: &mut bool,
	) -> Result<()> {
		let baseline = observer.snapshot().time_generation;
		session.select_date(date).await?;
		let time = self.wait_for_time(session, observer, baseline).await?;
		debug!(target = "slotwatch.booking", %date, %time, "time available");
		session.select_time(&time).await?;
		*selected_time = Some(time);
		*submitted = true;
		session.submit_booking().await
	}

	/// Waits for a time observation newer than `baseline`. Ends early once
	/// the session stops answering.
	async fn wait_for_time(&self, session: &dyn PortalSession, observer: &SlotObserver, baseline: u64) -> Result<String> {
		let started = Instant::now();
		let mut polls = 0u32;
		loop {
			let snapshot = observer.snapshot();
			if snapshot.time_generation > baseline {
				if let Some(time) = snapshot.time {
					return Ok(time);
				}
			}
			if let Some(limit) = self.time_wait_limit {
				if started.elapsed() >= limit {
					return Err(Error::BookingAttemptFailed(format!("no time offered within {}s", limit.as_secs())));
				}
			}
			tokio::time::sleep(self.time_poll).await;
			polls += 1;
			if polls % SESSION_CHECK_POLLS == 0 {
				session.probe().await?;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::slot::parse_date;
	use crate::testing::{FakePortal, FakePortalHandle, FixedClock, RecordingSink, SubmitScript};

	fn d(raw: &str) -> NaiveDate {
		parse_date(raw).unwrap()
	}

	struct Rig {
		portal: FakePortal,
		handle: FakePortalHandle,
		observer: Arc<SlotObserver>,
		sink: Arc<RecordingSink>,
		coordinator: BookingCoordinator,
		pump: tokio::task::JoinHandle<()>,
	}

	fn rig() -> Rig {
		let clock = Arc::new(FixedClock::on(d("2026-01-01")));
		let (portal, handle) = FakePortal::new();
		let observer = Arc::new(SlotObserver::new(clock, None));
		let pump = observer.spawn_pump(handle.take_responses().unwrap());
		let sink = Arc::new(RecordingSink::new());
		let window = DateWindow::new(d("2026-01-01"), d("2026-03-31")).unwrap();
		let coordinator = BookingCoordinator::new(window, sink.clone());
		Rig {
			portal,
			handle,
			observer,
			sink,
			coordinator,
			pump,
		}
	}

	fn slot(raw: &str) -> SlotCandidate {
		SlotCandidate::new(d(raw), chrono::Utc::now())
	}

	#[tokio::test(start_paused = true)]
	async fn out_of_window_slot_is_never_entered() {
		let rig = rig();
		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-04-01")).await;
		assert_eq!(outcome, BookingOutcome::NotEligible);
		assert!(rig.handle.selected_dates().is_empty());
		assert!(rig.sink.events().is_empty());
		assert!(!rig.coordinator.is_active());
		rig.pump.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn confirmed_submission_books() {
		let rig = rig();
		rig.handle.set_times(&["10:15", "11:00"]).push_submit(SubmitScript::Confirms);

		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-02-10")).await;

		assert_eq!(
			outcome,
			BookingOutcome::Booked {
				date: d("2026-02-10"),
				time: Some("10:15".into()),
			}
		);
		assert_eq!(rig.handle.selected_times(), vec!["10:15".to_string()]);
		assert_eq!(rig.sink.names(), vec!["booking_started", "booking_succeeded"]);
		rig.pump.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn exhaustion_after_three_rejections_releases_the_flag() {
		let rig = rig();

		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-02-10")).await;

		assert_eq!(outcome, BookingOutcome::Exhausted { attempts: 3 });
		assert_eq!(rig.handle.submits(), 3);
		assert_eq!(rig.handle.selected_dates().len(), 3);
		assert!(!rig.coordinator.is_active());
		assert_eq!(
			rig.sink.events().last(),
			Some(&Event::BookingFailed {
				date: d("2026-02-10"),
				attempts: 3,
			})
		);
		rig.pump.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn errored_submission_that_went_through_counts_as_booked() {
		let rig = rig();
		rig.handle.push_submit(SubmitScript::ErrorsAfterSubmit);

		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-03-31")).await;

		assert!(matches!(outcome, BookingOutcome::Booked { .. }));
		assert_eq!(rig.handle.submits(), 1);
		rig.pump.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn errored_submission_that_did_not_go_through_retries() {
		let rig = rig();
		rig.handle
			.push_submit(SubmitScript::ErrorsBeforeSubmit)
			.push_submit(SubmitScript::Confirms);

		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-01-01")).await;

		assert!(matches!(outcome, BookingOutcome::Booked { .. }));
		assert_eq!(rig.handle.submits(), 2);
		rig.pump.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn bounded_time_wait_fails_the_attempt() {
		let mut rig = rig();
		rig.handle.set_times(&[]);
		rig.coordinator = rig.coordinator.with_time_wait_limit(Duration::from_secs(2));

		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-02-10")).await;

		assert_eq!(outcome, BookingOutcome::Exhausted { attempts: 3 });
		assert_eq!(rig.handle.submits(), 0);
		rig.pump.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn vanished_form_without_a_submission_is_not_a_booking() {
		let rig = rig();
		rig.handle.set_form_present(false);
		for _ in 0..MAX_ATTEMPTS {
			rig.handle.fail_date_selection(Error::Driver("date picker detached".into()));
		}

		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-02-10")).await;

		assert_eq!(outcome, BookingOutcome::Exhausted { attempts: 3 });
		assert_eq!(rig.handle.submits(), 0);
		assert_eq!(rig.sink.names(), vec!["booking_started", "booking_failed"]);
		rig.pump.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn dead_session_ends_the_time_wait() {
		let rig = rig();
		rig.handle.set_times(&[]).fail_probes_after(0);

		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-02-10")).await;

		assert_eq!(
			outcome,
			BookingOutcome::SessionLost {
				reason: "probe failed".into(),
			}
		);
		assert_eq!(rig.handle.probes(), 1);
		assert_eq!(rig.handle.submits(), 0);
		assert_eq!(rig.handle.selected_dates().len(), 1);
		assert!(!rig.coordinator.is_active());
		assert_eq!(rig.sink.names(), vec!["booking_started"]);
		rig.pump.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn connectivity_loss_before_submit_stops_retrying() {
		let rig = rig();
		rig.handle
			.set_form_present(false)
			.fail_date_selection(Error::ConnectivityLost("socket closed".into()));

		let outcome = rig.coordinator.attempt(&rig.portal, &rig.observer, &slot("2026-02-10")).await;

		assert!(matches!(outcome, BookingOutcome::SessionLost { ref reason } if reason == "socket closed"));
		assert_eq!(rig.handle.selected_dates().len(), 1);
		assert_eq!(rig.handle.submits(), 0);
		rig.pump.abort();
	}

	#[test]
	fn only_one_guard_at_a_time() {
		let sink = Arc::new(RecordingSink::new());
		let window = DateWindow::new(d("2026-01-01"), d("2026-03-31")).unwrap();
		let coordinator = BookingCoordinator::new(window, sink);
		let guard = coordinator.try_begin().unwrap();
		assert!(coordinator.is_active());
		assert!(coordinator.try_begin().is_none());
		drop(guard);
		assert!(!coordinator.is_active());
		assert!(coordinator.try_begin().is_some());
	}
}
