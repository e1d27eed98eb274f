//! Primary session state machine.
//!
//! [`SessionSupervisor::run`] is a flat loop: open a session from scratch,
//! authenticate, navigate, monitor, and on any restart-worthy condition tear
//! everything down and start over after a fixed backoff. Only a booking, a
//! ban, a busy cooldown or a fatal error leave the loop.
//!
//! Monitoring cycle, in order: collect a finished verification, start a due
//! one, rotate credentials when scheduled, probe liveness, read page signals,
//! book a newly observed in-window slot, tick, wait for an observation, sleep.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::booking::{BookingCoordinator, BookingOutcome};
use crate::clock::Clock;
use crate::config::{EngineConfig, Timings};
use crate::error::Error;
use crate::governor::AccountGovernor;
use crate::notify::{Event, EventSink};
use crate::observer::SlotObserver;
use crate::poll::{Cadence, PollDriver};
use crate::session::{Credentials, NetworkIdentity, OpenedSession, PortalSession, ProxyEndpoint, SessionFactory, SessionState, navigate_to_facility};
use crate::signals::PageSignal;
use crate::slot::{ClosestSlotTracker, DateWindow, SlotCandidate};
use crate::verify::{FreshnessVerifier, VerificationVerdict, VerifySchedule};

/// Unclassified monitoring errors tolerated in a row before a restart.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Busy signals in a row, with no observation in between, that end the run.
pub const BUSY_ESCALATION: u32 = 3;

/// Minimum spacing of status digests.
pub const DIGEST_INTERVAL: Duration = Duration::from_secs(60);

/// Why [`SessionSupervisor::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
	Booked { date: NaiveDate, time: Option<String> },
	CredentialBanned { email: String, reason: String },
	SystemBusyCooldown { until: DateTime<Utc> },
	Fatal(String),
}

impl ExitReason {
	/// Process exit code for an external launcher.
	pub fn exit_code(&self) -> i32 {
		match self {
			ExitReason::Booked { .. } => 0,
			ExitReason::Fatal(_) => 1,
			ExitReason::CredentialBanned { .. } => 2,
			ExitReason::SystemBusyCooldown { .. } => 3,
		}
	}
}

impl fmt::Display for ExitReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ExitReason::Booked { date, time } => write!(f, "booked {date} {}", time.as_deref().unwrap_or("")),
			ExitReason::CredentialBanned { email, reason } => write!(f, "credential {email} banned: {reason}"),
			ExitReason::SystemBusyCooldown { until } => write!(f, "system busy, cooling down until {until}"),
			ExitReason::Fatal(reason) => write!(f, "fatal: {reason}"),
		}
	}
}

/// Condition that tears the session down and rebuilds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartCause {
	Stale,
	ConnectivityLost(String),
	SessionExpired,
	Error(String),
}

impl fmt::Display for RestartCause {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RestartCause::Stale => f.write_str("stale data"),
			RestartCause::ConnectivityLost(reason) => write!(f, "connection lost: {reason}"),
			RestartCause::SessionExpired => f.write_str("session expired"),
			RestartCause::Error(reason) => write!(f, "error: {reason}"),
		}
	}
}

enum SessionEnd {
	Exit(ExitReason),
	Restart(RestartCause),
}

/// Verification task that is aborted if the session ends first.
struct PendingVerification(JoinHandle<VerificationVerdict>);

impl Drop for PendingVerification {
	fn drop(&mut self) {
		self.0.abort();
	}
}

/// Per-session loop state.
struct Monitor {
	poll: PollDriver,
	schedule: Option<VerifySchedule>,
	verification: Option<PendingVerification>,
	rotation_due: Instant,
	next_digest: Instant,
	errors: u32,
	busy_streak: u32,
	seen_generation: u64,
	cycles: u64,
}

/// Owns the primary session's lifecycle.
pub struct SessionSupervisor {
	factory: Arc<dyn SessionFactory>,
	credentials: Credentials,
	facility: String,
	window: DateWindow,
	proxy: Option<ProxyEndpoint>,
	cadence: Cadence,
	timings: Timings,
	clock: Arc<dyn Clock>,
	governor: Arc<AccountGovernor>,
	sink: Arc<dyn EventSink>,
	booking: BookingCoordinator,
	verifier: Option<(Arc<FreshnessVerifier>, Duration)>,
	tracker: Arc<Mutex<ClosestSlotTracker>>,
	state: watch::Sender<SessionState>,
	history: Mutex<Vec<SessionState>>,
	restarts: AtomicU32,
}

impl SessionSupervisor {
	pub fn new(
		config: &EngineConfig,
		factory: Arc<dyn SessionFactory>,
		clock: Arc<dyn Clock>,
		governor: Arc<AccountGovernor>,
		sink: Arc<dyn EventSink>,
	) -> Self {
		let verifier = config.verify.as_ref().map(|verify| {
			let verifier = FreshnessVerifier::new(
				Arc::clone(&factory),
				verify.credentials.clone(),
				config.facility.clone(),
				Arc::clone(&clock),
				Arc::clone(&governor),
				Arc::clone(&sink),
			)
			.with_proxy(config.proxy.clone());
			(Arc::new(verifier), verify.interval)
		});
		let (state, _) = watch::channel(SessionState::Unauthenticated);

		Self {
			booking: BookingCoordinator::new(config.window, Arc::clone(&sink)),
			factory,
			credentials: config.primary.clone(),
			facility: config.facility.clone(),
			window: config.window,
			proxy: config.proxy.clone(),
			cadence: config.cadence,
			timings: config.timings,
			clock,
			governor,
			sink,
			verifier,
			tracker: Arc::new(Mutex::new(ClosestSlotTracker::new())),
			state,
			history: Mutex::new(vec![SessionState::Unauthenticated]),
			restarts: AtomicU32::new(0),
		}
	}

	pub fn with_booking(mut self, booking: BookingCoordinator) -> Self {
		self.booking = booking;
		self
	}

	pub fn state(&self) -> SessionState {
		*self.state.borrow()
	}

	pub fn subscribe(&self) -> watch::Receiver<SessionState> {
		self.state.subscribe()
	}

	/// Every state transition so far, in order, starting from `Unauthenticated`.
	pub fn history(&self) -> Vec<SessionState> {
		self.history.lock().clone()
	}

	pub fn restarts(&self) -> u32 {
		self.restarts.load(Ordering::Relaxed)
	}

	pub fn closest_slot(&self) -> Option<SlotCandidate> {
		self.tracker.lock().closest().cloned()
	}

	fn set_state(&self, next: SessionState) {
		let previous = self.state.send_replace(next);
		if previous != next {
			debug!(target = "slotwatch.supervisor", from = %previous, to = %next, "state");
			self.history.lock().push(next);
		}
	}

	/// Runs sessions until one ends the process.
	pub async fn run(&self) -> ExitReason {
		info!(
			target = "slotwatch.supervisor",
			email = %self.credentials.email,
			facility = %self.facility,
			window = %self.window,
			verification = self.verifier.is_some(),
			"supervisor started"
		);
		self.sink.notify(Event::BotStarted {
			email: self.credentials.email.clone(),
			facility: self.facility.clone(),
			window: self.window,
		});
		if let Some(until) = self.governor.cooldown_until(&self.credentials.email) {
			warn!(target = "slotwatch.supervisor", %until, "credential has an active cooldown");
		}

		loop {
			if let Some(ban) = self.governor.ban_record(&self.credentials.email) {
				self.set_state(SessionState::Terminated);
				error!(target = "slotwatch.supervisor", email = %ban.email, reason = %ban.reason, "credential is banned; stopping");
				return ExitReason::CredentialBanned {
					email: ban.email,
					reason: ban.reason,
				};
			}

			match self.run_once().await {
				SessionEnd::Exit(reason) => {
					self.set_state(SessionState::Terminated);
					info!(target = "slotwatch.supervisor", %reason, "supervisor finished");
					return reason;
				}
				SessionEnd::Restart(cause) => {
					self.set_state(SessionState::Terminated);
					let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
					warn!(
						target = "slotwatch.supervisor",
						%cause,
						restarts,
						backoff_s = self.timings.restart_backoff.as_secs(),
						"rebuilding session"
					);
					self.sink.notify(Event::RestartScheduled {
						cause: cause.to_string(),
						restarts,
					});
					tokio::time::sleep(self.timings.restart_backoff).await;
				}
			}
		}
	}

	/// One session from open to teardown.
	async fn run_once(&self) -> SessionEnd {
		self.set_state(SessionState::Unauthenticated);
		let identity = NetworkIdentity::fresh(self.proxy.clone());
		debug!(target = "slotwatch.supervisor", token = %identity.session_token, "opening session");

		let OpenedSession { session, responses } = match self.factory.open(&identity).await {
			Ok(opened) => opened,
			Err(err) => return self.end_for(err),
		};
		let observer = Arc::new(SlotObserver::new(Arc::clone(&self.clock), Some(Arc::clone(&self.tracker))));
		let pump = observer.spawn_pump(responses);

		let end = self.drive(session.as_ref(), &observer, &identity).await;

		if let Err(err) = session.close().await {
			debug!(target = "slotwatch.supervisor", error = %err, "closing session failed");
		}
		pump.abort();
		end
	}

	async fn drive(&self, session: &dyn PortalSession, observer: &Arc<SlotObserver>, identity: &NetworkIdentity) -> SessionEnd {
		if let Err(end) = self.authenticate(session).await {
			return end;
		}
		if let Err(end) = self.navigate(session).await {
			return end;
		}
		self.monitor(session, observer, identity).await
	}

	async fn authenticate(&self, session: &dyn PortalSession) -> Result<(), SessionEnd> {
		self.set_state(SessionState::Authenticating);
		match session.login(&self.credentials).await {
			Ok(()) => {
				self.governor.record_auth_success(&self.credentials.email);
				info!(target = "slotwatch.supervisor", email = %self.credentials.email, "logged in");
				self.sink.notify(Event::LoggedIn {
					email: self.credentials.email.clone(),
				});
				Ok(())
			}
			Err(err) => {
				warn!(target = "slotwatch.supervisor", error = %err, kind = err.kind(), "login failed");
				match self.governor.record_login_error(&self.credentials.email, &err) {
					Ok(Some(ban)) => Err(self.banned(ban.email, ban.reason)),
					Ok(None) => Err(self.end_for(err)),
					Err(ledger) => Err(SessionEnd::Exit(ExitReason::Fatal(format!("ledger update failed: {ledger}")))),
				}
			}
		}
	}

	async fn navigate(&self, session: &dyn PortalSession) -> Result<(), SessionEnd> {
		self.set_state(SessionState::Navigating);
		match navigate_to_facility(session, &self.facility).await {
			Ok(option) => {
				info!(target = "slotwatch.supervisor", facility = %option, "monitoring");
				self.set_state(SessionState::Monitoring);
				Ok(())
			}
			Err(err) => Err(self.end_for(err)),
		}
	}

	async fn monitor(&self, session: &dyn PortalSession, observer: &Arc<SlotObserver>, identity: &NetworkIdentity) -> SessionEnd {
		let now = Instant::now();
		let mut m = Monitor {
			poll: PollDriver::new(self.cadence, Arc::clone(&self.clock)),
			schedule: self.verifier.as_ref().map(|(_, interval)| VerifySchedule::new(*interval)),
			verification: None,
			rotation_due: now + self.timings.rotation,
			next_digest: now + DIGEST_INTERVAL,
			errors: 0,
			busy_streak: 0,
			seen_generation: 0,
			cycles: 0,
		};

		loop {
			m.cycles += 1;

			if let Some(end) = self.collect_verification(&mut m).await {
				return end;
			}
			self.start_verification(&mut m, observer, identity);

			if Instant::now() >= m.rotation_due {
				info!(target = "slotwatch.supervisor", "scheduled credential rotation");
				self.set_state(SessionState::Unauthenticated);
				if let Err(end) = self.authenticate(session).await {
					return end;
				}
				if let Err(end) = self.navigate(session).await {
					return end;
				}
				m.rotation_due = Instant::now() + self.timings.rotation;
			}

			if m.cycles % self.timings.liveness_every_cycles.max(1) == 0 {
				if let Err(err) = session.probe().await {
					return self.connection_lost(err.to_string());
				}
			}

			match session.page_text().await {
				Ok(text) => match PageSignal::from_text(&text) {
					PageSignal::AccountLocked => {
						return match self.governor.ban(&self.credentials.email, "account locked") {
							Ok(ban) => self.banned(ban.email, ban.reason),
							Err(ledger) => SessionEnd::Exit(ExitReason::Fatal(format!("ledger update failed: {ledger}"))),
						};
					}
					PageSignal::SessionExpired => {
						warn!(target = "slotwatch.supervisor", "session expired");
						self.sink.notify(Event::SessionExpired);
						return SessionEnd::Restart(RestartCause::SessionExpired);
					}
					PageSignal::SystemBusy => {
						if let Some(end) = self.on_busy(&mut m).await {
							return end;
						}
						continue;
					}
					PageSignal::Clear => {}
				},
				Err(err) => {
					if let Some(end) = self.on_error(err, &mut m.errors) {
						return end;
					}
					tokio::time::sleep(self.cadence.delay()).await;
					continue;
				}
			}

			let snapshot = observer.snapshot();
			if snapshot.slot_generation > m.seen_generation {
				m.seen_generation = snapshot.slot_generation;
				m.busy_streak = 0;
				if let Some(slot) = snapshot.slot.filter(|slot| self.booking.qualifies(slot)) {
					if let Some(end) = self.book(session, observer, &slot, &mut m).await {
						return end;
					}
				}
			}

			if let Err(err) = m.poll.tick(session).await {
				if let Some(end) = self.on_error(err, &mut m.errors) {
					return end;
				}
				tokio::time::sleep(self.cadence.delay()).await;
				continue;
			}
			m.errors = 0;

			observer.wait_for_fresh_observation(self.timings.observation_timeout).await;
			let snapshot = observer.snapshot();
			let latency = m.poll.latency(&snapshot);
			if let Some(latency) = latency {
				debug!(
					target = "slotwatch.supervisor",
					date = ?snapshot.slot_date(),
					latency_ms = latency.as_millis() as u64,
					"observation"
				);
			}

			if Instant::now() >= m.next_digest {
				m.next_digest = Instant::now() + DIGEST_INTERVAL;
				self.sink.notify(Event::StatusDigest {
					cycles: m.poll.ticks(),
					latest: snapshot.slot_date(),
					closest: self.closest_slot().map(|slot| slot.date),
					latency_ms: latency.map(|latency| latency.as_millis() as u64),
					restarts: self.restarts(),
				});
			}

			tokio::time::sleep(self.cadence.delay()).await;
		}
	}

	async fn collect_verification(&self, m: &mut Monitor) -> Option<SessionEnd> {
		if !m.verification.as_ref().is_some_and(|pending| pending.0.is_finished()) {
			return None;
		}
		let mut pending = m.verification.take()?;
		if let Some(schedule) = m.schedule.as_mut() {
			schedule.reset();
		}
		match (&mut pending.0).await {
			Ok(verdict) if verdict.is_stale() => Some(SessionEnd::Restart(RestartCause::Stale)),
			Ok(_) => None,
			Err(join) => {
				warn!(target = "slotwatch.supervisor", error = %join, "verification task failed");
				None
			}
		}
	}

	fn start_verification(&self, m: &mut Monitor, observer: &Arc<SlotObserver>, identity: &NetworkIdentity) {
		if m.verification.is_some() || self.booking.is_active() {
			return;
		}
		let (Some((verifier, _)), Some(schedule)) = (self.verifier.as_ref(), m.schedule.as_mut()) else {
			return;
		};
		if !schedule.is_due() {
			return;
		}
		if !verifier.is_enabled() {
			warn!(target = "slotwatch.supervisor", email = %verifier.email(), "verification credential banned; verification disabled");
			m.schedule = None;
			return;
		}

		let verifier = Arc::clone(verifier);
		let observer = Arc::clone(observer);
		let identity = identity.clone();
		m.verification = Some(PendingVerification(tokio::spawn(async move { verifier.verify(&observer, &identity).await })));
	}

	async fn book(&self, session: &dyn PortalSession, observer: &SlotObserver, slot: &SlotCandidate, m: &mut Monitor) -> Option<SessionEnd> {
		info!(target = "slotwatch.supervisor", date = %slot.date, "slot in window");
		self.sink.notify(Event::SlotDetected { date: slot.date });

		if m.verification.take().is_some() {
			debug!(target = "slotwatch.supervisor", "verification aborted for booking");
			if let Some(schedule) = m.schedule.as_mut() {
				schedule.reset();
			}
		}

		self.set_state(SessionState::Booking);
		match self.booking.attempt(session, observer, slot).await {
			BookingOutcome::Booked { date, time } => Some(SessionEnd::Exit(ExitReason::Booked { date, time })),
			BookingOutcome::SessionLost { reason } => Some(self.connection_lost(reason)),
			BookingOutcome::Exhausted { .. } | BookingOutcome::NotEligible | BookingOutcome::AlreadyActive => {
				self.set_state(SessionState::Monitoring);
				None
			}
		}
	}

	async fn on_busy(&self, m: &mut Monitor) -> Option<SessionEnd> {
		m.busy_streak += 1;
		let now = self.clock.now();
		if m.busy_streak >= BUSY_ESCALATION {
			let until = now + TimeDelta::from_std(self.timings.cooldown).unwrap_or(TimeDelta::minutes(30));
			warn!(target = "slotwatch.supervisor", streak = m.busy_streak, %until, "system busy persists; cooling down");
			if let Err(ledger) = self.governor.set_cooldown(&self.credentials.email, "system busy", until) {
				warn!(target = "slotwatch.supervisor", error = %ledger, "ledger update failed");
			}
			self.sink.notify(Event::SystemBusyCooldown { until, escalated: true });
			return Some(SessionEnd::Exit(ExitReason::SystemBusyCooldown { until }));
		}

		let until = now + TimeDelta::from_std(self.timings.busy_pause).unwrap_or(TimeDelta::seconds(60));
		info!(target = "slotwatch.supervisor", streak = m.busy_streak, pause_s = self.timings.busy_pause.as_secs(), "system busy; pausing");
		self.sink.notify(Event::SystemBusyCooldown { until, escalated: false });
		tokio::time::sleep(self.timings.busy_pause).await;
		None
	}

	/// Monitoring-loop error policy: connectivity restarts at once, anything
	/// unclassified is tolerated up to the budget.
	fn on_error(&self, err: Error, errors: &mut u32) -> Option<SessionEnd> {
		if err.is_connectivity() || matches!(err, Error::Config(_) | Error::AccountLocked(_)) {
			return Some(self.end_for(err));
		}
		*errors += 1;
		warn!(target = "slotwatch.supervisor", error = %err, kind = err.kind(), consecutive = *errors, "monitoring error");
		if *errors > MAX_CONSECUTIVE_ERRORS {
			return Some(SessionEnd::Restart(RestartCause::Error(err.to_string())));
		}
		None
	}

	/// Maps an error that ends the session onto exit or restart.
	fn end_for(&self, err: Error) -> SessionEnd {
		match err {
			Error::Config(reason) => SessionEnd::Exit(ExitReason::Fatal(reason)),
			Error::Io(err) => SessionEnd::Exit(ExitReason::Fatal(err.to_string())),
			Error::AccountLocked(reason) => match self.governor.ban(&self.credentials.email, &format!("account locked: {reason}")) {
				Ok(ban) => self.banned(ban.email, ban.reason),
				Err(ledger) => SessionEnd::Exit(ExitReason::Fatal(format!("ledger update failed: {ledger}"))),
			},
			Error::ConnectivityLost(reason) => self.connection_lost(reason),
			Error::StaleData { .. } => SessionEnd::Restart(RestartCause::Stale),
			other => SessionEnd::Restart(RestartCause::Error(other.to_string())),
		}
	}

	fn connection_lost(&self, reason: String) -> SessionEnd {
		warn!(target = "slotwatch.supervisor", %reason, "connection lost");
		self.sink.notify(Event::ConnectionLost { reason: reason.clone() });
		SessionEnd::Restart(RestartCause::ConnectivityLost(reason))
	}

	fn banned(&self, email: String, reason: String) -> SessionEnd {
		error!(target = "slotwatch.supervisor", %email, %reason, "credential banned");
		self.sink.notify(Event::AccountBanned {
			email: email.clone(),
			reason: reason.clone(),
		});
		SessionEnd::Exit(ExitReason::CredentialBanned { email, reason })
	}
}
