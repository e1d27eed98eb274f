//! Out-of-band freshness verification.
//!
//! The remote service serves cached results to some sessions. Periodically a
//! second session, under different credentials and a different network
//! identity, runs the same query; if it disagrees with the primary, the primary
//! is stale and gets rebuilt. A verification that fails to produce a date
//! never counts as stale.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::governor::AccountGovernor;
use crate::notify::{Event, EventSink};
use crate::observer::SlotObserver;
use crate::session::{Credentials, NetworkIdentity, OpenedSession, PortalSession, ProxyEndpoint, SessionFactory, navigate_to_facility};

/// Fixed wait after navigation for the verification session to see a response.
pub const SETTLE_PERIOD: Duration = Duration::from_secs(3);

/// Bound on one whole verification, from login to captured date.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(90);

/// Staleness rule. Absence on the verifier side proves nothing; absence on the
/// primary side while the verifier sees a date means the primary is behind.
pub fn is_fresh(primary: Option<NaiveDate>, secondary: Option<NaiveDate>) -> bool {
	match (primary, secondary) {
		(_, None) => true,
		(Some(primary), Some(secondary)) => primary == secondary,
		(None, Some(_)) => false,
	}
}

/// Outcome of one verification cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationVerdict {
	pub primary_date: Option<NaiveDate>,
	pub secondary_date: Option<NaiveDate>,
	pub fresh: bool,
	pub compared_at: DateTime<Utc>,
	/// Set when the verification session failed before producing a comparison.
	pub failure: Option<String>,
}

impl VerificationVerdict {
	pub fn compare(primary_date: Option<NaiveDate>, secondary_date: Option<NaiveDate>, compared_at: DateTime<Utc>) -> Self {
		Self {
			primary_date,
			secondary_date,
			fresh: is_fresh(primary_date, secondary_date),
			compared_at,
			failure: None,
		}
	}

	/// A failed verification is reported but counts as fresh.
	pub fn failed(primary_date: Option<NaiveDate>, reason: impl Into<String>, compared_at: DateTime<Utc>) -> Self {
		Self {
			primary_date,
			secondary_date: None,
			fresh: true,
			compared_at,
			failure: Some(reason.into()),
		}
	}

	pub fn is_stale(&self) -> bool {
		!self.fresh
	}
}

/// Verification timer. Reset after every run, successful or not, so failures
/// cannot cause a storm of back-to-back verifications.
#[derive(Debug, Clone, Copy)]
pub struct VerifySchedule {
	interval: Duration,
	next_due: Instant,
}

impl VerifySchedule {
	/// First run is due one full interval from now.
	pub fn new(interval: Duration) -> Self {
		Self {
			interval,
			next_due: Instant::now() + interval,
		}
	}

	pub fn interval(&self) -> Duration {
		self.interval
	}

	pub fn is_due(&self) -> bool {
		Instant::now() >= self.next_due
	}

	pub fn reset(&mut self) {
		self.next_due = Instant::now() + self.interval;
	}
}

/// Runs one isolated verification session per call.
pub struct FreshnessVerifier {
	factory: Arc<dyn SessionFactory>,
	credentials: Credentials,
	facility: String,
	proxy: Option<ProxyEndpoint>,
	clock: Arc<dyn Clock>,
	governor: Arc<AccountGovernor>,
	sink: Arc<dyn EventSink>,
	settle: Duration,
	timeout: Duration,
}

impl FreshnessVerifier {
	pub fn new(
		factory: Arc<dyn SessionFactory>,
		credentials: Credentials,
		facility: impl Into<String>,
		clock: Arc<dyn Clock>,
		governor: Arc<AccountGovernor>,
		sink: Arc<dyn EventSink>,
	) -> Self {
		Self {
			factory,
			credentials,
			facility: facility.into(),
			proxy: None,
			clock,
			governor,
			sink,
			settle: SETTLE_PERIOD,
			timeout: DEFAULT_VERIFY_TIMEOUT,
		}
	}

	pub fn with_proxy(mut self, proxy: Option<ProxyEndpoint>) -> Self {
		self.proxy = proxy;
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn email(&self) -> &str {
		&self.credentials.email
	}

	/// False once the verification credential has been banned.
	pub fn is_enabled(&self) -> bool {
		!self.governor.is_banned(&self.credentials.email)
	}

	/// Opens a verification session, captures its slot date and compares it
	/// with what `primary` holds at that moment. The session is always closed.
	pub async fn verify(&self, primary: &SlotObserver, primary_identity: &NetworkIdentity) -> VerificationVerdict {
		let identity = self.distinct_identity(primary_identity);
		info!(target = "slotwatch.verify", email = %self.credentials.email, token = %identity.session_token, "verification started");

		let secondary = match self.factory.open(&identity).await {
			Ok(opened) => self.run_session(opened).await,
			Err(err) => Err(err),
		};

		let primary_date = primary.snapshot().slot_date();
		let now = self.clock.now();
		let verdict = match secondary {
			Ok(secondary_date) => VerificationVerdict::compare(primary_date, secondary_date, now),
			Err(err) => {
				warn!(target = "slotwatch.verify", error = %err, kind = err.kind(), "verification failed; treating data as fresh");
				self.sink.notify(Event::VerificationFailed { reason: err.to_string() });
				return VerificationVerdict::failed(primary_date, err.to_string(), now);
			}
		};

		if verdict.fresh {
			info!(target = "slotwatch.verify", primary = ?verdict.primary_date, secondary = ?verdict.secondary_date, "data fresh");
			self.sink.notify(Event::DataFresh { date: verdict.primary_date });
		} else {
			warn!(target = "slotwatch.verify", primary = ?verdict.primary_date, secondary = ?verdict.secondary_date, "stale data detected");
			self.sink.notify(Event::StaleDataDetected {
				primary: verdict.primary_date,
				secondary: verdict.secondary_date,
			});
		}
		verdict
	}

	fn distinct_identity(&self, primary: &NetworkIdentity) -> NetworkIdentity {
		loop {
			let identity = NetworkIdentity::fresh(self.proxy.clone());
			if identity.session_token != primary.session_token {
				return identity;
			}
		}
	}

	async fn run_session(&self, opened: OpenedSession) -> Result<Option<NaiveDate>> {
		let OpenedSession { session, responses } = opened;
		let observer = Arc::new(SlotObserver::new(Arc::clone(&self.clock), None));
		let pump = observer.spawn_pump(responses);

		let outcome = match tokio::time::timeout(self.timeout, self.capture(session.as_ref(), &observer)).await {
			Ok(outcome) => outcome,
			Err(_) => Err(Error::VerificationFailed(format!("timed out after {}s", self.timeout.as_secs()))),
		};

		if let Err(err) = session.close().await {
			debug!(target = "slotwatch.verify", error = %err, "closing verification session failed");
		}
		pump.abort();
		outcome
	}

	async fn capture(&self, session: &dyn PortalSession, observer: &SlotObserver) -> Result<Option<NaiveDate>> {
		if let Err(err) = session.login(&self.credentials).await {
			match self.governor.record_login_error(&self.credentials.email, &err) {
				Ok(Some(ban)) => self.sink.notify(Event::AccountBanned {
					email: ban.email,
					reason: ban.reason,
				}),
				Ok(None) => {}
				Err(ledger) => warn!(target = "slotwatch.verify", error = %ledger, "ledger update failed"),
			}
			return Err(err);
		}
		self.governor.record_auth_success(&self.credentials.email);

		navigate_to_facility(session, &self.facility).await?;
		tokio::time::sleep(self.settle).await;
		let date = observer.snapshot().slot_date();
		debug!(target = "slotwatch.verify", secondary = ?date, "verification session settled");
		Ok(date)
	}
}
