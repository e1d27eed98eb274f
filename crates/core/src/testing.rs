//! In-memory doubles for exercising the engine without a browser.
//!
//! [`FakePortal`] plays the remote service: it answers logins from a script,
//! emits availability and time responses on its stream, and records every
//! action. [`FakeFactory`] hands scripted portals out in order and remembers
//! the network identity each was opened with.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::notify::{Event, EventSink};
use crate::session::{Credentials, NetworkIdentity, OpenedSession, PortalSession, ResponseEvent, ResponseStream, SessionFactory};
use crate::slot::DATE_FORMAT;

const DAYS_URL: &str = "https://portal.test/schedule/appointment/days/1.json?appointments[expedite]=false";

/// Clock pinned to a settable instant.
pub struct FixedClock {
	now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
	/// Noon UTC on `today`.
	pub fn on(today: NaiveDate) -> Self {
		let noon = today.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default()).and_utc();
		Self { now: Mutex::new(noon) }
	}

	pub fn advance(&self, by: TimeDelta) {
		*self.now.lock() += by;
	}
}

impl Clock for FixedClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.lock()
	}

	fn today(&self) -> NaiveDate {
		self.now.lock().date_naive()
	}
}

/// Collects every event raised.
#[derive(Default)]
pub struct RecordingSink {
	events: Mutex<Vec<Event>>,
}

impl RecordingSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn events(&self) -> Vec<Event> {
		self.events.lock().clone()
	}

	pub fn names(&self) -> Vec<&'static str> {
		self.events.lock().iter().map(Event::name).collect()
	}

	pub fn count(&self, name: &str) -> usize {
		self.events.lock().iter().filter(|event| event.name() == name).count()
	}
}

impl EventSink for RecordingSink {
	fn notify(&self, event: Event) {
		self.events.lock().push(event);
	}
}

/// Scripted outcome of one booking submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitScript {
	/// Submission accepted; the form goes away.
	Confirms,
	/// Submission rejected; the form stays.
	Rejected,
	/// The local step errors but the submission went through.
	ErrorsAfterSubmit,
	/// The local step errors and nothing was submitted.
	ErrorsBeforeSubmit,
}

struct PortalScript {
	logins: VecDeque<Result<()>>,
	facilities: Vec<String>,
	availability: VecDeque<Option<NaiveDate>>,
	steady: Option<NaiveDate>,
	requery_failures: u32,
	times: Vec<String>,
	submits: VecDeque<SubmitScript>,
	form_present: bool,
	date_failures: VecDeque<Error>,
	expire_on_date: bool,
	page_texts: VecDeque<String>,
	page_text: String,
	probe_failures_after: Option<u32>,
	disconnected: bool,

	login_attempts: u32,
	requeries: u32,
	probes: u32,
	selected_facility: Option<String>,
	selected_dates: Vec<NaiveDate>,
	selected_times: Vec<String>,
	submitted: u32,
	closed: bool,
}

impl Default for PortalScript {
	fn default() -> Self {
		Self {
			logins: VecDeque::new(),
			facilities: vec!["Calgary".to_string(), "Toronto".to_string()],
			availability: VecDeque::new(),
			steady: None,
			requery_failures: 0,
			times: vec!["09:00".to_string()],
			submits: VecDeque::new(),
			form_present: true,
			date_failures: VecDeque::new(),
			expire_on_date: false,
			page_texts: VecDeque::new(),
			page_text: "Schedule Appointment".to_string(),
			probe_failures_after: None,
			disconnected: false,
			login_attempts: 0,
			requeries: 0,
			probes: 0,
			selected_facility: None,
			selected_dates: Vec::new(),
			selected_times: Vec::new(),
			submitted: 0,
			closed: false,
		}
	}
}

/// Scripted [`PortalSession`].
pub struct FakePortal {
	script: Arc<Mutex<PortalScript>>,
	responses: mpsc::UnboundedSender<ResponseEvent>,
}

/// Scripting and inspection handle for a [`FakePortal`].
#[derive(Clone)]
pub struct FakePortalHandle {
	script: Arc<Mutex<PortalScript>>,
	stream: Arc<Mutex<Option<ResponseStream>>>,
}

impl FakePortal {
	pub fn new() -> (Self, FakePortalHandle) {
		let (tx, rx) = mpsc::unbounded_channel();
		let script = Arc::new(Mutex::new(PortalScript::default()));
		let handle = FakePortalHandle {
			script: Arc::clone(&script),
			stream: Arc::new(Mutex::new(Some(rx))),
		};
		(Self { script, responses: tx }, handle)
	}

	fn check_connected(&self) -> Result<()> {
		if self.script.lock().disconnected {
			return Err(Error::ConnectivityLost("fake portal disconnected".into()));
		}
		Ok(())
	}

	fn emit(&self, event: ResponseEvent) {
		let _ = self.responses.send(event);
	}

	fn emit_availability(&self) {
		let next = {
			let mut script = self.script.lock();
			match script.availability.pop_front() {
				Some(next) => next,
				None => script.steady,
			}
		};
		if let Some(date) = next {
			self.emit(ResponseEvent::json(DAYS_URL, json!([{ "date": date.format(DATE_FORMAT).to_string(), "business_day": true }])));
		}
	}
}

#[async_trait]
impl PortalSession for FakePortal {
	async fn login(&self, _credentials: &Credentials) -> Result<()> {
		self.check_connected()?;
		let mut script = self.script.lock();
		script.login_attempts += 1;
		script.logins.pop_front().unwrap_or(Ok(()))
	}

	async fn open_schedule(&self) -> Result<Vec<String>> {
		self.check_connected()?;
		Ok(self.script.lock().facilities.clone())
	}

	async fn select_facility(&self, option: &str) -> Result<()> {
		self.check_connected()?;
		self.script.lock().selected_facility = Some(option.to_string());
		self.emit_availability();
		Ok(())
	}

	async fn requery(&self) -> Result<()> {
		self.check_connected()?;
		{
			let mut script = self.script.lock();
			script.requeries += 1;
			if script.requery_failures > 0 {
				script.requery_failures -= 1;
				return Err(Error::Driver("scripted requery failure".into()));
			}
		}
		self.emit_availability();
		Ok(())
	}

	async fn page_text(&self) -> Result<String> {
		self.check_connected()?;
		let mut script = self.script.lock();
		Ok(match script.page_texts.pop_front() {
			Some(text) => text,
			None => script.page_text.clone(),
		})
	}

	async fn probe(&self) -> Result<()> {
		self.check_connected()?;
		let mut script = self.script.lock();
		script.probes += 1;
		match script.probe_failures_after {
			Some(limit) if script.probes > limit => Err(Error::ConnectivityLost("probe failed".into())),
			_ => Ok(()),
		}
	}

	async fn select_date(&self, date: NaiveDate) -> Result<()> {
		self.check_connected()?;
		let times = {
			let mut script = self.script.lock();
			script.selected_dates.push(date);
			if script.expire_on_date {
				script.form_present = false;
				script.page_text = "Your session has expired. Please sign in again.".to_string();
				return Err(Error::NavigationFailed("redirected to sign-in".into()));
			}
			if let Some(err) = script.date_failures.pop_front() {
				return Err(err);
			}
			script.times.clone()
		};
		self.emit(ResponseEvent::json(
			format!("https://portal.test/schedule/appointment/times/1.json?date={}", date.format(DATE_FORMAT)),
			json!({ "available_times": times, "business_times": Value::Array(Vec::new()) }),
		));
		Ok(())
	}

	async fn select_time(&self, time: &str) -> Result<()> {
		self.check_connected()?;
		self.script.lock().selected_times.push(time.to_string());
		Ok(())
	}

	async fn submit_booking(&self) -> Result<()> {
		self.check_connected()?;
		let mut script = self.script.lock();
		script.submitted += 1;
		match script.submits.pop_front().unwrap_or(SubmitScript::Rejected) {
			SubmitScript::Confirms => {
				script.form_present = false;
				Ok(())
			}
			SubmitScript::Rejected => Ok(()),
			SubmitScript::ErrorsAfterSubmit => {
				script.form_present = false;
				Err(Error::Driver("confirmation dialog detached".into()))
			}
			SubmitScript::ErrorsBeforeSubmit => Err(Error::Driver("submit button not clickable".into())),
		}
	}

	async fn booking_form_present(&self) -> Result<bool> {
		self.check_connected()?;
		Ok(self.script.lock().form_present)
	}

	async fn close(&self) -> Result<()> {
		self.script.lock().closed = true;
		Ok(())
	}
}

impl FakePortalHandle {
	/// Takes the response stream; `None` once taken.
	pub fn take_responses(&self) -> Option<ResponseStream> {
		self.stream.lock().take()
	}

	pub fn push_login(&self, outcome: Result<()>) -> &Self {
		self.script.lock().logins.push_back(outcome);
		self
	}

	pub fn set_facilities(&self, facilities: &[&str]) -> &Self {
		self.script.lock().facilities = facilities.iter().map(|f| f.to_string()).collect();
		self
	}

	/// Queues one availability emission; `None` emits nothing for that query.
	pub fn push_availability(&self, date: Option<NaiveDate>) -> &Self {
		self.script.lock().availability.push_back(date);
		self
	}

	/// Date emitted for every query once the queue is empty.
	pub fn set_steady_availability(&self, date: Option<NaiveDate>) -> &Self {
		self.script.lock().steady = date;
		self
	}

	pub fn fail_requeries(&self, count: u32) -> &Self {
		self.script.lock().requery_failures = count;
		self
	}

	pub fn set_times(&self, times: &[&str]) -> &Self {
		self.script.lock().times = times.iter().map(|t| t.to_string()).collect();
		self
	}

	pub fn push_submit(&self, outcome: SubmitScript) -> &Self {
		self.script.lock().submits.push_back(outcome);
		self
	}

	pub fn set_form_present(&self, present: bool) -> &Self {
		self.script.lock().form_present = present;
		self
	}

	/// The next `select_date` fails with `error`.
	pub fn fail_date_selection(&self, error: Error) -> &Self {
		self.script.lock().date_failures.push_back(error);
		self
	}

	/// Selecting a date lands on the sign-in page: the form disappears and
	/// the page reports an expired session.
	pub fn expire_on_date_selection(&self) -> &Self {
		self.script.lock().expire_on_date = true;
		self
	}

	/// Text returned by the next `page_text` call.
	pub fn push_page_text(&self, text: &str) -> &Self {
		self.script.lock().page_texts.push_back(text.to_string());
		self
	}

	/// Probes succeed `count` times, then report lost connectivity.
	pub fn fail_probes_after(&self, count: u32) -> &Self {
		self.script.lock().probe_failures_after = Some(count);
		self
	}

	pub fn disconnect(&self) {
		self.script.lock().disconnected = true;
	}

	pub fn login_attempts(&self) -> u32 {
		self.script.lock().login_attempts
	}

	pub fn requeries(&self) -> u32 {
		self.script.lock().requeries
	}

	pub fn probes(&self) -> u32 {
		self.script.lock().probes
	}

	pub fn selected_facility(&self) -> Option<String> {
		self.script.lock().selected_facility.clone()
	}

	pub fn selected_dates(&self) -> Vec<NaiveDate> {
		self.script.lock().selected_dates.clone()
	}

	pub fn selected_times(&self) -> Vec<String> {
		self.script.lock().selected_times.clone()
	}

	pub fn submits(&self) -> u32 {
		self.script.lock().submitted
	}

	pub fn closed(&self) -> bool {
		self.script.lock().closed
	}
}

/// Hands out scripted portals in the order they were pushed.
///
/// Once the script runs out, `open` fails with a configuration error so a
/// supervised run cannot loop forever.
#[derive(Default)]
pub struct FakeFactory {
	sessions: Mutex<VecDeque<(FakePortal, FakePortalHandle)>>,
	identities: Mutex<Vec<NetworkIdentity>>,
	open_failures: Mutex<VecDeque<Error>>,
}

impl FakeFactory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Scripts a new portal and returns its handle.
	pub fn script(&self) -> FakePortalHandle {
		let (portal, handle) = FakePortal::new();
		self.sessions.lock().push_back((portal, handle.clone()));
		handle
	}

	/// The next `open` fails with `error` instead of consuming a portal.
	pub fn fail_next_open(&self, error: Error) {
		self.open_failures.lock().push_back(error);
	}

	pub fn identities(&self) -> Vec<NetworkIdentity> {
		self.identities.lock().clone()
	}

	pub fn opened(&self) -> usize {
		self.identities.lock().len()
	}
}

#[async_trait]
impl SessionFactory for FakeFactory {
	async fn open(&self, identity: &NetworkIdentity) -> Result<OpenedSession> {
		self.identities.lock().push(identity.clone());
		if let Some(error) = self.open_failures.lock().pop_front() {
			return Err(error);
		}
		let Some((portal, handle)) = self.sessions.lock().pop_front() else {
			return Err(Error::Config("fake factory has no scripted session left".into()));
		};
		let responses = handle
			.take_responses()
			.ok_or_else(|| Error::Config("fake portal stream already taken".into()))?;
		Ok(OpenedSession {
			session: Box::new(portal),
			responses,
		})
	}
}
