use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use slotwatch::slot::parse_date;
use slotwatch::testing::{FakeFactory, FixedClock, RecordingSink, SubmitScript};
use slotwatch::{AccountGovernor, EngineConfig, Error, ExitReason, MemoryLedger, SessionState, SessionSupervisor};

const EMAIL: &str = "primary@example.com";

fn d(raw: &str) -> NaiveDate {
	parse_date(raw).unwrap()
}

fn config(extra: &[(&str, &str)]) -> EngineConfig {
	let mut vars = vec![
		("PRIMARY_EMAIL", EMAIL),
		("PRIMARY_PASSWORD", "hunter2"),
		("DATE_START", "2026-01-01"),
		("DATE_END", "2026-03-31"),
		("FACILITY", "toronto"),
	];
	vars.extend_from_slice(extra);
	EngineConfig::from_vars(vars).unwrap()
}

struct Harness {
	factory: Arc<FakeFactory>,
	sink: Arc<RecordingSink>,
	governor: Arc<AccountGovernor>,
}

impl Harness {
	fn new() -> Self {
		let clock = Arc::new(FixedClock::on(d("2026-01-01")));
		Self {
			factory: Arc::new(FakeFactory::new()),
			sink: Arc::new(RecordingSink::new()),
			governor: Arc::new(AccountGovernor::load(Arc::new(MemoryLedger::new()), clock).unwrap()),
		}
	}

	fn supervisor(&self, config: &EngineConfig) -> Arc<SessionSupervisor> {
		let clock = Arc::new(FixedClock::on(d("2026-01-01")));
		Arc::new(SessionSupervisor::new(
			config,
			self.factory.clone(),
			clock,
			self.governor.clone(),
			self.sink.clone(),
		))
	}
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
	for _ in 0..20_000 {
		if done() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	panic!("timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn books_an_in_window_slot_and_exits_cleanly() {
	let h = Harness::new();
	let portal = h.factory.script();
	portal.set_steady_availability(Some(d("2026-02-10"))).push_submit(SubmitScript::Confirms);

	let supervisor = h.supervisor(&config(&[]));
	let exit = supervisor.run().await;

	assert_eq!(
		exit,
		ExitReason::Booked {
			date: d("2026-02-10"),
			time: Some("09:00".into()),
		}
	);
	assert_eq!(exit.exit_code(), 0);
	assert_eq!(
		supervisor.history(),
		vec![
			SessionState::Unauthenticated,
			SessionState::Authenticating,
			SessionState::Navigating,
			SessionState::Monitoring,
			SessionState::Booking,
			SessionState::Terminated,
		]
	);
	assert_eq!(
		h.sink.names(),
		vec!["bot_started", "logged_in", "slot_detected", "booking_started", "booking_succeeded"]
	);
	assert_eq!(portal.selected_facility().as_deref(), Some("Toronto"));
	assert!(portal.closed());
	assert_eq!(supervisor.closest_slot().map(|slot| slot.date), Some(d("2026-02-10")));
}

#[tokio::test(start_paused = true)]
async fn three_rejected_logins_ban_the_credential() {
	let h = Harness::new();
	for _ in 0..4 {
		h.factory
			.script()
			.push_login(Err(Error::AuthenticationFailed("invalid email or password".into())));
	}

	let exit = h.supervisor(&config(&[])).run().await;

	assert!(matches!(exit, ExitReason::CredentialBanned { ref email, .. } if email == EMAIL));
	assert_eq!(exit.exit_code(), 2);
	assert_eq!(h.factory.opened(), 3);
	assert!(h.governor.is_banned(EMAIL));
	assert_eq!(h.sink.count("restart_scheduled"), 2);
	assert_eq!(h.sink.count("account_banned"), 1);
}

#[tokio::test(start_paused = true)]
async fn banned_credential_is_never_attempted() {
	let h = Harness::new();
	h.governor.ban(EMAIL, "account locked").unwrap();
	h.factory.script();

	let exit = h.supervisor(&config(&[])).run().await;

	assert!(matches!(exit, ExitReason::CredentialBanned { .. }));
	assert_eq!(h.factory.opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_booking_resumes_monitoring() {
	let h = Harness::new();
	let portal = h.factory.script();
	portal
		.push_availability(None)
		.push_availability(Some(d("2026-02-10")))
		.set_steady_availability(Some(d("2026-04-01")));

	let supervisor = h.supervisor(&config(&[]));
	let run = tokio::spawn({
		let supervisor = supervisor.clone();
		async move { supervisor.run().await }
	});

	wait_until("booking failure", || h.sink.count("booking_failed") == 1).await;
	assert_eq!(supervisor.state(), SessionState::Monitoring);
	assert_eq!(portal.submits(), 3);

	let requeries = portal.requeries();
	wait_until("polling to resume", || portal.requeries() > requeries + 2).await;
	assert_eq!(h.sink.count("booking_started"), 1);
	assert_eq!(h.sink.count("restart_scheduled"), 0);

	portal.disconnect();
	let exit = run.await.unwrap();
	assert!(matches!(exit, ExitReason::Fatal(_)));
	assert_eq!(h.sink.count("connection_lost"), 1);
}

#[tokio::test(start_paused = true)]
async fn connection_lost_while_waiting_for_a_time_rebuilds() {
	let h = Harness::new();
	let first = h.factory.script();
	first.set_steady_availability(Some(d("2026-02-10"))).set_times(&[]);
	let second = h.factory.script();
	second.set_steady_availability(Some(d("2026-02-10"))).push_submit(SubmitScript::Confirms);

	let supervisor = h.supervisor(&config(&[]));
	let run = tokio::spawn({
		let supervisor = supervisor.clone();
		async move { supervisor.run().await }
	});

	wait_until("booking to start", || h.sink.count("booking_started") == 1).await;
	assert_eq!(supervisor.state(), SessionState::Booking);
	first.disconnect();
	let exit = run.await.unwrap();

	assert!(matches!(exit, ExitReason::Booked { date, .. } if date == d("2026-02-10")));
	assert_eq!(first.submits(), 0);
	assert!(first.closed());
	assert_eq!(second.submits(), 1);
	assert_eq!(h.sink.count("connection_lost"), 1);
	assert_eq!(h.sink.count("booking_succeeded"), 1);
	assert_eq!(supervisor.restarts(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_date_selection_on_a_vanished_form_is_not_a_booking() {
	let h = Harness::new();
	let portal = h.factory.script();
	portal.set_steady_availability(Some(d("2026-02-10"))).set_form_present(false);
	for _ in 0..6 {
		portal.fail_date_selection(Error::Driver("date picker detached".into()));
	}

	let supervisor = h.supervisor(&config(&[]));
	let run = tokio::spawn({
		let supervisor = supervisor.clone();
		async move { supervisor.run().await }
	});

	wait_until("booking failure", || h.sink.count("booking_failed") == 1).await;
	portal.disconnect();
	let exit = run.await.unwrap();

	assert!(matches!(exit, ExitReason::Fatal(_)), "got {exit:?}");
	assert_eq!(portal.submits(), 0);
	assert_eq!(h.sink.count("booking_succeeded"), 0);
	assert_eq!(h.sink.count("connection_lost"), 1);
}

#[tokio::test(start_paused = true)]
async fn session_expiring_mid_booking_is_rebuilt() {
	let h = Harness::new();
	let first = h.factory.script();
	first.set_steady_availability(Some(d("2026-02-10"))).expire_on_date_selection();
	let second = h.factory.script();
	second.set_steady_availability(Some(d("2026-03-01"))).push_submit(SubmitScript::Confirms);

	let supervisor = h.supervisor(&config(&[]));
	let exit = supervisor.run().await;

	assert!(matches!(exit, ExitReason::Booked { date, .. } if date == d("2026-03-01")));
	assert_eq!(first.submits(), 0);
	assert_eq!(first.selected_dates().len(), 3);
	assert!(first.closed());
	assert_eq!(h.sink.count("booking_failed"), 1);
	assert_eq!(h.sink.count("session_expired"), 1);
	assert_eq!(h.sink.count("booking_succeeded"), 1);
	assert_eq!(supervisor.restarts(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_verdict_rebuilds_the_primary_session() {
	let h = Harness::new();
	let primary = h.factory.script();
	primary.set_steady_availability(Some(d("2026-04-01")));
	let verifier = h.factory.script();
	verifier.set_steady_availability(Some(d("2026-01-05")));

	let config = config(&[
		("VERIFY_EMAIL", "verify@example.com"),
		("VERIFY_PASSWORD", "pw"),
		("VERIFY_INTERVAL_MINUTES", "1"),
	]);
	let supervisor = h.supervisor(&config);
	let exit = supervisor.run().await;

	assert!(matches!(exit, ExitReason::Fatal(_)));
	assert_eq!(h.sink.count("stale_data_detected"), 1);
	assert_eq!(h.sink.count("restart_scheduled"), 1);
	assert_eq!(supervisor.restarts(), 1);
	assert!(verifier.closed());
	assert!(primary.closed());

	let identities = h.factory.identities();
	assert_eq!(identities.len(), 3);
	assert_ne!(identities[0].session_token, identities[1].session_token);
	assert_ne!(identities[0].session_token, identities[2].session_token);
}

#[tokio::test(start_paused = true)]
async fn failed_verification_leaves_the_primary_undisturbed() {
	let h = Harness::new();
	let primary = h.factory.script();
	primary.set_steady_availability(Some(d("2026-04-01")));
	let verifier = h.factory.script();
	verifier.push_login(Err(Error::ConnectivityLost("proxy tunnel reset".into())));

	let config = config(&[
		("VERIFY_EMAIL", "verify@example.com"),
		("VERIFY_PASSWORD", "pw"),
		("VERIFY_INTERVAL_MINUTES", "1"),
	]);
	let supervisor = h.supervisor(&config);
	let run = tokio::spawn({
		let supervisor = supervisor.clone();
		async move { supervisor.run().await }
	});

	wait_until("verification failure", || h.sink.count("verification_failed") == 1).await;
	let requeries = primary.requeries();
	wait_until("polling to continue", || primary.requeries() > requeries + 2).await;
	assert_eq!(supervisor.state(), SessionState::Monitoring);
	assert_eq!(h.sink.count("restart_scheduled"), 0);
	assert_eq!(primary.login_attempts(), 1);
	assert!(verifier.closed());

	primary.disconnect();
	assert!(matches!(run.await.unwrap(), ExitReason::Fatal(_)));
}

#[tokio::test(start_paused = true)]
async fn locked_page_bans_immediately() {
	let h = Harness::new();
	let portal = h.factory.script();
	portal.push_page_text("Sorry, your account is locked.");
	h.factory.script();

	let exit = h.supervisor(&config(&[])).run().await;

	assert!(matches!(exit, ExitReason::CredentialBanned { ref reason, .. } if reason.contains("account locked")));
	assert!(h.governor.is_banned(EMAIL));
	assert_eq!(h.factory.opened(), 1);
	assert!(portal.closed());
}

#[tokio::test(start_paused = true)]
async fn expired_session_is_rebuilt_from_scratch() {
	let h = Harness::new();
	let first = h.factory.script();
	first.push_page_text("Your session has expired. Please sign in again.");
	let second = h.factory.script();
	second.set_steady_availability(Some(d("2026-03-01"))).push_submit(SubmitScript::Confirms);

	let supervisor = h.supervisor(&config(&[]));
	let exit = supervisor.run().await;

	assert!(matches!(exit, ExitReason::Booked { date, .. } if date == d("2026-03-01")));
	assert!(first.closed());
	assert_eq!(second.login_attempts(), 1);
	assert_eq!(h.sink.count("session_expired"), 1);
	assert_eq!(supervisor.restarts(), 1);
	assert_eq!(h.sink.count("logged_in"), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_liveness_check_counts_as_connection_loss() {
	let h = Harness::new();
	let first = h.factory.script();
	first.set_steady_availability(Some(d("2026-04-01"))).fail_probes_after(0);
	let second = h.factory.script();
	second.set_steady_availability(Some(d("2026-02-10"))).push_submit(SubmitScript::Confirms);

	let exit = h.supervisor(&config(&[])).run().await;

	assert!(matches!(exit, ExitReason::Booked { .. }));
	assert_eq!(first.probes(), 1);
	assert_eq!(first.requeries(), 9);
	assert_eq!(h.sink.count("connection_lost"), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_busy_signals_end_in_cooldown() {
	let h = Harness::new();
	let portal = h.factory.script();
	for _ in 0..3 {
		portal.push_page_text("The system is busy. Please try again later.");
	}

	let exit = h.supervisor(&config(&[])).run().await;

	let ExitReason::SystemBusyCooldown { until } = exit else {
		panic!("expected cooldown exit, got {exit:?}");
	};
	assert_eq!(exit.exit_code(), 3);
	assert_eq!(h.governor.cooldown_until(EMAIL), Some(until));
	assert_eq!(h.sink.count("system_busy_cooldown"), 3);
	assert_eq!(portal.requeries(), 0);
	assert_eq!(h.factory.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn sixth_consecutive_error_restarts() {
	let h = Harness::new();
	let portal = h.factory.script();
	portal.set_steady_availability(Some(d("2026-04-01"))).fail_requeries(6);

	let supervisor = h.supervisor(&config(&[]));
	let exit = supervisor.run().await;

	assert!(matches!(exit, ExitReason::Fatal(_)));
	assert_eq!(portal.requeries(), 6);
	assert_eq!(supervisor.restarts(), 1);
	assert!(matches!(
		h.sink.events().iter().find(|event| event.name() == "restart_scheduled"),
		Some(slotwatch::Event::RestartScheduled { cause, .. }) if cause.starts_with("error:")
	));
}

#[tokio::test(start_paused = true)]
async fn five_consecutive_errors_are_tolerated() {
	let h = Harness::new();
	let portal = h.factory.script();
	portal.set_steady_availability(Some(d("2026-04-01"))).fail_requeries(5);
	for _ in 0..5 {
		portal.push_page_text("Schedule Appointment");
	}
	portal.push_page_text("Your account is locked");

	let supervisor = h.supervisor(&config(&[]));
	let exit = supervisor.run().await;

	assert!(matches!(exit, ExitReason::CredentialBanned { .. }));
	assert_eq!(portal.requeries(), 5);
	assert_eq!(supervisor.restarts(), 0);
}

#[tokio::test(start_paused = true)]
async fn scheduled_rotation_reauthenticates_the_same_session() {
	let h = Harness::new();
	let portal = h.factory.script();
	portal.set_steady_availability(Some(d("2026-04-01")));

	let supervisor = h.supervisor(&config(&[("ROTATION_MINUTES", "1")]));
	let run = tokio::spawn({
		let supervisor = supervisor.clone();
		async move { supervisor.run().await }
	});

	wait_until("rotation", || portal.login_attempts() == 2).await;
	wait_until("status digest", || h.sink.count("status_digest") >= 1).await;
	assert_eq!(h.factory.opened(), 1);
	assert_eq!(supervisor.restarts(), 0);
	let history = supervisor.history();
	let first_monitoring = history.iter().position(|state| *state == SessionState::Monitoring).unwrap();
	assert!(history[first_monitoring..].contains(&SessionState::Authenticating));

	portal.disconnect();
	assert!(matches!(run.await.unwrap(), ExitReason::Fatal(_)));
}
