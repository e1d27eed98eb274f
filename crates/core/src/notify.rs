//! Notification events and the asynchronous delivery hub.
//!
//! Components raise [`Event`]s through an [`EventSink`]; raising never blocks
//! and never fails. The [`NotificationHub`] hands events to a dedicated worker
//! that calls a [`Deliver`] implementation, so a slow or broken notification
//! channel cannot stall the engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::slot::DateWindow;

/// State transitions of consequence, as surfaced to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
	BotStarted {
		email: String,
		facility: String,
		window: DateWindow,
	},
	LoggedIn {
		email: String,
	},
	SlotDetected {
		date: NaiveDate,
	},
	BookingStarted {
		date: NaiveDate,
	},
	BookingSucceeded {
		date: NaiveDate,
		time: String,
	},
	BookingFailed {
		date: NaiveDate,
		attempts: u32,
	},
	StaleDataDetected {
		primary: Option<NaiveDate>,
		secondary: Option<NaiveDate>,
	},
	DataFresh {
		date: Option<NaiveDate>,
	},
	VerificationFailed {
		reason: String,
	},
	SessionExpired,
	ConnectionLost {
		reason: String,
	},
	AccountBanned {
		email: String,
		reason: String,
	},
	/// Polling paused for a busy signal; `escalated` when the credential was put on cooldown.
	SystemBusyCooldown {
		until: DateTime<Utc>,
		escalated: bool,
	},
	StatusDigest {
		cycles: u64,
		latest: Option<NaiveDate>,
		closest: Option<NaiveDate>,
		latency_ms: Option<u64>,
		restarts: u32,
	},
	RestartScheduled {
		cause: String,
		restarts: u32,
	},
}

impl Event {
	pub fn name(&self) -> &'static str {
		match self {
			Event::BotStarted { .. } => "bot_started",
			Event::LoggedIn { .. } => "logged_in",
			Event::SlotDetected { .. } => "slot_detected",
			Event::BookingStarted { .. } => "booking_started",
			Event::BookingSucceeded { .. } => "booking_succeeded",
			Event::BookingFailed { .. } => "booking_failed",
			Event::StaleDataDetected { .. } => "stale_data_detected",
			Event::DataFresh { .. } => "data_fresh",
			Event::VerificationFailed { .. } => "verification_failed",
			Event::SessionExpired => "session_expired",
			Event::ConnectionLost { .. } => "connection_lost",
			Event::AccountBanned { .. } => "account_banned",
			Event::SystemBusyCooldown { .. } => "system_busy_cooldown",
			Event::StatusDigest { .. } => "status_digest",
			Event::RestartScheduled { .. } => "restart_scheduled",
		}
	}

	/// One-line human summary.
	pub fn message(&self) -> String {
		fn fmt_date(d: &Option<NaiveDate>) -> String {
			d.map_or_else(|| "none".to_string(), |d| d.to_string())
		}

		match self {
			Event::BotStarted { email, facility, window } => format!("Started for {email} at {facility}, window {window}"),
			Event::LoggedIn { email } => format!("Logged in as {email}"),
			Event::SlotDetected { date } => format!("Slot detected on {date}"),
			Event::BookingStarted { date } => format!("Booking {date}..."),
			Event::BookingSucceeded { date, time } => format!("Booked {date} at {time}"),
			Event::BookingFailed { date, attempts } => format!("Booking {date} failed after {attempts} attempts; polling resumed"),
			Event::StaleDataDetected { primary, secondary } => {
				format!("Stale data: primary sees {}, verifier sees {}; restarting", fmt_date(primary), fmt_date(secondary))
			}
			Event::DataFresh { date: d } => format!("Data fresh ({})", fmt_date(d)),
			Event::VerificationFailed { reason } => format!("Verification failed: {reason}"),
			Event::SessionExpired => "Session expired; restarting".to_string(),
			Event::ConnectionLost { reason } => format!("Connection lost: {reason}"),
			Event::AccountBanned { email, reason } => format!("Credential {email} retired: {reason}"),
			Event::SystemBusyCooldown { until, escalated } => {
				if *escalated {
					format!("System busy; cooldown until {}", until.format("%H:%M:%S UTC"))
				} else {
					format!("System busy; paused until {}", until.format("%H:%M:%S UTC"))
				}
			}
			Event::StatusDigest {
				cycles,
				latest,
				closest,
				latency_ms,
				restarts,
			} => format!(
				"Status: {cycles} checks, latest {}, closest {}, latency {}, restarts {restarts}",
				fmt_date(latest),
				fmt_date(closest),
				latency_ms.map_or_else(|| "n/a".to_string(), |ms| format!("{ms}ms"))
			),
			Event::RestartScheduled { cause, restarts } => format!("Restart #{restarts}: {cause}"),
		}
	}
}

/// Receiver of engine events. Must return promptly and never fail.
pub trait EventSink: Send + Sync {
	fn notify(&self, event: Event);
}

/// Delivers one event over an outbound channel.
#[async_trait]
pub trait Deliver: Send + Sync {
	async fn deliver(&self, event: &Event) -> Result<()>;
}

/// [`Deliver`] that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl Deliver for LogDelivery {
	async fn deliver(&self, event: &Event) -> Result<()> {
		info!(target = "slotwatch.notify", event = event.name(), "{}", event.message());
		Ok(())
	}
}

/// Queueing [`EventSink`] backed by a delivery worker task.
#[derive(Clone)]
pub struct NotificationHub {
	tx: mpsc::UnboundedSender<Event>,
}

impl NotificationHub {
	/// Starts the delivery worker. It exits once every hub clone is dropped
	/// and the queue is drained.
	pub fn spawn(delivery: Arc<dyn Deliver>) -> (Self, JoinHandle<()>) {
		let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
		let worker = tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				debug!(target = "slotwatch.notify", event = event.name(), "delivering");
				if let Err(err) = delivery.deliver(&event).await {
					warn!(target = "slotwatch.notify", event = event.name(), error = %err, "notification delivery failed");
				}
			}
			debug!(target = "slotwatch.notify", "notification worker stopped");
		});
		(Self { tx }, worker)
	}
}

impl EventSink for NotificationHub {
	fn notify(&self, event: Event) {
		if self.tx.send(event).is_err() {
			debug!(target = "slotwatch.notify", "notification worker gone; event dropped");
		}
	}
}
