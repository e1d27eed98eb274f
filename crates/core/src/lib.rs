//! Slot polling, freshness verification and session supervision.
//!
//! The engine watches a remote scheduling service through a browser session,
//! cross-checks what it sees against an independent second session, and claims
//! a slot as soon as one inside the operator's date window appears.
//!
//! Components, leaf first:
//!
//! - [`observer::SlotObserver`] turns intercepted responses into the latest known slot
//! - [`poll::PollDriver`] forces fresh queries at a target rate
//! - [`verify::FreshnessVerifier`] compares the primary session against an isolated second one
//! - [`booking::BookingCoordinator`] drives the bounded, exclusive claim sequence
//! - [`supervisor::SessionSupervisor`] owns the session state machine and rebuilds on failure
//! - [`governor::AccountGovernor`] retires credentials after lockouts or repeated login failures
//!
//! The browser itself is a collaborator behind [`session::PortalSession`] and
//! [`session::SessionFactory`].

pub mod booking;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod governor;
pub mod notify;
pub mod observer;
pub mod poll;
pub mod session;
pub mod signals;
pub mod slot;
pub mod supervisor;
pub mod testing;
pub mod verify;

pub use booking::{BookingCoordinator, BookingOutcome};
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use governor::{AccountGovernor, JsonLedger, LedgerStore, MemoryLedger};
pub use notify::{Deliver, Event, EventSink, NotificationHub};
pub use observer::SlotObserver;
pub use poll::{Cadence, PollDriver};
pub use session::{Credentials, NetworkIdentity, PortalSession, ProxyEndpoint, ResponseEvent, SessionFactory, SessionState};
pub use slot::{ClosestSlotTracker, DateWindow, SlotCandidate};
pub use supervisor::{ExitReason, SessionSupervisor};
pub use verify::{FreshnessVerifier, VerificationVerdict};
