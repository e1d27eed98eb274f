//! Slot value types: observed candidates, the acceptance window, and the
//! closest-slot tracker.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Date format used by the remote service and by operator configuration.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parses a `YYYY-MM-DD` calendar date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
	NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// One observed slot. Immutable; a newer observation supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCandidate {
	pub date: NaiveDate,
	/// Clock-time label as offered by the remote service, once known.
	pub time: Option<String>,
	pub observed_at: DateTime<Utc>,
}

impl SlotCandidate {
	pub fn new(date: NaiveDate, observed_at: DateTime<Utc>) -> Self {
		Self {
			date,
			time: None,
			observed_at,
		}
	}

	pub fn with_time(mut self, time: impl Into<String>) -> Self {
		self.time = Some(time.into());
		self
	}
}

impl fmt::Display for SlotCandidate {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.time {
			Some(time) => write!(f, "{} {}", self.date.format(DATE_FORMAT), time),
			None => write!(f, "{}", self.date.format(DATE_FORMAT)),
		}
	}
}

/// Inclusive calendar-day acceptance range supplied by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
	start: NaiveDate,
	end: NaiveDate,
}

impl DateWindow {
	pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
		if start > end {
			return Err(Error::Config(format!(
				"date window start {} is after end {}",
				start.format(DATE_FORMAT),
				end.format(DATE_FORMAT)
			)));
		}
		Ok(Self { start, end })
	}

	pub fn start(&self) -> NaiveDate {
		self.start
	}

	pub fn end(&self) -> NaiveDate {
		self.end
	}

	pub fn contains(&self, date: NaiveDate) -> bool {
		self.start <= date && date <= self.end
	}
}

impl fmt::Display for DateWindow {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}..={}", self.start.format(DATE_FORMAT), self.end.format(DATE_FORMAT))
	}
}

/// Earliest slot seen so far whose date is today or later.
///
/// Only ever replaced by a strictly earlier date; lives for the whole process
/// and survives session rebuilds.
#[derive(Debug, Clone, Default)]
pub struct ClosestSlotTracker {
	closest: Option<SlotCandidate>,
}

impl ClosestSlotTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Offers a candidate; returns `true` when it became the new closest slot.
	pub fn offer(&mut self, candidate: &SlotCandidate, today: NaiveDate) -> bool {
		if candidate.date < today {
			return false;
		}
		let improves = match &self.closest {
			Some(current) => candidate.date < current.date,
			None => true,
		};
		if improves {
			self.closest = Some(candidate.clone());
		}
		improves
	}

	pub fn closest(&self) -> Option<&SlotCandidate> {
		self.closest.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn date(raw: &str) -> NaiveDate {
		parse_date(raw).unwrap()
	}

	fn candidate(raw: &str) -> SlotCandidate {
		SlotCandidate::new(date(raw), Utc::now())
	}

	#[test]
	fn window_is_inclusive_on_both_ends() {
		let window = DateWindow::new(date("2026-01-01"), date("2026-03-31")).unwrap();
		assert!(window.contains(date("2026-01-01")));
		assert!(window.contains(date("2026-02-10")));
		assert!(window.contains(date("2026-03-31")));
		assert!(!window.contains(date("2026-04-01")));
		assert!(!window.contains(date("2025-12-31")));
	}

	#[test]
	fn inverted_window_is_rejected() {
		let err = DateWindow::new(date("2026-03-31"), date("2026-01-01")).unwrap_err();
		assert!(matches!(err, Error::Config(_)));
	}

	#[test]
	fn tracker_only_moves_earlier() {
		let today = date("2026-01-01");
		let mut tracker = ClosestSlotTracker::new();
		assert!(tracker.offer(&candidate("2026-05-01"), today));
		assert!(tracker.offer(&candidate("2026-04-01"), today));
		assert!(!tracker.offer(&candidate("2026-04-01"), today));
		assert!(!tracker.offer(&candidate("2026-06-01"), today));
		assert!(tracker.offer(&candidate("2026-02-10"), today));
		assert_eq!(tracker.closest().unwrap().date, date("2026-02-10"));
	}

	#[test]
	fn tracker_ignores_past_dates() {
		let today = date("2026-02-01");
		let mut tracker = ClosestSlotTracker::new();
		assert!(!tracker.offer(&candidate("2026-01-31"), today));
		assert!(tracker.closest().is_none());
		assert!(tracker.offer(&candidate("2026-02-01"), today));
	}

	#[test]
	fn tracker_never_regresses_over_arbitrary_sequences() {
		let today = date("2026-01-01");
		let dates = [
			"2026-07-04", "2025-12-25", "2026-03-01", "2026-09-09", "2026-02-28", "2026-02-28", "2026-01-01", "2026-05-05",
		];
		let mut tracker = ClosestSlotTracker::new();
		let mut earliest_seen: Option<NaiveDate> = None;
		for raw in dates {
			let c = candidate(raw);
			tracker.offer(&c, today);
			if c.date >= today {
				earliest_seen = Some(earliest_seen.map_or(c.date, |d| d.min(c.date)));
			}
			assert_eq!(tracker.closest().map(|s| s.date), earliest_seen);
		}
	}

	#[test]
	fn display_includes_time_when_known() {
		let slot = candidate("2026-02-10").with_time("09:15");
		assert_eq!(slot.to_string(), "2026-02-10 09:15");
		assert_eq!(candidate("2026-02-10").to_string(), "2026-02-10");
	}
}
