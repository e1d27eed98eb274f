//! Best-effort classification of intercepted responses.
//!
//! The remote wire format is neither controlled nor versioned, so anything
//! that does not look like one of the two known shapes is `Unrecognized` and
//! dropped without complaint.

use chrono::NaiveDate;
use serde_json::Value;

use crate::slot::parse_date;

/// Tagged result of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
	/// Availability list; dates in the order the service sent them.
	SlotList(Vec<NaiveDate>),
	/// Times offered for one date, in service order.
	TimeList(Vec<String>),
	Unrecognized,
}

impl ResponseKind {
	/// First listed date of a `SlotList`.
	pub fn first_date(&self) -> Option<NaiveDate> {
		match self {
			ResponseKind::SlotList(dates) => dates.first().copied(),
			_ => None,
		}
	}

	/// First listed time of a `TimeList`.
	pub fn first_time(&self) -> Option<&str> {
		match self {
			ResponseKind::TimeList(times) => times.first().map(String::as_str),
			_ => None,
		}
	}
}

/// Classifies one response body captured from `url`.
pub fn classify(url: &str, body: &Value) -> ResponseKind {
	match body {
		Value::Array(records) => classify_slot_list(url, records),
		Value::Object(map) => {
			let times = map.get("available_times").or_else(|| map.get("business_times"));
			match times {
				Some(Value::Array(entries)) => ResponseKind::TimeList(
					entries
						.iter()
						.filter_map(Value::as_str)
						.map(str::trim)
						.filter(|time| !time.is_empty())
						.map(str::to_string)
						.collect(),
				),
				_ => ResponseKind::Unrecognized,
			}
		}
		_ => ResponseKind::Unrecognized,
	}
}

fn classify_slot_list(url: &str, records: &[Value]) -> ResponseKind {
	if records.is_empty() || queries_single_date(url) {
		return ResponseKind::Unrecognized;
	}
	let Some(first) = records.first().and_then(record_date) else {
		return ResponseKind::Unrecognized;
	};
	let mut dates = vec![first];
	dates.extend(records.iter().skip(1).filter_map(record_date));
	ResponseKind::SlotList(dates)
}

fn record_date(record: &Value) -> Option<NaiveDate> {
	record.get("date").and_then(Value::as_str).and_then(parse_date)
}

fn queries_single_date(url: &str) -> bool {
	let Some((_, query)) = url.split_once('?') else {
		return false;
	};
	let query = query.split('#').next().unwrap_or_default();
	query.split('&').any(|pair| pair.starts_with("date="))
}
