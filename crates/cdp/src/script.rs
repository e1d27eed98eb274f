//! Page scripts evaluated through `Runtime.evaluate`.
//!
//! Selectors and values are embedded as JSON string literals, so quoting in
//! either never breaks out of the expression. Scripts that act on an element
//! return `false` when it is missing.

use serde_json::Value;

fn lit(value: &str) -> String {
	Value::String(value.to_string()).to_string()
}

pub fn exists(selector: &str) -> String {
	format!("document.querySelector({}) !== null", lit(selector))
}

pub fn body_text() -> String {
	"document.body ? document.body.innerText : ''".to_string()
}

pub fn ready_state() -> String {
	"document.readyState".to_string()
}

pub fn fill(selector: &str, value: &str) -> String {
	format!(
		"(() => {{ const el = document.querySelector({}); if (!el) return false; el.focus(); el.value = {}; \
		 el.dispatchEvent(new Event('input', {{ bubbles: true }})); el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
		lit(selector),
		lit(value)
	)
}

pub fn click(selector: &str) -> String {
	format!(
		"(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
		lit(selector)
	)
}

/// Checks a checkbox without toggling it off when already checked.
pub fn check(selector: &str) -> String {
	format!(
		"(() => {{ const el = document.querySelector({}); if (!el) return false; if (!el.checked) el.click(); return true; }})()",
		lit(selector)
	)
}

/// Visible labels of a select's options, skipping the empty placeholder.
pub fn option_labels(selector: &str) -> String {
	format!(
		"(() => {{ const el = document.querySelector({}); if (!el) return null; \
		 return Array.from(el.options).map(o => o.text.trim()).filter(t => t.length > 0); }})()",
		lit(selector)
	)
}

/// Selects the option whose label equals `label` and fires `change`.
pub fn select_by_label(selector: &str, label: &str) -> String {
	format!(
		"(() => {{ const el = document.querySelector({}); if (!el) return false; \
		 const opt = Array.from(el.options).find(o => o.text.trim() === {}); if (!opt) return false; \
		 el.value = opt.value; el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
		lit(selector),
		lit(label)
	)
}

/// Re-fires `change` on a control without altering its value.
pub fn redispatch_change(selector: &str) -> String {
	format!(
		"(() => {{ const el = document.querySelector({}); if (!el) return false; \
		 el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
		lit(selector)
	)
}

pub fn liveness() -> String {
	"1 + 1".to_string()
}
