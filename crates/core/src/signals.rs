//! Page-text signals the supervisor reacts to.

/// What the visible page text says about the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSignal {
	/// The account is locked; the credential must be retired.
	AccountLocked,
	/// The remote session expired; rebuild.
	SessionExpired,
	/// Rate limited; back off without rebuilding.
	SystemBusy,
	Clear,
}

const LOCKED: &[&str] = &["account locked", "account has been locked", "your account is locked"];
const EXPIRED: &[&str] = &["session expired", "session has expired", "sign in or sign up before continuing"];
const BUSY: &[&str] = &["system is busy", "system busy", "too many requests"];

impl PageSignal {
	/// Classifies page text. Lockout wins over expiry, expiry over busy.
	pub fn from_text(text: &str) -> Self {
		let text = text.to_lowercase();
		let any = |phrases: &[&str]| phrases.iter().any(|phrase| text.contains(phrase));
		if any(LOCKED) {
			PageSignal::AccountLocked
		} else if any(EXPIRED) {
			PageSignal::SessionExpired
		} else if any(BUSY) {
			PageSignal::SystemBusy
		} else {
			PageSignal::Clear
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn phrases_are_matched_case_insensitively() {
		assert_eq!(PageSignal::from_text("Your Session Has Expired."), PageSignal::SessionExpired);
		assert_eq!(PageSignal::from_text("429 Too Many Requests"), PageSignal::SystemBusy);
		assert_eq!(PageSignal::from_text("The system is busy. Please try later"), PageSignal::SystemBusy);
		assert_eq!(PageSignal::from_text("Account Locked"), PageSignal::AccountLocked);
		assert_eq!(PageSignal::from_text("Schedule appointment"), PageSignal::Clear);
	}

	#[test]
	fn lockout_takes_precedence() {
		let text = "Too many requests. Your account has been locked and your session expired.";
		assert_eq!(PageSignal::from_text(text), PageSignal::AccountLocked);
	}

	#[test]
	fn expiry_beats_busy() {
		assert_eq!(PageSignal::from_text("system busy; session expired"), PageSignal::SessionExpired);
	}
}
