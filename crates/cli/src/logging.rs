use tracing_subscriber::EnvFilter;

/// Default filter for a `-v` count. Notifications stay visible at every level.
pub fn default_directive(verbose: u8) -> &'static str {
	match verbose {
		0 => "warn,slotwatch::notify=info",
		1 => "info",
		2 => "debug",
		_ => "trace",
	}
}

/// Installs the global subscriber. `RUST_LOG` wins over `-v` when set.
pub fn init_logging(verbose: u8) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
	let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verbosity_maps_to_levels() {
		assert_eq!(default_directive(0), "warn,slotwatch::notify=info");
		assert_eq!(default_directive(1), "info");
		assert_eq!(default_directive(2), "debug");
		assert_eq!(default_directive(7), "trace");
	}

	#[test]
	fn quiet_filter_still_shows_notifications() {
		use tracing::Level;
		use tracing::level_filters::LevelFilter;

		let filter = EnvFilter::try_new(default_directive(0)).unwrap();
		assert_eq!(filter.max_level_hint(), Some(LevelFilter::from_level(Level::INFO)));
	}
}
