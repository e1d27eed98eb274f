use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use slotwatch::config::DEFAULT_LEDGER_PATH;
use slotwatch::notify::LogDelivery;
use slotwatch::{AccountGovernor, Clock, Deliver, EngineConfig, JsonLedger, LedgerStore, NotificationHub, SessionSupervisor, SystemClock};
use slotwatch_cdp::{CdpFactory, SiteProfile};
use tracing::{info, warn};

use crate::cli::{Commands, RunArgs};
use crate::telegram::TelegramDelivery;

/// Time given to queued notifications after the run ends.
const NOTIFY_DRAIN: Duration = Duration::from_secs(5);

/// Runs one command and returns the process exit code.
pub async fn dispatch(command: Commands) -> anyhow::Result<i32> {
	match command {
		Commands::Run(args) => run(args).await,
		Commands::CheckConfig => {
			println!("{}", check_config(std::env::vars())?);
			Ok(0)
		}
		Commands::Ledger { path, clear_cooldowns } => {
			let path = path.unwrap_or_else(default_ledger_path);
			let store: Arc<dyn LedgerStore> = Arc::new(JsonLedger::new(path));
			println!("{}", ledger(store, Arc::new(SystemClock), clear_cooldowns)?);
			Ok(0)
		}
	}
}

fn default_ledger_path() -> PathBuf {
	std::env::var("LEDGER_PATH")
		.ok()
		.filter(|value| !value.trim().is_empty())
		.unwrap_or_else(|| DEFAULT_LEDGER_PATH.to_string())
		.into()
}

/// Effective configuration as pretty JSON with secrets redacted.
pub fn check_config<I, K, V>(vars: I) -> anyhow::Result<String>
where
	I: IntoIterator<Item = (K, V)>,
	K: Into<String>,
	V: Into<String>,
{
	let config = EngineConfig::from_vars(vars)?;
	Ok(serde_json::to_string_pretty(&config.redacted())?)
}

/// Ledger contents as pretty JSON, optionally after pruning expired cooldowns.
pub fn ledger(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, clear_cooldowns: bool) -> anyhow::Result<String> {
	let governor = AccountGovernor::load(store, clock).context("reading ledger")?;
	if clear_cooldowns {
		let removed = governor.prune_expired_cooldowns()?;
		info!(target = "slotwatch", removed, "expired cooldowns cleared");
	}
	Ok(serde_json::to_string_pretty(&governor.snapshot())?)
}

fn delivery(config: &EngineConfig) -> Arc<dyn Deliver> {
	match &config.telegram {
		Some(settings) => Arc::new(TelegramDelivery::new(settings.clone())),
		None => Arc::new(LogDelivery),
	}
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
	let config = EngineConfig::from_vars(std::env::vars())?;
	let profile = SiteProfile::load(&args.site).with_context(|| format!("loading site profile {}", args.site.display()))?;

	let mut factory = CdpFactory::new(profile).headful(args.headful);
	if let Some(browser) = args.browser {
		factory = factory.with_executable(browser);
	}

	let clock: Arc<dyn Clock> = Arc::new(SystemClock);
	let store: Arc<dyn LedgerStore> = Arc::new(JsonLedger::new(config.ledger_path.clone()));
	let governor = Arc::new(AccountGovernor::load(store, Arc::clone(&clock)).context("reading ledger")?);
	let (hub, worker) = NotificationHub::spawn(delivery(&config));

	info!(
		target = "slotwatch",
		email = %config.primary.email,
		facility = %config.facility,
		verification = config.verify.is_some(),
		"starting"
	);
	let supervisor = SessionSupervisor::new(&config, Arc::new(factory), clock, governor, Arc::new(hub));

	let interrupted = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			warn!(target = "slotwatch", error = %err, "ctrl-c handler unavailable");
			std::future::pending::<()>().await;
		}
	};
	let code = tokio::select! {
		reason = supervisor.run() => {
			info!(target = "slotwatch", %reason, code = reason.exit_code(), "run ended");
			reason.exit_code()
		}
		() = interrupted => {
			info!(target = "slotwatch", "interrupted; shutting down");
			0
		}
	};

	drop(supervisor);
	if tokio::time::timeout(NOTIFY_DRAIN, worker).await.is_err() {
		warn!(target = "slotwatch", "notifications still queued at exit");
	}
	Ok(code)
}
