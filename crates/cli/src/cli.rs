use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "slotwatch")]
#[command(about = "Watch a scheduling portal for an earlier slot and book it")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Monitor, verify and book until a slot is claimed or the run ends
	Run(RunArgs),

	/// Print the effective configuration with secrets redacted
	CheckConfig,

	/// Show the credential ledger (bans and cooldowns)
	Ledger {
		/// Ledger file; defaults to LEDGER_PATH or slotwatch-ledger.json
		#[arg(long, value_name = "FILE")]
		path: Option<PathBuf>,

		/// Remove cooldowns whose deadline has passed
		#[arg(long)]
		clear_cooldowns: bool,
	},
}

#[derive(Args, Debug)]
pub struct RunArgs {
	/// Site profile JSON with portal URLs, selectors and page phrases
	#[arg(long, value_name = "FILE")]
	pub site: PathBuf,

	/// Show the browser window
	#[arg(long)]
	pub headful: bool,

	/// Chrome/Chromium executable; discovered when omitted
	#[arg(long, value_name = "PATH")]
	pub browser: Option<PathBuf>,
}
