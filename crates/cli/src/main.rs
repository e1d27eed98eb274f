use clap::Parser;
use slotwatch_cli::{cli::Cli, commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	match commands::dispatch(cli.command).await {
		Ok(code) => std::process::exit(code),
		Err(err) => {
			error!(target = "slotwatch", error = %err, "command failed");
			eprintln!("error: {err:#}");
			std::process::exit(1);
		}
	}
}
