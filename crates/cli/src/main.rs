use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use shield::ShieldConfig;
use shield_cli::cli::Cli;
use shield_cli::error::Result;
use shield_cli::output::Envelope;
use shield_cli::{commands, logging};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let started = Instant::now();
	let name = cli.command.name();
	let result = match load_config(cli.config.as_deref()) {
		Ok(config) => commands::dispatch(cli.command, &config).await,
		Err(err) => Err(err),
	};

	match result {
		Ok(data) => {
			Envelope::success(name, data, started).print(cli.format);
			ExitCode::SUCCESS
		}
		Err(err) => {
			error!(target = "shield", command = name, error = %err, "command failed");
			Envelope::failure(name, &err, started).print(cli.format);
			ExitCode::FAILURE
		}
	}
}

fn load_config(path: Option<&Path>) -> Result<ShieldConfig> {
	match path {
		Some(path) => Ok(ShieldConfig::from_file(path)?),
		None => Ok(ShieldConfig::default()),
	}
}
