use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use shield::CallingContext;

use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "shield")]
#[command(about = "Sandboxed fetch fallback - inspect policy, rules and relay runs")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug). SHIELD_LOG overrides.
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// JSON configuration file (defaults apply to omitted fields)
	#[arg(short, long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Output format
	#[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Json)]
	pub format: OutputFormat,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Decide whether a failed direct fetch qualifies for the fallback
	Policy {
		/// HTTP status of the failed request
		#[arg(long)]
		status: Option<u16>,

		/// Symbolic error code of the failed request
		#[arg(long)]
		code: Option<String>,

		/// Allowlisted status (repeatable); replaces the configured allowlist
		#[arg(long = "allow-status", value_name = "STATUS")]
		allow_status: Vec<u16>,

		/// Allowlisted error code (repeatable); replaces the configured allowlist
		#[arg(long = "allow-code", value_name = "CODE")]
		allow_code: Vec<String>,

		/// Base URL of the account; enables the full gate evaluation
		#[arg(long)]
		base_url: Option<String>,

		/// Where the request originated
		#[arg(long, value_enum, default_value_t = ContextArg::Background)]
		context: ContextArg,
	},

	/// Render the cookie isolation rule for a sandbox tab
	Rule {
		/// Sandbox tab id
		#[arg(long)]
		tab: u32,

		/// URL the relayed requests go to
		#[arg(long)]
		url: String,

		/// Cookie header value to pin to the tab
		#[arg(long)]
		cookie: String,
	},

	/// Run one relay against a scripted sandbox
	#[command(alias = "sim")]
	Simulate {
		/// Scenario file (JSON)
		#[arg(long, short)]
		scenario: PathBuf,
	},

	/// Print the effective configuration
	Config,
}

impl Commands {
	pub fn name(&self) -> &'static str {
		match self {
			Commands::Policy { .. } => "policy",
			Commands::Rule { .. } => "rule",
			Commands::Simulate { .. } => "simulate",
			Commands::Config => "config",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ContextArg {
	Background,
	Popup,
	SidePanel,
	Options,
	Page,
}

impl From<ContextArg> for CallingContext {
	fn from(arg: ContextArg) -> Self {
		match arg {
			ContextArg::Background => CallingContext::Background,
			ContextArg::Popup => CallingContext::Popup,
			ContextArg::SidePanel => CallingContext::SidePanel,
			ContextArg::Options => CallingContext::Options,
			ContextArg::Page => CallingContext::Page,
		}
	}
}

#[cfg(test)]
mod tests {
	use clap::CommandFactory;

	use super::*;

	#[test]
	fn cli_definition_is_consistent() {
		Cli::command().debug_assert();
	}

	#[test]
	fn repeatable_allowlist_flags() {
		let cli = Cli::parse_from(["shield", "policy", "--status", "500", "--allow-status", "403", "--allow-status", "429"]);
		match cli.command {
			Commands::Policy { status, allow_status, .. } => {
				assert_eq!(status, Some(500));
				assert_eq!(allow_status, vec![403, 429]);
			}
			other => panic!("unexpected command {other:?}"),
		}
	}

	#[test]
	fn global_flags_after_subcommand() {
		let cli = Cli::parse_from(["shield", "config", "-vv", "--format", "text"]);
		assert_eq!(cli.verbose, 2);
		assert_eq!(cli.format, OutputFormat::Text);
	}
}
