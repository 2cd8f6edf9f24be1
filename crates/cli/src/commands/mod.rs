//! Command implementations. Each returns the `data` payload of the envelope.

mod policy;
mod rule;
mod simulate;

use serde_json::Value;
use shield::ShieldConfig;

use crate::cli::Commands;
use crate::error::Result;

pub async fn dispatch(command: Commands, config: &ShieldConfig) -> Result<Value> {
	match command {
		Commands::Policy {
			status,
			code,
			allow_status,
			allow_code,
			base_url,
			context,
		} => {
			let args = policy::PolicyArgs {
				status,
				code,
				allow_status,
				allow_code,
				base_url,
				context: context.into(),
			};
			Ok(serde_json::to_value(policy::execute(args, config)?)?)
		}
		Commands::Rule { tab, url, cookie } => Ok(serde_json::to_value(rule::execute(tab, &url, &cookie, config)?)?),
		Commands::Simulate { scenario } => Ok(serde_json::to_value(simulate::execute(&scenario, config).await?)?),
		Commands::Config => Ok(serde_json::to_value(config)?),
	}
}
