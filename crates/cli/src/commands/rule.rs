use shield::ShieldConfig;
use shield::cookie_rule::build_rule;
use shield_protocol::{HeaderRule, TabId};

use crate::error::{CliError, Result};

pub fn execute(tab: u32, url: &str, cookie: &str, config: &ShieldConfig) -> Result<HeaderRule> {
	if cookie.trim().is_empty() {
		return Err(CliError::InvalidInput("--cookie must not be empty".into()));
	}
	build_rule(&config.rules, TabId(tab), url, cookie).map_err(CliError::InvalidInput)
}
