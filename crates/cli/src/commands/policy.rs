use serde::Serialize;
use shield::{CallingContext, DirectFetchError, FallbackAllowlist, FallbackDecision, FallbackGate, FallbackRequest, ShieldConfig, is_eligible};

use crate::error::{CliError, Result};

pub struct PolicyArgs {
	pub status: Option<u16>,
	pub code: Option<String>,
	pub allow_status: Vec<u16>,
	pub allow_code: Vec<String>,
	pub base_url: Option<String>,
	pub context: CallingContext,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReport {
	pub eligible: bool,
	/// Allowlist the decision was made against.
	pub allowlist: FallbackAllowlist,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub decision: Option<FallbackDecision>,
}

pub fn execute(args: PolicyArgs, config: &ShieldConfig) -> Result<PolicyReport> {
	if args.status.is_none() && args.code.is_none() {
		return Err(CliError::InvalidInput("pass --status and/or --code".into()));
	}
	let error = DirectFetchError {
		status: args.status,
		code: args.code,
		message: String::new(),
	};

	let allowlist = if args.allow_status.is_empty() && args.allow_code.is_empty() {
		config.fallback.allowlist.clone()
	} else {
		Some(FallbackAllowlist::new(args.allow_status, args.allow_code))
	};

	let eligible = is_eligible(&error, allowlist.as_ref());
	let decision = args.base_url.map(|base_url| {
		let request = FallbackRequest::new(base_url).with_context(args.context);
		FallbackGate::new(config.fallback.preferences.clone()).evaluate(&error, allowlist.as_ref(), &request)
	});

	Ok(PolicyReport {
		eligible,
		allowlist: allowlist.unwrap_or_else(FallbackAllowlist::conservative_default),
		decision,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(status: Option<u16>, allow_status: Vec<u16>) -> PolicyArgs {
		PolicyArgs {
			status,
			code: None,
			allow_status,
			allow_code: Vec::new(),
			base_url: None,
			context: CallingContext::Background,
		}
	}

	#[test]
	fn explicit_allowlist_replaces_configured_one() {
		let report = execute(args(Some(500), vec![403, 429]), &ShieldConfig::default()).unwrap();
		assert!(!report.eligible);
		assert_eq!(report.allowlist, FallbackAllowlist::new([403, 429], Vec::<String>::new()));
	}

	#[test]
	fn conservative_default_applies_without_allowlist() {
		let report = execute(args(Some(403), Vec::new()), &ShieldConfig::default()).unwrap();
		assert!(report.eligible);
		assert!(report.decision.is_none());
	}

	#[test]
	fn disabled_preferences_block_with_code() {
		let mut config = ShieldConfig::default();
		config.fallback.preferences.enabled = false;
		let report = execute(
			PolicyArgs {
				base_url: Some("https://api.example.com".into()),
				..args(Some(403), Vec::new())
			},
			&config,
		)
		.unwrap();
		match report.decision {
			Some(FallbackDecision::Skip { blocked_code, .. }) => assert_eq!(blocked_code.as_deref(), Some(shield::policy::TEMP_WINDOW_DISABLED)),
			other => panic!("unexpected decision {other:?}"),
		}
	}

	#[test]
	fn needs_status_or_code() {
		assert!(matches!(execute(args(None, Vec::new()), &ShieldConfig::default()), Err(CliError::InvalidInput(_))));
	}
}
