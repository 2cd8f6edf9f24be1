//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Durations are stored as milliseconds and exposed as [`Duration`]s.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{FallbackAllowlist, FallbackPreferences};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShieldConfig {
	pub pool: PoolConfig,
	pub guards: GuardConfig,
	pub challenge: ChallengeConfig,
	pub rules: RuleConfig,
	pub relay: RelayConfig,
	pub fallback: FallbackConfig,
}

impl ShieldConfig {
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_json(&raw)
	}

	pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
		let config: Self = serde_json::from_str(raw)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let nonzero = [
			("pool.maxContextsPerAccount", self.pool.max_contexts_per_account as u64),
			("pool.queueTimeoutMs", self.pool.queue_timeout_ms),
			("pool.loadTimeoutMs", self.pool.load_timeout_ms),
			("pool.loadPollIntervalMs", self.pool.load_poll_interval_ms),
			("guards.probeTimeoutMs", self.guards.probe_timeout_ms),
			("guards.pollIntervalMs", self.guards.poll_interval_ms),
			("guards.guardTimeoutMs", self.guards.guard_timeout_ms),
			("challenge.defaultTimeoutMs", self.challenge.default_timeout_ms),
			("relay.acquireTimeoutMs", self.relay.acquire_timeout_ms),
			("relay.ruleTimeoutMs", self.relay.rule_timeout_ms),
			("relay.fetchTimeoutMs", self.relay.fetch_timeout_ms),
		];
		if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
			return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
		}

		if self.rules.base_rule_id == 0 {
			return Err(ConfigError::Invalid("rules.baseRuleId must be greater than zero".into()));
		}
		if self.relay.token_query_param.trim().is_empty() {
			return Err(ConfigError::Invalid("relay.tokenQueryParam must not be empty".into()));
		}
		if self.guards.probe_timeout_ms > self.guards.guard_timeout_ms {
			return Err(ConfigError::Invalid("guards.probeTimeoutMs exceeds guards.guardTimeoutMs".into()));
		}
		Ok(())
	}
}

/// What to do when an account already holds its cap of sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
	/// Wait up to `queueTimeoutMs` for a slot.
	#[default]
	Queue,
	/// Fail immediately.
	Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
	pub max_contexts_per_account: usize,
	pub overflow: OverflowPolicy,
	pub queue_timeout_ms: u64,
	pub load_timeout_ms: u64,
	pub load_poll_interval_ms: u64,
	pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			max_contexts_per_account: 2,
			overflow: OverflowPolicy::Queue,
			queue_timeout_ms: 30_000,
			load_timeout_ms: 20_000,
			load_poll_interval_ms: 100,
			idle_timeout_ms: 5_000,
		}
	}
}

impl PoolConfig {
	pub fn queue_timeout(&self) -> Duration {
		Duration::from_millis(self.queue_timeout_ms)
	}

	pub fn load_timeout(&self) -> Duration {
		Duration::from_millis(self.load_timeout_ms)
	}

	pub fn load_poll_interval(&self) -> Duration {
		Duration::from_millis(self.load_poll_interval_ms)
	}

	/// `None` disables idle reaping.
	pub fn idle_timeout(&self) -> Option<Duration> {
		(self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardConfig {
	/// Timer for each individual guard exchange.
	pub probe_timeout_ms: u64,
	pub poll_interval_ms: u64,
	/// Overall budget for the guards to pass.
	pub guard_timeout_ms: u64,
}

impl Default for GuardConfig {
	fn default() -> Self {
		Self {
			probe_timeout_ms: 3_000,
			poll_interval_ms: 500,
			guard_timeout_ms: 20_000,
		}
	}
}

impl GuardConfig {
	pub fn probe_timeout(&self) -> Duration {
		Duration::from_millis(self.probe_timeout_ms)
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn guard_timeout(&self) -> Duration {
		Duration::from_millis(self.guard_timeout_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChallengeConfig {
	pub default_timeout_ms: u64,
	/// Extra time the exchange waits past the in-page timeout for the reply.
	pub reply_grace_ms: u64,
}

impl Default for ChallengeConfig {
	fn default() -> Self {
		Self {
			default_timeout_ms: crate::challenge::DEFAULT_TIMEOUT_MS,
			reply_grace_ms: 2_000,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleConfig {
	/// Rule id of tab `t` is `base_rule_id + t`.
	pub base_rule_id: u32,
	pub priority: u32,
	/// Extension-only headers stripped before the request leaves the sandbox.
	pub marker_headers: Vec<String>,
}

impl Default for RuleConfig {
	fn default() -> Self {
		Self {
			base_rule_id: 10_000,
			priority: 1,
			marker_headers: vec!["All-API-Hub".to_string()],
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
	pub acquire_timeout_ms: u64,
	pub rule_timeout_ms: u64,
	pub fetch_timeout_ms: u64,
	/// Query parameter carrying an obtained challenge token.
	pub token_query_param: String,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			acquire_timeout_ms: 60_000,
			rule_timeout_ms: 5_000,
			fetch_timeout_ms: 30_000,
			token_query_param: "turnstile".to_string(),
		}
	}
}

impl RelayConfig {
	pub fn acquire_timeout(&self) -> Duration {
		Duration::from_millis(self.acquire_timeout_ms)
	}

	pub fn rule_timeout(&self) -> Duration {
		Duration::from_millis(self.rule_timeout_ms)
	}

	pub fn fetch_timeout(&self) -> Duration {
		Duration::from_millis(self.fetch_timeout_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackConfig {
	/// `None` means the conservative default allowlist.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub allowlist: Option<FallbackAllowlist>,
	pub preferences: FallbackPreferences,
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn empty_object_is_the_default_config() {
		let config = ShieldConfig::from_json("{}").unwrap();
		assert_eq!(config, ShieldConfig::default());
		assert_eq!(config.pool.max_contexts_per_account, 2);
		assert_eq!(config.relay.token_query_param, "turnstile");
	}

	#[test]
	fn partial_sections_keep_other_defaults() {
		let config = ShieldConfig::from_json(r#"{"pool": {"overflow": "reject", "maxContextsPerAccount": 1}}"#).unwrap();
		assert_eq!(config.pool.overflow, OverflowPolicy::Reject);
		assert_eq!(config.pool.max_contexts_per_account, 1);
		assert_eq!(config.pool.load_timeout_ms, 20_000);
	}

	#[test]
	fn zero_values_are_rejected() {
		let err = ShieldConfig::from_json(r#"{"pool": {"maxContextsPerAccount": 0}}"#).unwrap_err();
		assert!(err.to_string().contains("pool.maxContextsPerAccount"));

		let err = ShieldConfig::from_json(r#"{"relay": {"tokenQueryParam": " "}}"#).unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn zero_idle_timeout_disables_reaping() {
		let config = ShieldConfig::from_json(r#"{"pool": {"idleTimeoutMs": 0}}"#).unwrap();
		assert_eq!(config.pool.idle_timeout(), None);
	}

	#[test]
	fn loads_from_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, r#"{{"guards": {{"pollIntervalMs": 50}}, "fallback": {{"allowlist": {{"statusCodes": [403]}}}}}}"#).unwrap();

		let config = ShieldConfig::from_file(file.path()).unwrap();
		assert_eq!(config.guards.poll_interval(), Duration::from_millis(50));
		let allowlist = config.fallback.allowlist.unwrap();
		assert!(allowlist.status_codes.contains(&403));
		assert!(allowlist.codes.is_empty());
	}

	#[test]
	fn missing_file_reports_path() {
		let err = ShieldConfig::from_file("/nonexistent/shield.json").unwrap_err();
		assert!(err.to_string().contains("/nonexistent/shield.json"));
	}
}
