use std::fmt;
use std::path::PathBuf;

use shield_protocol::{RelayStep, TabId};
use thiserror::Error;

/// Errors from the browser-facing host surfaces.
#[derive(Debug, Error)]
pub enum HostError {
	#[error("Sandbox creation failed: {0}")]
	CreateFailed(String),

	#[error("Tab {0} not found")]
	TabNotFound(TabId),

	#[error("Header rules unsupported: {0}")]
	Unsupported(String),

	#[error("Host call failed: {0}")]
	Failed(String),

	#[error("Malformed reply to {action}: {reason}")]
	MalformedReply { action: &'static str, reason: String },

	#[error(transparent)]
	Runtime(#[from] shield_runtime::Error),
}

impl HostError {
	/// Whether the exchange ran out of time rather than failing outright.
	pub fn is_timeout(&self) -> bool {
		matches!(self, HostError::Runtime(shield_runtime::Error::Timeout(_)))
	}
}

#[derive(Debug, Error)]
pub enum PoolError {
	#[error("Sandbox creation failed: {0}")]
	CreationFailed(String),

	#[error("Sandbox {tab_id} did not finish loading within {waited_ms} ms")]
	LoadTimeout { tab_id: TabId, waited_ms: u64 },

	#[error("Account {account_id} already holds {cap} sandboxes")]
	Exhausted { account_id: String, cap: usize },

	#[error("Timed out waiting for a sandbox slot for account {account_id}")]
	QueueTimeout { account_id: String },

	#[error("Context pool is shut down")]
	ShutDown,

	#[error("Illegal context transition for tab {tab_id}: {from:?} -> {to:?}")]
	InvalidTransition {
		tab_id: TabId,
		from: crate::pool::ContextState,
		to: crate::pool::ContextState,
	},

	#[error(transparent)]
	Host(#[from] HostError),
}

impl PoolError {
	/// Slot exhaustion is a capacity condition; everything else means no
	/// sandbox could be produced.
	pub fn is_capacity(&self) -> bool {
		matches!(self, PoolError::Exhausted { .. } | PoolError::QueueTimeout { .. })
	}
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("Failed to read config {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Failed to parse config: {0}")]
	Parse(#[from] serde_json::Error),

	#[error("Invalid config: {0}")]
	Invalid(String),
}

/// Which protection guard refused the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardFailure {
	Cap,
	Cloudflare,
	Both,
}

impl fmt::Display for GuardFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			GuardFailure::Cap => "cap",
			GuardFailure::Cloudflare => "cloudflare",
			GuardFailure::Both => "both",
		})
	}
}

/// Terminal failures of one relay run. Rendered into `FetchOutcome.error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
	#[error("ContextCreationFailed: {0}")]
	ContextCreationFailed(String),

	#[error("GuardNotPassed:{0}")]
	GuardNotPassed(GuardFailure),

	#[error("RelayedFetchFailed: {0}")]
	RelayedFetchFailed(String),

	#[error("Cancelled")]
	Cancelled,

	#[error("Timeout:{step}")]
	Timeout { step: RelayStep },

	#[error("PoolExhausted: {0}")]
	PoolExhausted(String),

	#[error("InvalidRequest: {0}")]
	InvalidRequest(String),
}

impl RelayError {
	/// Whether the sandbox must be destroyed rather than returned to the pool.
	pub fn poisons_context(&self) -> bool {
		matches!(self, RelayError::GuardNotPassed(_) | RelayError::Cancelled | RelayError::Timeout { .. })
	}
}

impl From<PoolError> for RelayError {
	fn from(err: PoolError) -> Self {
		if err.is_capacity() {
			RelayError::PoolExhausted(err.to_string())
		} else {
			RelayError::ContextCreationFailed(err.to_string())
		}
	}
}

pub type Result<T, E = HostError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reasons_carry_the_failing_detail() {
		assert_eq!(RelayError::GuardNotPassed(GuardFailure::Cloudflare).to_string(), "GuardNotPassed:cloudflare");
		assert_eq!(
			RelayError::Timeout {
				step: RelayStep::AwaitGuards
			}
			.to_string(),
			"Timeout:AwaitGuards"
		);
	}

	#[test]
	fn pool_errors_split_into_capacity_and_creation() {
		let exhausted = PoolError::Exhausted {
			account_id: "a".into(),
			cap: 2,
		};
		assert!(matches!(RelayError::from(exhausted), RelayError::PoolExhausted(_)));

		let created = PoolError::CreationFailed("no tab id".into());
		assert!(matches!(RelayError::from(created), RelayError::ContextCreationFailed(_)));
	}
}
