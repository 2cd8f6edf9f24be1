//! Message contract with the script running inside a sandbox tab.
//!
//! Requests are tagged by `action`:
//!
//! ```json
//! { "action": "checkCapGuard" }
//! { "action": "waitForChallengeToken", "pageUrl": "https://x/", "timeoutMs": 15000, "preTrigger": null }
//! { "action": "performRelayedFetch", "fetchUrl": "https://x/api", "fetchOptions": {}, "responseType": "json" }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::challenge::PreTriggerSpec;
use crate::fetch::{FetchOptions, ResponseType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SandboxRequest {
	CheckCapGuard,
	CheckCloudflareGuard,
	WaitForChallengeToken {
		page_url: String,
		timeout_ms: u64,
		pre_trigger: Option<PreTriggerSpec>,
	},
	PerformRelayedFetch {
		fetch_url: String,
		fetch_options: FetchOptions,
		response_type: ResponseType,
	},
}

impl SandboxRequest {
	/// Wire name of the action, for logging.
	pub fn action(&self) -> &'static str {
		match self {
			SandboxRequest::CheckCapGuard => "checkCapGuard",
			SandboxRequest::CheckCloudflareGuard => "checkCloudflareGuard",
			SandboxRequest::WaitForChallengeToken { .. } => "waitForChallengeToken",
			SandboxRequest::PerformRelayedFetch { .. } => "performRelayedFetch",
		}
	}
}

/// Reply to `checkCapGuard` and `checkCloudflareGuard`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuardReply {
	pub success: bool,
	#[serde(default)]
	pub passed: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl GuardReply {
	pub fn passed() -> Self {
		Self {
			success: true,
			passed: true,
			error: None,
		}
	}

	pub fn blocked() -> Self {
		Self {
			success: true,
			passed: false,
			error: None,
		}
	}

	/// A guard only counts as passed when the script both succeeded and said so.
	pub fn is_pass(&self) -> bool {
		self.success && self.passed
	}
}

/// Reply to `performRelayedFetch`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelayReply {
	pub success: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
	#[serde(default)]
	pub data: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl RelayReply {
	pub fn ok(status: u16, data: Value) -> Self {
		Self {
			success: true,
			status: Some(status),
			headers: BTreeMap::new(),
			data,
			error: None,
		}
	}
}
