//! Interactive challenge token waiter.
//!
//! The page script looks for a challenge widget, optionally clicks something
//! to make it render, and waits for the widget to produce a token. All of
//! that happens inside the sandbox tab; this side only bounds the wait and
//! normalises the declarative trigger it sends along.

use std::sync::Arc;
use std::time::Duration;

use regex::RegexBuilder;
use shield_protocol::{ChallengeStatus, ChallengeWaitResult, PreTrigger, PreTriggerSpec, RequestId, SandboxRequest, TabId, TriggerThrottle};
use tracing::{debug, info, warn};

use crate::config::ChallengeConfig;
use crate::host::PageMessenger;

pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
pub const MIN_TIMEOUT_MS: u64 = 500;
pub const MAX_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_MIN_INTERVAL_MS: u64 = 1_200;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const MAX_ATTEMPTS_LIMIT: u32 = 5;
pub const MAX_PATTERN_LENGTH: usize = 200;

pub const DEFAULT_CANDIDATE_SELECTOR: &str = r#"button, a, [role="button"]"#;
pub const DEFAULT_POSITIVE_PATTERN: &str = r"(签到|check\s*in|checkin)";
pub const DEFAULT_NEGATIVE_PATTERN: &str = r"(已签到|already)";

/// Clamps a requested wait into `[MIN_TIMEOUT_MS, MAX_TIMEOUT_MS]`.
pub fn clamp_timeout(requested: Option<u64>, default_ms: u64) -> u64 {
	requested.unwrap_or(default_ms).clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

fn trimmed(value: Option<String>) -> Option<String> {
	value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Accepts a pattern only if it is short and compiles case-insensitively.
fn usable_pattern(pattern: Option<String>) -> Option<String> {
	let pattern = trimmed(pattern)?;
	if pattern.chars().count() > MAX_PATTERN_LENGTH {
		return None;
	}
	RegexBuilder::new(&pattern).case_insensitive(true).build().ok()?;
	Some(pattern)
}

/// Fills throttle defaults and replaces unusable trigger fields.
///
/// A `clickSelector` without a selector becomes `none`. `clickText` patterns
/// that are too long or fail to compile fall back to the check-in defaults
/// (positive) or to no filter (negative).
pub fn normalize_pre_trigger(spec: PreTriggerSpec) -> PreTriggerSpec {
	let trigger = match spec.trigger {
		PreTrigger::None => PreTrigger::None,
		PreTrigger::CheckinButton => PreTrigger::CheckinButton,
		PreTrigger::ClickSelector { selector, label } => match trimmed(Some(selector)) {
			Some(selector) => PreTrigger::ClickSelector {
				selector,
				label: trimmed(label),
			},
			None => PreTrigger::None,
		},
		PreTrigger::ClickText {
			candidate_selector,
			positive_pattern,
			negative_pattern,
			label,
		} => PreTrigger::ClickText {
			candidate_selector: Some(trimmed(candidate_selector).unwrap_or_else(|| DEFAULT_CANDIDATE_SELECTOR.to_string())),
			positive_pattern: usable_pattern(Some(positive_pattern)).unwrap_or_else(|| DEFAULT_POSITIVE_PATTERN.to_string()),
			negative_pattern: usable_pattern(negative_pattern),
			label: trimmed(label),
		},
	};

	let throttle = TriggerThrottle {
		min_interval_ms: Some(spec.throttle.min_interval_ms.unwrap_or(DEFAULT_MIN_INTERVAL_MS)),
		max_attempts: Some(spec.throttle.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).min(MAX_ATTEMPTS_LIMIT)),
	};

	PreTriggerSpec { trigger, throttle }
}

pub struct ChallengeWaiter {
	messenger: Arc<dyn PageMessenger>,
	config: ChallengeConfig,
}

impl ChallengeWaiter {
	pub fn new(messenger: Arc<dyn PageMessenger>, config: ChallengeConfig) -> Self {
		Self { messenger, config }
	}

	/// Longest this waiter can take for a requested timeout.
	pub fn budget(&self, timeout_ms: Option<u64>) -> Duration {
		Duration::from_millis(clamp_timeout(timeout_ms, self.config.default_timeout_ms) + self.config.reply_grace_ms)
	}

	/// Asks the page to wait for a challenge token.
	///
	/// Never fails: a messaging error, a silent page or a malformed reply
	/// all come back as [`ChallengeStatus::Timeout`] without a token.
	pub async fn wait_for_token(
		&self,
		tab_id: TabId,
		request_id: &RequestId,
		page_url: &str,
		timeout_ms: Option<u64>,
		pre_trigger: Option<PreTriggerSpec>,
	) -> ChallengeWaitResult {
		let timeout_ms = clamp_timeout(timeout_ms, self.config.default_timeout_ms);
		let pre_trigger = pre_trigger.map(normalize_pre_trigger);
		let request = SandboxRequest::WaitForChallengeToken {
			page_url: page_url.to_string(),
			timeout_ms,
			pre_trigger,
		};

		let value = match self.messenger.send(tab_id, request, self.budget(Some(timeout_ms))).await {
			Ok(value) => value,
			Err(e) => {
				warn!(target = "shield.challenge", %request_id, %tab_id, error = %e, "challenge wait failed");
				return ChallengeWaitResult::timed_out();
			}
		};

		let result = match serde_json::from_value::<ChallengeWaitResult>(value) {
			Ok(result) => result,
			Err(e) => {
				warn!(target = "shield.challenge", %request_id, %tab_id, error = %e, "malformed challenge reply");
				return ChallengeWaitResult::timed_out();
			}
		};

		if result.status == ChallengeStatus::TokenObtained && result.usable_token().is_none() {
			debug!(target = "shield.challenge", %request_id, %tab_id, "token status without a token");
			return ChallengeWaitResult {
				status: ChallengeStatus::Timeout,
				token: None,
				..result
			};
		}

		info!(target = "shield.challenge", %request_id, %tab_id, status = ?result.status, "challenge wait finished");
		result
	}
}
