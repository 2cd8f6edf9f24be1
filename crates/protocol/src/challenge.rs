//! Interactive challenge (Turnstile-style widget) types.

use serde::{Deserialize, Serialize};

/// Declarative action that reveals a challenge widget rendered only after a
/// user gesture. Interpreted by the sandbox script; never a per-site script.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PreTrigger {
	/// Observe only.
	#[default]
	None,
	/// Click the most likely "check-in" button using the built-in text patterns.
	CheckinButton,
	/// Click the first element matching a CSS selector.
	ClickSelector {
		selector: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		label: Option<String>,
	},
	/// Click the shortest-labelled candidate whose text matches `positive_pattern`
	/// and does not match `negative_pattern`. Patterns are case-insensitive.
	ClickText {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		candidate_selector: Option<String>,
		positive_pattern: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		negative_pattern: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		label: Option<String>,
	},
}

/// Click throttling applied by the sandbox script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerThrottle {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub min_interval_ms: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreTriggerSpec {
	#[serde(default)]
	pub trigger: PreTrigger,
	#[serde(default)]
	pub throttle: TriggerThrottle,
}

impl PreTriggerSpec {
	pub fn new(trigger: PreTrigger) -> Self {
		Self {
			trigger,
			throttle: TriggerThrottle::default(),
		}
	}
}

/// Caller-supplied challenge options carried inside a
/// [`FetchSpec`](crate::FetchSpec).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout_ms: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pre_trigger: Option<PreTriggerSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
	NotPresent,
	TokenObtained,
	Timeout,
}

/// DOM markers the sandbox script saw while looking for a widget.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeDetection {
	#[serde(default)]
	pub has_widget: bool,
	#[serde(default)]
	pub score: u32,
	#[serde(default)]
	pub reasons: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
}

/// What the pre-trigger did, as reported by the sandbox script.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreTriggerAttempt {
	#[serde(default)]
	pub attempted: bool,
	#[serde(default)]
	pub method: String,
	#[serde(default)]
	pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeWaitResult {
	pub status: ChallengeStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detection: Option<ChallengeDetection>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pre_trigger: Option<PreTriggerAttempt>,
}

impl ChallengeWaitResult {
	pub fn not_present() -> Self {
		Self {
			status: ChallengeStatus::NotPresent,
			token: None,
			detection: None,
			pre_trigger: None,
		}
	}

	pub fn timed_out() -> Self {
		Self {
			status: ChallengeStatus::Timeout,
			token: None,
			detection: None,
			pre_trigger: None,
		}
	}

	pub fn token_obtained(token: impl Into<String>) -> Self {
		Self {
			status: ChallengeStatus::TokenObtained,
			token: Some(token.into()),
			detection: None,
			pre_trigger: None,
		}
	}

	/// Token usable for the relayed fetch, if one was obtained.
	pub fn usable_token(&self) -> Option<&str> {
		match self.status {
			ChallengeStatus::TokenObtained => self.token.as_deref().map(str::trim).filter(|t| !t.is_empty()),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn pre_trigger_kinds_use_camel_case_tags() {
		let trigger: PreTrigger = serde_json::from_value(json!({
			"kind": "clickText",
			"positivePattern": "check\\s*in",
			"negativePattern": "already"
		}))
		.unwrap();

		match trigger {
			PreTrigger::ClickText {
				positive_pattern,
				negative_pattern,
				candidate_selector,
				..
			} => {
				assert_eq!(positive_pattern, "check\\s*in");
				assert_eq!(negative_pattern.as_deref(), Some("already"));
				assert!(candidate_selector.is_none());
			}
			other => panic!("unexpected trigger {other:?}"),
		}

		let value = serde_json::to_value(PreTrigger::CheckinButton).unwrap();
		assert_eq!(value, json!({"kind": "checkinButton"}));
	}

	#[test]
	fn usable_token_requires_obtained_status() {
		let mut result = ChallengeWaitResult::token_obtained("  tok  ");
		assert_eq!(result.usable_token(), Some("tok"));

		result.status = ChallengeStatus::Timeout;
		assert_eq!(result.usable_token(), None);

		assert_eq!(ChallengeWaitResult::token_obtained("   ").usable_token(), None);
	}

	#[test]
	fn wait_result_parses_script_reply() {
		let result: ChallengeWaitResult = serde_json::from_value(json!({
			"status": "token_obtained",
			"token": "0.abc",
			"detection": {"hasWidget": true, "score": 5, "reasons": ["cf-turnstile-response-field"]}
		}))
		.unwrap();

		assert_eq!(result.status, ChallengeStatus::TokenObtained);
		assert!(result.detection.unwrap().has_widget);
	}
}
