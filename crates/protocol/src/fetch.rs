//! Request and outcome types for one relayed fetch.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::challenge::{ChallengeRequest, ChallengeWaitResult};
use crate::ids::{RequestId, TabId};

/// How the sandbox should decode the response body.
///
/// Binary variants travel as base64 strings across the message boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseType {
	#[default]
	Json,
	Text,
	ArrayBuffer,
	Blob,
}

impl ResponseType {
	pub fn is_binary(self) -> bool {
		matches!(self, ResponseType::ArrayBuffer | ResponseType::Blob)
	}
}

/// How the account authenticates against the target site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
	Cookie,
	#[default]
	AccessToken,
	None,
}

/// Options forwarded verbatim to the in-page `fetch` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
	#[serde(default = "default_method")]
	pub method: String,
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub body: Option<String>,
}

fn default_method() -> String {
	"GET".to_string()
}

impl Default for FetchOptions {
	fn default() -> Self {
		Self {
			method: default_method(),
			headers: BTreeMap::new(),
			body: None,
		}
	}
}

impl FetchOptions {
	pub fn get() -> Self {
		Self::default()
	}

	pub fn post(body: impl Into<String>) -> Self {
		Self {
			method: "POST".to_string(),
			body: Some(body.into()),
			..Self::default()
		}
	}

	pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.insert(name.into(), value.into());
		self
	}
}

/// Everything the orchestrator needs to replay one request through a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSpec {
	/// Site origin the sandbox is opened on.
	pub origin_url: String,
	/// URL the sandbox fetches once guards have passed.
	pub fetch_url: String,
	#[serde(default)]
	pub fetch_options: FetchOptions,
	#[serde(default)]
	pub response_type: ResponseType,
	pub request_id: RequestId,
	pub account_id: String,
	#[serde(default)]
	pub auth_type: AuthType,
	/// Pre-resolved `Cookie` header value for the account, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_cookie: Option<String>,
	/// Page observed for a challenge widget. Defaults to `origin_url`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub page_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub challenge: Option<ChallengeRequest>,
}

impl FetchSpec {
	pub fn new(origin_url: impl Into<String>, fetch_url: impl Into<String>, account_id: impl Into<String>) -> Self {
		Self {
			origin_url: origin_url.into(),
			fetch_url: fetch_url.into(),
			fetch_options: FetchOptions::default(),
			response_type: ResponseType::default(),
			request_id: RequestId::generate(),
			account_id: account_id.into(),
			auth_type: AuthType::default(),
			session_cookie: None,
			page_url: None,
			challenge: None,
		}
	}

	pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
		self.request_id = request_id.into();
		self
	}

	pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
		self.auth_type = AuthType::Cookie;
		self.session_cookie = Some(cookie.into());
		self
	}

	pub fn with_options(mut self, options: FetchOptions) -> Self {
		self.fetch_options = options;
		self
	}

	pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
		self.response_type = response_type;
		self
	}

	pub fn with_challenge(mut self, challenge: ChallengeRequest) -> Self {
		self.challenge = Some(challenge);
		self
	}

	pub fn with_page_url(mut self, page_url: impl Into<String>) -> Self {
		self.page_url = Some(page_url.into());
		self
	}

	/// Page the challenge waiter observes.
	pub fn challenge_page_url(&self) -> &str {
		self.page_url.as_deref().unwrap_or(&self.origin_url)
	}
}

/// Steps of the relay state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelayStep {
	Init,
	AcquireContext,
	InstallCookieRule,
	AwaitGuards,
	AwaitChallengeIfPresent,
	PerformRelayedFetch,
	Teardown,
	Done,
}

impl fmt::Display for RelayStep {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			RelayStep::Init => "Init",
			RelayStep::AcquireContext => "AcquireContext",
			RelayStep::InstallCookieRule => "InstallCookieRule",
			RelayStep::AwaitGuards => "AwaitGuards",
			RelayStep::AwaitChallengeIfPresent => "AwaitChallengeIfPresent",
			RelayStep::PerformRelayedFetch => "PerformRelayedFetch",
			RelayStep::Teardown => "Teardown",
			RelayStep::Done => "Done",
		};
		f.write_str(name)
	}
}

/// Whether the outgoing session cookie was isolated to the sandbox tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
	Installed,
	Unsupported,
	Failed,
	/// No cookie to isolate, or the run never reached the rule step.
	#[default]
	Skipped,
}

/// Non-fatal conditions recorded while the relay kept going.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Degradation {
	ChallengeTimeout,
	RuleInstallUnsupported { reason: String },
	RuleInstallFailed { reason: String },
}

/// Diagnostics attached to every outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeMeta {
	/// States entered, in order.
	#[serde(default)]
	pub steps: Vec<RelayStep>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub failed_step: Option<RelayStep>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tab_id: Option<TabId>,
	#[serde(default)]
	pub isolation: IsolationMode,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub challenge: Option<ChallengeWaitResult>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub degradations: Vec<Degradation>,
}

/// Final result of a fallback request. Exactly one is produced per request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
	pub request_id: RequestId,
	pub success: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	#[serde(default)]
	pub headers: BTreeMap<String, String>,
	#[serde(default)]
	pub data: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default)]
	pub meta: OutcomeMeta,
}

impl FetchOutcome {
	pub fn failure(request_id: RequestId, error: impl Into<String>) -> Self {
		Self {
			request_id,
			success: false,
			status: None,
			headers: BTreeMap::new(),
			data: Value::Null,
			error: Some(error.into()),
			meta: OutcomeMeta::default(),
		}
	}

	/// Decodes a binary body (`arrayBuffer` / `blob`) carried as base64.
	pub fn body_bytes(&self) -> Option<Vec<u8>> {
		match &self.data {
			Value::String(encoded) => STANDARD.decode(encoded).ok(),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn fetch_spec_accepts_minimal_camel_case_payload() {
		let spec: FetchSpec = serde_json::from_value(json!({
			"originUrl": "https://api.example.com",
			"fetchUrl": "https://api.example.com/api/user/self",
			"requestId": "req-1",
			"accountId": "acct-1"
		}))
		.unwrap();

		assert_eq!(spec.fetch_options.method, "GET");
		assert_eq!(spec.response_type, ResponseType::Json);
		assert_eq!(spec.auth_type, AuthType::AccessToken);
		assert_eq!(spec.challenge_page_url(), "https://api.example.com");
	}

	#[test]
	fn with_session_cookie_switches_to_cookie_auth() {
		let spec = FetchSpec::new("https://a.example", "https://a.example/x", "acct").with_session_cookie("session=abc");
		assert_eq!(spec.auth_type, AuthType::Cookie);
		assert_eq!(spec.session_cookie.as_deref(), Some("session=abc"));
	}

	#[test]
	fn binary_body_decodes_from_base64() {
		let mut outcome = FetchOutcome::failure(RequestId::from("r"), "x");
		outcome.data = json!("aGVsbG8=");
		assert_eq!(outcome.body_bytes().unwrap(), b"hello");
	}

	#[test]
	fn degradations_serialize_with_kind_tag() {
		let value = serde_json::to_value(Degradation::RuleInstallUnsupported { reason: "no api".into() }).unwrap();
		assert_eq!(value, json!({"kind": "ruleInstallUnsupported", "reason": "no api"}));
	}
}
