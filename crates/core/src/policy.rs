//! Decides whether a failed direct fetch may be retried through a sandbox.
//!
//! [`is_eligible`] is the pure allowlist check. [`FallbackGate`] layers the
//! environmental checks on top (http(s) base URL, user preferences, calling
//! context) and reports why a fallback was skipped.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error code attached when a fallback would apply but user preferences block it.
pub const TEMP_WINDOW_DISABLED: &str = "TEMP_WINDOW_DISABLED";
/// Error code attached when the host lacks the permission the fallback needs.
pub const TEMP_WINDOW_PERMISSION_REQUIRED: &str = "TEMP_WINDOW_PERMISSION_REQUIRED";

/// What the direct-fetch layer observed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectFetchError {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
	#[serde(default)]
	pub message: String,
}

impl DirectFetchError {
	pub fn status(status: u16) -> Self {
		Self {
			status: Some(status),
			..Self::default()
		}
	}

	pub fn code(code: impl Into<String>) -> Self {
		Self {
			code: Some(code.into()),
			..Self::default()
		}
	}
}

/// Status codes and symbolic codes that qualify for a sandboxed retry.
///
/// An omitted dimension deserializes as empty, which never matches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackAllowlist {
	#[serde(default)]
	pub status_codes: BTreeSet<u16>,
	#[serde(default)]
	pub codes: BTreeSet<String>,
}

impl FallbackAllowlist {
	pub fn new<S, C>(status_codes: S, codes: C) -> Self
	where
		S: IntoIterator<Item = u16>,
		C: IntoIterator,
		C::Item: Into<String>,
	{
		Self {
			status_codes: status_codes.into_iter().collect(),
			codes: codes.into_iter().map(Into::into).collect(),
		}
	}

	/// Used when the caller supplies no allowlist: auth failures, rate limits
	/// and an HTML challenge page served where JSON was expected.
	pub fn conservative_default() -> Self {
		Self::new([401, 403, 429], ["HTTP_401", "HTTP_403", "HTTP_429", "CONTENT_TYPE_MISMATCH"])
	}
}

/// True iff the error's status or symbolic code is allowlisted.
pub fn is_eligible(error: &DirectFetchError, allowlist: Option<&FallbackAllowlist>) -> bool {
	let default;
	let allowlist = match allowlist {
		Some(allowlist) => allowlist,
		None => {
			default = FallbackAllowlist::conservative_default();
			&default
		}
	};

	let status_match = error.status.is_some_and(|s| allowlist.status_codes.contains(&s));
	let code_match = error.code.as_deref().is_some_and(|c| allowlist.codes.contains(c));
	status_match || code_match
}

/// User-facing switches for the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackPreferences {
	pub enabled: bool,
	pub use_in_popup: bool,
	pub use_in_side_panel: bool,
	pub use_in_options: bool,
	pub use_for_auto_refresh: bool,
	pub use_for_manual_refresh: bool,
}

impl Default for FallbackPreferences {
	fn default() -> Self {
		Self {
			enabled: true,
			use_in_popup: true,
			use_in_side_panel: true,
			use_in_options: true,
			use_for_auto_refresh: true,
			use_for_manual_refresh: true,
		}
	}
}

/// Where the failing request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallingContext {
	/// Background worker; counts as an auto refresh.
	#[default]
	Background,
	Popup,
	SidePanel,
	Options,
	/// Any other foreground page; counts as a manual refresh.
	Page,
}

impl CallingContext {
	fn is_auto_refresh(self) -> bool {
		matches!(self, CallingContext::Background)
	}
}

/// Request-side facts the gate needs beyond the error itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackRequest {
	pub base_url: String,
	#[serde(default)]
	pub context: CallingContext,
	/// Whether the host granted the permission the cookie rule needs.
	#[serde(default = "granted")]
	pub permission_granted: bool,
}

fn granted() -> bool {
	true
}

impl FallbackRequest {
	pub fn new(base_url: impl Into<String>) -> Self {
		Self {
			base_url: base_url.into(),
			context: CallingContext::Background,
			permission_granted: true,
		}
	}

	pub fn with_context(mut self, context: CallingContext) -> Self {
		self.context = context;
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum FallbackDecision {
	Proceed,
	Skip {
		reason: String,
		/// Code the caller should tag its error with, when preferences or
		/// permissions blocked an otherwise eligible fallback.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		blocked_code: Option<String>,
	},
}

impl FallbackDecision {
	pub fn proceeds(&self) -> bool {
		matches!(self, FallbackDecision::Proceed)
	}

	fn skip(reason: &str) -> Self {
		FallbackDecision::Skip {
			reason: reason.to_string(),
			blocked_code: None,
		}
	}

	fn blocked(reason: &str, code: &str) -> Self {
		FallbackDecision::Skip {
			reason: reason.to_string(),
			blocked_code: Some(code.to_string()),
		}
	}
}

/// Eligibility plus environment checks, evaluated in order.
#[derive(Debug, Clone, Default)]
pub struct FallbackGate {
	preferences: FallbackPreferences,
}

impl FallbackGate {
	pub fn new(preferences: FallbackPreferences) -> Self {
		Self { preferences }
	}

	pub fn evaluate(&self, error: &DirectFetchError, allowlist: Option<&FallbackAllowlist>, request: &FallbackRequest) -> FallbackDecision {
		let decision = self.decide(error, allowlist, request);
		if let FallbackDecision::Skip { reason, blocked_code } = &decision {
			debug!(
				target = "shield.policy",
				base_url = %request.base_url,
				status = ?error.status,
				code = ?error.code,
				blocked_code = ?blocked_code,
				"fallback skipped: {reason}"
			);
		}
		decision
	}

	fn decide(&self, error: &DirectFetchError, allowlist: Option<&FallbackAllowlist>, request: &FallbackRequest) -> FallbackDecision {
		if !is_eligible(error, allowlist) {
			return FallbackDecision::skip("error does not match any fallback status or code");
		}
		if !is_http_url(&request.base_url) {
			return FallbackDecision::skip("base URL is not http(s)");
		}

		let prefs = &self.preferences;
		if !prefs.enabled {
			return FallbackDecision::blocked("fallback disabled by preferences", TEMP_WINDOW_DISABLED);
		}
		if !request.permission_granted {
			return FallbackDecision::blocked("cookie rule permission not granted", TEMP_WINDOW_PERMISSION_REQUIRED);
		}

		let surface_allowed = match request.context {
			CallingContext::Popup => prefs.use_in_popup,
			CallingContext::SidePanel => prefs.use_in_side_panel,
			CallingContext::Options => prefs.use_in_options,
			CallingContext::Background | CallingContext::Page => true,
		};
		if !surface_allowed {
			return FallbackDecision::blocked("calling surface disabled by preferences", TEMP_WINDOW_DISABLED);
		}

		if request.context.is_auto_refresh() && !prefs.use_for_auto_refresh {
			return FallbackDecision::blocked("auto refresh disabled by preferences", TEMP_WINDOW_DISABLED);
		}
		if !request.context.is_auto_refresh() && !prefs.use_for_manual_refresh {
			return FallbackDecision::blocked("manual refresh disabled by preferences", TEMP_WINDOW_DISABLED);
		}

		FallbackDecision::Proceed
	}
}

pub(crate) fn is_http_url(raw: &str) -> bool {
	url::Url::parse(raw).is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
}
