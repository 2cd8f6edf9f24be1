//! Per-tab cookie isolation.
//!
//! A rule force-sets the account's `Cookie` header on requests that leave one
//! sandbox tab for one host, and strips the extension's marker headers. Rule
//! ids are derived from the tab id, so re-applying for a tab replaces the old
//! rule and no allocation table is needed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use shield_protocol::{HeaderOverride, HeaderRule, IsolationMode, ResourceType, RuleAction, RuleActionType, RuleCondition, TabId};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RuleConfig;
use crate::error::{HostError, Result};
use crate::host::HeaderRuleSurface;

/// Result of [`CookieRuleManager::apply`]. Never an error: the caller
/// proceeds without isolation when the rule could not be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleInstall {
	Installed(u32),
	Unsupported(String),
	Failed(String),
}

impl RuleInstall {
	pub fn isolation(&self) -> IsolationMode {
		match self {
			RuleInstall::Installed(_) => IsolationMode::Installed,
			RuleInstall::Unsupported(_) => IsolationMode::Unsupported,
			RuleInstall::Failed(_) => IsolationMode::Failed,
		}
	}
}

/// `|scheme://host[:port]/`, anchored at the start of the request URL.
///
/// Returns `None` for anything but an absolute http(s) URL with a host.
pub fn url_filter(raw: &str) -> Option<String> {
	let url = Url::parse(raw).ok()?;
	if !matches!(url.scheme(), "http" | "https") {
		return None;
	}
	let host = url.host_str()?;
	let filter = match url.port() {
		Some(port) => format!("|{}://{}:{}/", url.scheme(), host, port),
		None => format!("|{}://{}/", url.scheme(), host),
	};
	Some(filter)
}

/// Rule pinning `cookie` to requests from `tab_id` to the host of `url`.
pub fn build_rule(config: &RuleConfig, tab_id: TabId, url: &str, cookie: &str) -> std::result::Result<HeaderRule, String> {
	let url_filter = url_filter(url).ok_or_else(|| format!("cannot derive a URL filter from {url:?}"))?;

	let mut request_headers: Vec<HeaderOverride> = config.marker_headers.iter().map(HeaderOverride::remove).collect();
	request_headers.push(HeaderOverride::set("Cookie", cookie));

	Ok(HeaderRule {
		id: config.base_rule_id.saturating_add(tab_id.0),
		priority: config.priority,
		action: RuleAction {
			kind: RuleActionType::ModifyHeaders,
			request_headers,
		},
		condition: RuleCondition {
			tab_ids: vec![tab_id],
			url_filter,
			resource_types: vec![ResourceType::XmlHttpRequest],
		},
	})
}

pub struct CookieRuleManager {
	surface: Arc<dyn HeaderRuleSurface>,
	config: RuleConfig,
	/// Rules this manager believes are installed, by tab.
	active: Mutex<HashMap<TabId, u32>>,
}

impl CookieRuleManager {
	pub fn new(surface: Arc<dyn HeaderRuleSurface>, config: RuleConfig) -> Self {
		Self {
			surface,
			config,
			active: Mutex::new(HashMap::new()),
		}
	}

	pub fn rule_id(&self, tab_id: TabId) -> u32 {
		self.config.base_rule_id.saturating_add(tab_id.0)
	}

	pub fn build_rule(&self, tab_id: TabId, url: &str, cookie: &str) -> std::result::Result<HeaderRule, String> {
		build_rule(&self.config, tab_id, url, cookie)
	}

	/// Installs (or replaces) the cookie rule for `tab_id`.
	pub async fn apply(&self, tab_id: TabId, url: &str, cookie: &str) -> RuleInstall {
		if !self.surface.is_supported() {
			warn!(target = "shield.cookie_rule", %tab_id, "header rules unsupported; cookie not isolated");
			return RuleInstall::Unsupported("header-override rules unavailable on this host".into());
		}

		let rule = match self.build_rule(tab_id, url, cookie) {
			Ok(rule) => rule,
			Err(reason) => {
				warn!(target = "shield.cookie_rule", %tab_id, reason = %reason, "cookie rule not built");
				return RuleInstall::Failed(reason);
			}
		};
		let rule_id = rule.id;

		match self.surface.install(rule).await {
			Ok(()) => {
				self.active.lock().insert(tab_id, rule_id);
				info!(target = "shield.cookie_rule", %tab_id, rule_id, "cookie rule installed");
				RuleInstall::Installed(rule_id)
			}
			Err(HostError::Unsupported(reason)) => {
				warn!(target = "shield.cookie_rule", %tab_id, reason = %reason, "header rules unsupported; cookie not isolated");
				RuleInstall::Unsupported(reason)
			}
			Err(e) => {
				warn!(target = "shield.cookie_rule", %tab_id, rule_id, error = %e, "cookie rule install failed");
				RuleInstall::Failed(e.to_string())
			}
		}
	}

	/// Removes a rule by id. Safe to call for ids that were never installed
	/// or are already gone.
	pub async fn remove(&self, rule_id: u32) -> Result<()> {
		self.active.lock().retain(|_, id| *id != rule_id);
		if !self.surface.is_supported() {
			return Ok(());
		}
		self.surface.remove_by_id(rule_id).await?;
		debug!(target = "shield.cookie_rule", rule_id, "cookie rule removed");
		Ok(())
	}

	pub async fn remove_for_tab(&self, tab_id: TabId) -> Result<()> {
		self.remove(self.rule_id(tab_id)).await
	}

	/// Rule id currently recorded for `tab_id`.
	pub fn active_rule(&self, tab_id: TabId) -> Option<u32> {
		self.active.lock().get(&tab_id).copied()
	}
}
