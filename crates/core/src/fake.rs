//! Scripted in-memory browser for tests and the `simulate` command.
//!
//! [`FakeBrowser`] implements every host trait. Tabs load instantly (or
//! never), header rules are kept in a map keyed by id, and the page script
//! answers from a [`PageScript`]. Everything observable is appended to an
//! event log so tests can assert on ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use shield_protocol::{HeaderRule, SandboxRequest, TabId, WindowId};

use crate::error::{HostError, Result};
use crate::host::{HeaderRuleSurface, LoadState, PageMessenger, SandboxHandle, SandboxHost, SiteCookie, TabUpdate};

/// One observable host call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostEvent {
	Created { tab_id: TabId, url: String, active: bool },
	CreateFailed { reason: String },
	Updated { tab_id: TabId, url: Option<String> },
	Removed { tab_id: TabId },
	RuleInstalled { rule_id: u32, tab_ids: Vec<TabId> },
	RuleRemoved { rule_id: u32 },
	Message { tab_id: TabId, action: String },
}

/// Canned replies of the in-page script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageScript {
	pub cap_guard: Value,
	pub cloudflare_guard: Value,
	/// Number of initial Cloudflare checks answered with `passed: false`.
	pub cloudflare_blocked_polls: u32,
	pub challenge: Value,
	pub fetch: Value,
	#[serde(with = "opt_millis")]
	pub cap_guard_delay: Option<Duration>,
	#[serde(with = "opt_millis")]
	pub challenge_delay: Option<Duration>,
	#[serde(with = "opt_millis")]
	pub fetch_delay: Option<Duration>,
}

impl Default for PageScript {
	fn default() -> Self {
		Self {
			cap_guard: json!({"success": true, "passed": true}),
			cloudflare_guard: json!({"success": true, "passed": true}),
			cloudflare_blocked_polls: 0,
			challenge: json!({"status": "not_present"}),
			fetch: json!({"success": true, "status": 200, "headers": {"content-type": "application/json"}, "data": {"success": true}}),
			cap_guard_delay: None,
			challenge_delay: None,
			fetch_delay: None,
		}
	}
}

mod opt_millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
		match value {
			Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
		Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
	}
}

#[derive(Default)]
struct Faults {
	create: Option<String>,
	no_tab_ids: bool,
	never_loads: bool,
	create_delay: Option<Duration>,
	remove: Option<String>,
	rules_unsupported: bool,
	rule_install: Option<String>,
	rule_removal: Option<String>,
}

#[derive(Default)]
struct BrowserState {
	open_tabs: BTreeMap<TabId, String>,
	closed_tabs: BTreeSet<TabId>,
	unprobeable_tabs: BTreeMap<TabId, String>,
	rules: BTreeMap<u32, HeaderRule>,
	rule_history: Vec<HeaderRule>,
	cookies: Vec<SiteCookie>,
	events: Vec<HostEvent>,
	sent: Vec<(TabId, SandboxRequest)>,
	create_attempts: usize,
	cloudflare_checks: u32,
}

pub struct FakeBrowser {
	next_tab: AtomicU32,
	script: PageScript,
	faults: Faults,
	state: Mutex<BrowserState>,
}

impl Default for FakeBrowser {
	fn default() -> Self {
		Self::new()
	}
}

impl FakeBrowser {
	pub fn new() -> Self {
		Self {
			next_tab: AtomicU32::new(1),
			script: PageScript::default(),
			faults: Faults::default(),
			state: Mutex::new(BrowserState::default()),
		}
	}

	pub fn with_script(mut self, script: PageScript) -> Self {
		self.script = script;
		self
	}

	pub fn with_site_cookies(self, cookies: Vec<SiteCookie>) -> Self {
		self.state.lock().cookies = cookies;
		self
	}

	pub fn failing_create(mut self, reason: &str) -> Self {
		self.faults.create = Some(reason.to_string());
		self
	}

	pub fn without_tab_ids(mut self) -> Self {
		self.faults.no_tab_ids = true;
		self
	}

	pub fn never_loading(mut self) -> Self {
		self.faults.never_loads = true;
		self
	}

	/// Every `create` takes `delay` before the tab exists.
	pub fn slow_create(mut self, delay: Duration) -> Self {
		self.faults.create_delay = Some(delay);
		self
	}

	pub fn failing_remove(mut self, reason: &str) -> Self {
		self.faults.remove = Some(reason.to_string());
		self
	}

	pub fn without_header_rules(mut self) -> Self {
		self.faults.rules_unsupported = true;
		self
	}

	pub fn failing_rule_install(mut self, reason: &str) -> Self {
		self.faults.rule_install = Some(reason.to_string());
		self
	}

	pub fn failing_rule_removal(mut self, reason: &str) -> Self {
		self.faults.rule_removal = Some(reason.to_string());
		self
	}

	/// Simulates the user closing a sandbox; no event is logged.
	pub fn close_tab_externally(&self, tab_id: TabId) {
		let mut state = self.state.lock();
		state.open_tabs.remove(&tab_id);
		state.closed_tabs.insert(tab_id);
	}

	/// Makes `load_state` fail for an open tab without closing it.
	pub fn fail_load_state(&self, tab_id: TabId, reason: &str) {
		self.state.lock().unprobeable_tabs.insert(tab_id, reason.to_string());
	}

	pub fn events(&self) -> Vec<HostEvent> {
		self.state.lock().events.clone()
	}

	pub fn installed_rules(&self) -> Vec<HeaderRule> {
		self.state.lock().rules.values().cloned().collect()
	}

	/// Every rule ever installed, in order.
	pub fn rule_history(&self) -> Vec<HeaderRule> {
		self.state.lock().rule_history.clone()
	}

	pub fn open_tabs(&self) -> Vec<TabId> {
		self.state.lock().open_tabs.keys().copied().collect()
	}

	pub fn sent_requests(&self) -> Vec<(TabId, SandboxRequest)> {
		self.state.lock().sent.clone()
	}

	pub fn messages_for(&self, action: &str) -> usize {
		self.state.lock().sent.iter().filter(|(_, r)| r.action() == action).count()
	}

	pub fn create_attempts(&self) -> usize {
		self.state.lock().create_attempts
	}

	pub fn created_count(&self) -> usize {
		self.count(|e| matches!(e, HostEvent::Created { .. }))
	}

	pub fn removed_count(&self) -> usize {
		self.count(|e| matches!(e, HostEvent::Removed { .. }))
	}

	fn count(&self, predicate: impl Fn(&HostEvent) -> bool) -> usize {
		self.state.lock().events.iter().filter(|e| predicate(e)).count()
	}

	fn record(&self, event: HostEvent) {
		self.state.lock().events.push(event);
	}

	fn reply_for(&self, request: &SandboxRequest) -> (Value, Option<Duration>) {
		match request {
			SandboxRequest::CheckCapGuard => (self.script.cap_guard.clone(), self.script.cap_guard_delay),
			SandboxRequest::CheckCloudflareGuard => {
				let mut state = self.state.lock();
				state.cloudflare_checks += 1;
				if state.cloudflare_checks <= self.script.cloudflare_blocked_polls {
					(json!({"success": true, "passed": false}), None)
				} else {
					(self.script.cloudflare_guard.clone(), None)
				}
			}
			SandboxRequest::WaitForChallengeToken { .. } => (self.script.challenge.clone(), self.script.challenge_delay),
			SandboxRequest::PerformRelayedFetch { .. } => (self.script.fetch.clone(), self.script.fetch_delay),
		}
	}
}

#[async_trait]
impl SandboxHost for FakeBrowser {
	async fn create(&self, url: &str, active: bool) -> Result<SandboxHandle> {
		self.state.lock().create_attempts += 1;
		if let Some(reason) = &self.faults.create {
			self.record(HostEvent::CreateFailed { reason: reason.clone() });
			return Err(HostError::CreateFailed(reason.clone()));
		}
		if let Some(delay) = self.faults.create_delay {
			tokio::time::sleep(delay).await;
		}
		if self.faults.no_tab_ids {
			return Ok(SandboxHandle::default());
		}

		let tab_id = TabId(self.next_tab.fetch_add(1, Ordering::SeqCst));
		{
			let mut state = self.state.lock();
			state.open_tabs.insert(tab_id, url.to_string());
			state.events.push(HostEvent::Created {
				tab_id,
				url: url.to_string(),
				active,
			});
		}
		Ok(SandboxHandle {
			tab_id: Some(tab_id),
			window_id: Some(WindowId(tab_id.0)),
		})
	}

	async fn update(&self, tab_id: TabId, update: TabUpdate) -> Result<()> {
		let mut state = self.state.lock();
		let Some(current) = state.open_tabs.get_mut(&tab_id) else {
			return Err(HostError::TabNotFound(tab_id));
		};
		if let Some(url) = &update.url {
			*current = url.clone();
		}
		state.events.push(HostEvent::Updated { tab_id, url: update.url });
		Ok(())
	}

	async fn remove(&self, tab_id: TabId) -> Result<()> {
		if let Some(reason) = &self.faults.remove {
			return Err(HostError::Failed(reason.clone()));
		}
		let mut state = self.state.lock();
		if state.open_tabs.remove(&tab_id).is_none() {
			return Err(HostError::TabNotFound(tab_id));
		}
		state.closed_tabs.insert(tab_id);
		state.events.push(HostEvent::Removed { tab_id });
		Ok(())
	}

	async fn load_state(&self, tab_id: TabId) -> Result<LoadState> {
		{
			let state = self.state.lock();
			if !state.open_tabs.contains_key(&tab_id) {
				return Err(HostError::TabNotFound(tab_id));
			}
			if let Some(reason) = state.unprobeable_tabs.get(&tab_id) {
				return Err(HostError::Failed(reason.clone()));
			}
		}
		Ok(if self.faults.never_loads { LoadState::Loading } else { LoadState::Complete })
	}

	async fn site_cookies(&self, _url: &str) -> Result<Vec<SiteCookie>> {
		Ok(self.state.lock().cookies.clone())
	}
}

#[async_trait]
impl HeaderRuleSurface for FakeBrowser {
	fn is_supported(&self) -> bool {
		!self.faults.rules_unsupported
	}

	async fn install(&self, rule: HeaderRule) -> Result<()> {
		if self.faults.rules_unsupported {
			return Err(HostError::Unsupported("declarative rules unavailable".into()));
		}
		if let Some(reason) = &self.faults.rule_install {
			return Err(HostError::Failed(reason.clone()));
		}
		let mut state = self.state.lock();
		state.events.push(HostEvent::RuleInstalled {
			rule_id: rule.id,
			tab_ids: rule.condition.tab_ids.clone(),
		});
		state.rule_history.push(rule.clone());
		state.rules.insert(rule.id, rule);
		Ok(())
	}

	async fn remove_by_id(&self, rule_id: u32) -> Result<()> {
		if let Some(reason) = &self.faults.rule_removal {
			return Err(HostError::Failed(reason.clone()));
		}
		let mut state = self.state.lock();
		if state.rules.remove(&rule_id).is_some() {
			state.events.push(HostEvent::RuleRemoved { rule_id });
		}
		Ok(())
	}
}

#[async_trait]
impl PageMessenger for FakeBrowser {
	async fn send(&self, tab_id: TabId, request: SandboxRequest, timeout: Duration) -> Result<Value> {
		{
			let mut state = self.state.lock();
			state.events.push(HostEvent::Message {
				tab_id,
				action: request.action().to_string(),
			});
			state.sent.push((tab_id, request.clone()));
		}
		let (reply, delay) = self.reply_for(&request);

		if let Some(delay) = delay {
			if delay >= timeout {
				tokio::time::sleep(timeout).await;
				return Err(shield_runtime::Error::Timeout(format!("no reply from tab {tab_id}")).into());
			}
			tokio::time::sleep(delay).await;
		}
		if self.state.lock().closed_tabs.contains(&tab_id) {
			return Err(shield_runtime::Error::TabClosed(format!("tab {tab_id} is gone")).into());
		}
		Ok(reply)
	}
}
