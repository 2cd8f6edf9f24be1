//! Seams between the orchestrator and the browser.
//!
//! The orchestrator never touches a browser API directly. Sandbox lifecycle,
//! the per-tab header-override capability and page messaging each sit behind
//! a trait so the relay state machine can run against a real extension host
//! or the scripted [`FakeBrowser`](crate::fake::FakeBrowser).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shield_protocol::{HeaderRule, SandboxRequest, TabId, WindowId};
use shield_runtime::Connection;

use crate::error::{HostError, Result};

/// Load progress of a sandbox tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadState {
	Loading,
	Complete,
}

/// Ids returned by the host for a freshly created sandbox. Either may be
/// missing when the host misbehaves; the pool treats that as a failed creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
	pub tab_id: Option<TabId>,
	pub window_id: Option<WindowId>,
}

/// Properties changed by [`SandboxHost::update`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabUpdate {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub active: Option<bool>,
}

impl TabUpdate {
	pub fn navigate(url: impl Into<String>) -> Self {
		Self {
			url: Some(url.into()),
			active: Some(false),
		}
	}
}

/// A cookie the host's cookie jar holds for a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteCookie {
	pub name: String,
	pub value: String,
}

impl SiteCookie {
	pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			value: value.into(),
		}
	}
}

/// Sandbox lifecycle. Every call is fallible.
#[async_trait]
pub trait SandboxHost: Send + Sync {
	/// Opens `url` in a new sandbox; `active = false` keeps it out of the foreground.
	async fn create(&self, url: &str, active: bool) -> Result<SandboxHandle>;

	async fn update(&self, tab_id: TabId, update: TabUpdate) -> Result<()>;

	async fn remove(&self, tab_id: TabId) -> Result<()>;

	/// Fails with [`HostError::TabNotFound`] once the tab is gone.
	async fn load_state(&self, tab_id: TabId) -> Result<LoadState>;

	/// Cookies the host holds for `url`, used to pick up WAF clearance cookies.
	async fn site_cookies(&self, url: &str) -> Result<Vec<SiteCookie>>;
}

/// Session-scoped header-override rules.
#[async_trait]
pub trait HeaderRuleSurface: Send + Sync {
	/// Whether the host offers the capability at all.
	fn is_supported(&self) -> bool;

	/// Installs `rule`, atomically replacing any rule with the same id.
	async fn install(&self, rule: HeaderRule) -> Result<()>;

	/// Removing an unknown id is not an error.
	async fn remove_by_id(&self, rule_id: u32) -> Result<()>;
}

/// Request/response exchange with the script inside a sandbox tab.
#[async_trait]
pub trait PageMessenger: Send + Sync {
	async fn send(&self, tab_id: TabId, request: SandboxRequest, timeout: Duration) -> Result<Value>;
}

#[async_trait]
impl PageMessenger for Connection {
	async fn send(&self, tab_id: TabId, request: SandboxRequest, timeout: Duration) -> Result<Value> {
		let payload = serde_json::to_value(&request).map_err(|e| HostError::Failed(e.to_string()))?;
		Ok(self.send_message(tab_id, payload, timeout).await?)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use serde_json::json;
	use shield_runtime::fake_transport::FakeTransportBuilder;

	use super::*;

	#[tokio::test]
	async fn connection_sends_tagged_requests_to_the_tab() {
		let (parts, controller) = FakeTransportBuilder::new()
			.respond_with(|envelope| match envelope.payload["action"].as_str() {
				Some("checkCapGuard") => Some(json!({"success": true, "passed": true})),
				_ => None,
			})
			.build();
		let connection = Arc::new(Connection::new(parts));
		tokio::spawn({
			let conn = Arc::clone(&connection);
			async move { conn.run().await }
		});

		let reply = PageMessenger::send(&*connection, TabId(12), SandboxRequest::CheckCapGuard, Duration::from_secs(1))
			.await
			.unwrap();
		assert_eq!(reply["passed"], true);

		let sent = controller.take_sent();
		assert_eq!(sent[0]["tabId"], 12);
		assert_eq!(sent[0]["payload"], json!({"action": "checkCapGuard"}));
	}

	#[tokio::test]
	async fn silent_tab_surfaces_as_timeout() {
		let (parts, _controller) = FakeTransportBuilder::new().build();
		let connection = Arc::new(Connection::new(parts));
		tokio::spawn({
			let conn = Arc::clone(&connection);
			async move { conn.run().await }
		});

		let err = PageMessenger::send(&*connection, TabId(1), SandboxRequest::CheckCloudflareGuard, Duration::from_millis(20))
			.await
			.unwrap_err();
		assert!(err.is_timeout());
	}
}
