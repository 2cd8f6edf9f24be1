//! Scripted relay runs.
//!
//! A scenario file describes one request, how the sandbox page answers and
//! which host calls misbehave. Running it drives a real [`FetchRelay`]
//! against a [`FakeBrowser`] and reports the outcome with the host event log.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shield::fake::{FakeBrowser, HostEvent, PageScript};
use shield::{FetchRelay, ShieldConfig, SiteCookie};
use shield_protocol::{FetchOutcome, FetchSpec, HeaderRule, TabId};
use tracing::info;

use crate::error::{CliError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScenarioFaults {
	pub create_error: Option<String>,
	pub missing_tab_ids: bool,
	pub never_loads: bool,
	pub create_delay_ms: Option<u64>,
	pub remove_error: Option<String>,
	pub rules_unsupported: bool,
	pub rule_install_error: Option<String>,
	pub rule_removal_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
	pub request: FetchSpec,
	#[serde(default)]
	pub script: PageScript,
	#[serde(default)]
	pub faults: ScenarioFaults,
	#[serde(default)]
	pub site_cookies: Vec<SiteCookie>,
	/// Cancels the run this long after it started.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cancel_after_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
	pub outcome: FetchOutcome,
	pub events: Vec<HostEvent>,
	pub rules_installed: Vec<HeaderRule>,
	/// Sandboxes still open after the run (released ones stay pooled).
	pub open_tabs: Vec<TabId>,
}

impl Scenario {
	pub fn from_file(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path).map_err(|source| CliError::ScenarioIo {
			path: path.to_path_buf(),
			source,
		})?;
		serde_json::from_str(&raw).map_err(|e| CliError::Scenario {
			path: path.to_path_buf(),
			reason: e.to_string(),
		})
	}

	pub fn browser(&self) -> FakeBrowser {
		let faults = &self.faults;
		let mut browser = FakeBrowser::new().with_script(self.script.clone()).with_site_cookies(self.site_cookies.clone());
		if let Some(reason) = &faults.create_error {
			browser = browser.failing_create(reason);
		}
		if faults.missing_tab_ids {
			browser = browser.without_tab_ids();
		}
		if faults.never_loads {
			browser = browser.never_loading();
		}
		if let Some(ms) = faults.create_delay_ms {
			browser = browser.slow_create(Duration::from_millis(ms));
		}
		if let Some(reason) = &faults.remove_error {
			browser = browser.failing_remove(reason);
		}
		if faults.rules_unsupported {
			browser = browser.without_header_rules();
		}
		if let Some(reason) = &faults.rule_install_error {
			browser = browser.failing_rule_install(reason);
		}
		if let Some(reason) = &faults.rule_removal_error {
			browser = browser.failing_rule_removal(reason);
		}
		browser
	}

	pub async fn run(self, config: &ShieldConfig) -> SimulationReport {
		let browser = Arc::new(self.browser());
		let relay = FetchRelay::with_browser(browser.clone(), config);
		let request_id = self.request.request_id.clone();

		let canceller = async {
			let Some(ms) = self.cancel_after_ms else {
				return;
			};
			tokio::time::sleep(Duration::from_millis(ms)).await;
			if let Some(ack) = relay.cancel(&request_id) {
				ack.settled().await;
			}
		};
		let (outcome, ()) = tokio::join!(relay.execute(self.request.clone()), canceller);
		info!(target = "shield.cli", %request_id, success = outcome.success, "simulation finished");

		SimulationReport {
			outcome,
			events: browser.events(),
			rules_installed: browser.rule_history(),
			open_tabs: browser.open_tabs(),
		}
	}
}
