//! Protection guard checks.
//!
//! A sandbox that has finished loading may still be showing a challenge
//! screen. Before any request is relayed, the page script must report that
//! both the client-side puzzle gate and the edge challenge are cleared.
//! Anything ambiguous counts as not passed.

use std::sync::Arc;

use serde::Serialize;
use shield_protocol::{GuardReply, RequestId, SandboxRequest, TabId};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::GuardConfig;
use crate::error::GuardFailure;
use crate::host::PageMessenger;

/// Outcome of one guard attempt. `passed` is always `cap_passed && cloudflare_passed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardCheckResult {
	cap_passed: bool,
	cloudflare_passed: bool,
	passed: bool,
}

impl GuardCheckResult {
	pub fn new(cap_passed: bool, cloudflare_passed: bool) -> Self {
		Self {
			cap_passed,
			cloudflare_passed,
			passed: cap_passed && cloudflare_passed,
		}
	}

	pub fn cap_passed(&self) -> bool {
		self.cap_passed
	}

	pub fn cloudflare_passed(&self) -> bool {
		self.cloudflare_passed
	}

	pub fn passed(&self) -> bool {
		self.passed
	}

	pub fn failure(&self) -> Option<GuardFailure> {
		match (self.cap_passed, self.cloudflare_passed) {
			(true, true) => None,
			(false, true) => Some(GuardFailure::Cap),
			(true, false) => Some(GuardFailure::Cloudflare),
			(false, false) => Some(GuardFailure::Both),
		}
	}
}

pub struct GuardChecker {
	messenger: Arc<dyn PageMessenger>,
	config: GuardConfig,
}

impl GuardChecker {
	pub fn new(messenger: Arc<dyn PageMessenger>, config: GuardConfig) -> Self {
		Self { messenger, config }
	}

	/// Longest [`await_guards`](Self::await_guards) can take.
	pub fn budget(&self) -> std::time::Duration {
		self.config.guard_timeout() + self.config.probe_timeout()
	}

	/// Runs both guard exchanges concurrently, each under its own timer.
	pub async fn check_guards(&self, tab_id: TabId, request_id: &RequestId) -> GuardCheckResult {
		let (cap, cloudflare) = tokio::join!(
			self.probe(tab_id, request_id, SandboxRequest::CheckCapGuard),
			self.probe(tab_id, request_id, SandboxRequest::CheckCloudflareGuard),
		);
		GuardCheckResult::new(cap, cloudflare)
	}

	/// Repeats [`check_guards`](Self::check_guards) until it passes or the
	/// guard budget runs out, returning the last attempt.
	pub async fn await_guards(&self, tab_id: TabId, request_id: &RequestId) -> GuardCheckResult {
		let deadline = Instant::now() + self.config.guard_timeout();
		let mut attempts = 0u32;
		loop {
			attempts += 1;
			let result = self.check_guards(tab_id, request_id).await;
			if result.passed() {
				info!(target = "shield.guard", %request_id, %tab_id, attempts, "guards passed");
				return result;
			}
			if Instant::now() + self.config.poll_interval() >= deadline {
				info!(
					target = "shield.guard",
					%request_id,
					%tab_id,
					attempts,
					cap_passed = result.cap_passed(),
					cloudflare_passed = result.cloudflare_passed(),
					"guards not passed"
				);
				return result;
			}
			tokio::time::sleep(self.config.poll_interval()).await;
		}
	}

	async fn probe(&self, tab_id: TabId, request_id: &RequestId, request: SandboxRequest) -> bool {
		let action = request.action();
		match self.messenger.send(tab_id, request, self.config.probe_timeout()).await {
			Ok(value) => match serde_json::from_value::<GuardReply>(value) {
				Ok(reply) => {
					if let Some(error) = &reply.error {
						debug!(target = "shield.guard", %request_id, %tab_id, action, error = %error, "guard reported error");
					}
					reply.is_pass()
				}
				Err(e) => {
					debug!(target = "shield.guard", %request_id, %tab_id, action, error = %e, "malformed guard reply");
					false
				}
			},
			Err(e) => {
				debug!(target = "shield.guard", %request_id, %tab_id, action, error = %e, "guard exchange failed");
				false
			}
		}
	}
}
