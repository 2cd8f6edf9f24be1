//! Relay state machine.
//!
//! One [`FetchRelay::execute`] call walks a request through
//! `Init → AcquireContext → InstallCookieRule → AwaitGuards →
//! AwaitChallengeIfPresent → PerformRelayedFetch → Teardown → Done`.
//! Every step runs under its own timer and can be interrupted by
//! [`FetchRelay::cancel`]. Whatever happens, a leased sandbox goes through
//! teardown exactly once and the caller receives exactly one
//! [`FetchOutcome`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde_json::Value;
use shield_protocol::{
	ChallengeStatus, ChallengeWaitResult, Degradation, FetchOutcome, FetchSpec, IsolationMode, OutcomeMeta, RelayReply, RelayStep, RequestId, ResponseType, SandboxRequest,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::challenge::ChallengeWaiter;
use crate::config::{RelayConfig, ShieldConfig};
use crate::cookie_rule::{CookieRuleManager, RuleInstall};
use crate::cookies::merge_cookie_header;
use crate::error::{HostError, RelayError};
use crate::guard::GuardChecker;
use crate::host::{HeaderRuleSurface, PageMessenger, SandboxHost};
use crate::policy::is_http_url;
use crate::pool::{ContextLease, ContextPool, Disposition};

/// Extra time granted on top of an exchange's own timer before the step is
/// declared timed out. Only a host that ignores its timers ever hits it.
const EXCHANGE_SLACK: Duration = Duration::from_millis(250);

/// Resolves once a cancelled run has finished its teardown.
#[derive(Debug)]
pub struct CancelAck {
	done: watch::Receiver<bool>,
}

impl CancelAck {
	pub async fn settled(mut self) {
		// A dropped sender also means the run is over.
		let _ = self.done.wait_for(|done| *done).await;
	}
}

struct InFlight {
	cancel: watch::Sender<bool>,
	done: watch::Receiver<bool>,
}

/// Entry in the in-flight table, cleared when the run finishes or its
/// future is dropped.
struct Registration<'a> {
	table: &'a Mutex<HashMap<RequestId, InFlight>>,
	request_id: RequestId,
	done: watch::Sender<bool>,
}

impl Drop for Registration<'_> {
	fn drop(&mut self) {
		self.table.lock().remove(&self.request_id);
		self.done.send_replace(true);
	}
}

/// Why a run stopped before producing a relayed response.
#[derive(Debug)]
struct StepFailure {
	step: RelayStep,
	error: RelayError,
	/// Whether the sandbox can no longer be trusted.
	poisoned: bool,
}

impl StepFailure {
	fn new(step: RelayStep, error: RelayError) -> Self {
		let poisoned = error.poisons_context();
		Self { step, error, poisoned }
	}

	fn poisoned(mut self) -> Self {
		self.poisoned = true;
		self
	}
}

pub struct FetchRelay {
	pool: ContextPool,
	rules: Arc<CookieRuleManager>,
	guards: GuardChecker,
	challenge: ChallengeWaiter,
	host: Arc<dyn SandboxHost>,
	messenger: Arc<dyn PageMessenger>,
	config: RelayConfig,
	in_flight: Mutex<HashMap<RequestId, InFlight>>,
}

impl FetchRelay {
	pub fn new(host: Arc<dyn SandboxHost>, surface: Arc<dyn HeaderRuleSurface>, messenger: Arc<dyn PageMessenger>, config: &ShieldConfig) -> Self {
		let rules = Arc::new(CookieRuleManager::new(surface, config.rules.clone()));
		Self {
			pool: ContextPool::new(host.clone(), rules.clone(), config.pool.clone()),
			guards: GuardChecker::new(messenger.clone(), config.guards.clone()),
			challenge: ChallengeWaiter::new(messenger.clone(), config.challenge.clone()),
			rules,
			host,
			messenger,
			config: config.relay.clone(),
			in_flight: Mutex::new(HashMap::new()),
		}
	}

	/// Builds a relay whose three host surfaces are the same object.
	pub fn with_browser<B>(browser: Arc<B>, config: &ShieldConfig) -> Self
	where
		B: SandboxHost + HeaderRuleSurface + PageMessenger + 'static,
	{
		Self::new(browser.clone(), browser.clone(), browser, config)
	}

	pub fn pool(&self) -> &ContextPool {
		&self.pool
	}

	pub fn rules(&self) -> &CookieRuleManager {
		&self.rules
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight.lock().len()
	}

	/// Signals the run for `request_id` to stop. The returned ack resolves
	/// after that run has torn its sandbox down. `None` if nothing with that
	/// id is in flight.
	pub fn cancel(&self, request_id: &RequestId) -> Option<CancelAck> {
		let table = self.in_flight.lock();
		let entry = table.get(request_id)?;
		entry.cancel.send_replace(true);
		info!(target = "shield.relay", %request_id, "cancellation requested");
		Some(CancelAck { done: entry.done.clone() })
	}

	/// Closes idle sandboxes; see [`ContextPool::shutdown`].
	pub async fn shutdown(&self) -> usize {
		self.pool.shutdown().await
	}

	/// Runs one request through a sandbox. Never fails: every error path is
	/// folded into the returned outcome.
	pub async fn execute(&self, spec: FetchSpec) -> FetchOutcome {
		let request_id = spec.request_id.clone();
		let mut meta = OutcomeMeta {
			steps: vec![RelayStep::Init],
			..OutcomeMeta::default()
		};

		if let Err(error) = validate(&spec) {
			warn!(target = "shield.relay", %request_id, error = %error, "request rejected");
			return finish(request_id, meta, Err(StepFailure::new(RelayStep::Init, error)));
		}
		let Some((_registration, mut cancel)) = self.register(&request_id) else {
			let error = RelayError::InvalidRequest(format!("request {request_id} is already in flight"));
			warn!(target = "shield.relay", %request_id, "duplicate request id");
			return finish(request_id, meta, Err(StepFailure::new(RelayStep::Init, error)));
		};

		info!(target = "shield.relay", %request_id, account_id = %spec.account_id, origin = %spec.origin_url, "relay started");
		let result = self.drive(&spec, &mut meta, &mut cancel).await;
		let outcome = finish(request_id, meta, result);
		info!(
			target = "shield.relay",
			request_id = %outcome.request_id,
			success = outcome.success,
			status = ?outcome.status,
			error = ?outcome.error,
			"relay finished"
		);
		outcome
	}

	fn register(&self, request_id: &RequestId) -> Option<(Registration<'_>, watch::Receiver<bool>)> {
		let mut table = self.in_flight.lock();
		if table.contains_key(request_id) {
			return None;
		}
		let (cancel_tx, cancel_rx) = watch::channel(false);
		let (done_tx, done_rx) = watch::channel(false);
		table.insert(
			request_id.clone(),
			InFlight {
				cancel: cancel_tx,
				done: done_rx,
			},
		);
		Some((
			Registration {
				table: &self.in_flight,
				request_id: request_id.clone(),
				done: done_tx,
			},
			cancel_rx,
		))
	}

	async fn drive(&self, spec: &FetchSpec, meta: &mut OutcomeMeta, cancel: &mut watch::Receiver<bool>) -> Result<RelayReply, StepFailure> {
		meta.steps.push(RelayStep::AcquireContext);
		let lease = match self.acquire(spec, cancel).await {
			Ok(lease) => lease,
			Err(failure) => {
				// Nothing was leased, so teardown has nothing to do.
				meta.steps.push(RelayStep::Teardown);
				return Err(failure);
			}
		};
		meta.tab_id = Some(lease.tab_id());

		let result = self.run_leased(spec, &lease, meta, cancel).await;

		meta.steps.push(RelayStep::Teardown);
		let healthy = match &result {
			Ok(_) => true,
			Err(failure) => !failure.poisoned,
		};
		let tab_id = lease.tab_id();
		let report = if healthy { self.pool.release(lease).await } else { self.pool.destroy(lease).await };
		debug!(
			target = "shield.relay",
			request_id = %spec.request_id,
			%tab_id,
			rule_removed = report.rule_removed,
			disposition = ?report.disposition,
			"teardown complete"
		);
		if report.disposition == Disposition::AlreadyGone {
			warn!(target = "shield.relay", request_id = %spec.request_id, %tab_id, "sandbox closed externally during relay");
		}
		result
	}

	/// Acquisition runs in its own task so that a timeout or cancellation
	/// never strands a half-created sandbox: a lease that arrives late is
	/// destroyed.
	async fn acquire(&self, spec: &FetchSpec, cancel: &mut watch::Receiver<bool>) -> Result<ContextLease, StepFailure> {
		let step = RelayStep::AcquireContext;
		let pool = self.pool.clone();
		let account_id = spec.account_id.clone();
		let url = spec.origin_url.clone();
		let mut task = tokio::spawn(async move { pool.acquire(&account_id, &url).await });

		let abandoned = tokio::select! {
			biased;
			_ = cancelled(cancel) => RelayError::Cancelled,
			_ = tokio::time::sleep(self.config.acquire_timeout()) => RelayError::Timeout { step },
			joined = &mut task => {
				return match joined {
					Ok(Ok(lease)) => Ok(lease),
					Ok(Err(e)) => {
						warn!(target = "shield.relay", request_id = %spec.request_id, account_id = %spec.account_id, error = %e, "no sandbox");
						Err(StepFailure::new(step, RelayError::from(e)))
					}
					Err(e) => Err(StepFailure::new(step, RelayError::ContextCreationFailed(e.to_string()))),
				};
			}
		};

		let pool = self.pool.clone();
		tokio::spawn(async move {
			if let Ok(Ok(lease)) = task.await {
				pool.destroy(lease).await;
			}
		});
		Err(StepFailure::new(step, abandoned))
	}

	async fn run_leased(&self, spec: &FetchSpec, lease: &ContextLease, meta: &mut OutcomeMeta, cancel: &mut watch::Receiver<bool>) -> Result<RelayReply, StepFailure> {
		let request_id = &spec.request_id;
		let tab_id = lease.tab_id();

		meta.steps.push(RelayStep::InstallCookieRule);
		self.install_cookie_rule(spec, lease, meta, cancel).await?;

		meta.steps.push(RelayStep::AwaitGuards);
		let guard_limit = self.guards.budget() + EXCHANGE_SLACK;
		let guards = bounded(cancel, RelayStep::AwaitGuards, guard_limit, self.guards.await_guards(tab_id, request_id)).await?;
		if let Some(kind) = guards.failure() {
			warn!(target = "shield.relay", %request_id, %tab_id, guard = %kind, "guards not passed; fetch not relayed");
			return Err(StepFailure::new(RelayStep::AwaitGuards, RelayError::GuardNotPassed(kind)));
		}

		meta.steps.push(RelayStep::AwaitChallengeIfPresent);
		let (timeout_ms, pre_trigger) = match &spec.challenge {
			Some(challenge) => (challenge.timeout_ms, challenge.pre_trigger.clone()),
			None => (None, None),
		};
		let budget = self.challenge.budget(timeout_ms);
		let wait = self.challenge.wait_for_token(tab_id, request_id, spec.challenge_page_url(), timeout_ms, pre_trigger);
		let challenge = match bounded(cancel, RelayStep::AwaitChallengeIfPresent, budget + EXCHANGE_SLACK, wait).await {
			Ok(result) => result,
			Err(failure) if failure.error == RelayError::Cancelled => return Err(failure),
			Err(_) => ChallengeWaitResult::timed_out(),
		};
		if challenge.status == ChallengeStatus::Timeout {
			warn!(target = "shield.relay", %request_id, %tab_id, "challenge token not obtained; relaying anyway");
			meta.degradations.push(Degradation::ChallengeTimeout);
		}
		let token = challenge.usable_token().map(str::to_string);
		meta.challenge = Some(challenge);

		meta.steps.push(RelayStep::PerformRelayedFetch);
		let fetch_url = with_token(&spec.fetch_url, &self.config.token_query_param, token.as_deref());
		let request = SandboxRequest::PerformRelayedFetch {
			fetch_url,
			fetch_options: spec.fetch_options.clone(),
			response_type: spec.response_type,
		};
		let limit = self.config.fetch_timeout();
		let step = RelayStep::PerformRelayedFetch;
		let sent = bounded(cancel, step, limit + EXCHANGE_SLACK, self.messenger.send(tab_id, request, limit)).await?;
		let value = sent.map_err(|e| fetch_error(e, step))?;

		let reply: RelayReply = serde_json::from_value(value)
			.map_err(|e| StepFailure::new(step, RelayError::RelayedFetchFailed(format!("malformed relay reply: {e}"))).poisoned())?;
		decode_reply(reply, spec.response_type).map_err(|reason| StepFailure::new(step, RelayError::RelayedFetchFailed(reason)))
	}

	async fn install_cookie_rule(&self, spec: &FetchSpec, lease: &ContextLease, meta: &mut OutcomeMeta, cancel: &mut watch::Receiver<bool>) -> Result<(), StepFailure> {
		let request_id = &spec.request_id;
		let tab_id = lease.tab_id();
		let Some(session) = spec.session_cookie.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
			debug!(target = "shield.relay", %request_id, %tab_id, "no session cookie; isolation skipped");
			meta.isolation = IsolationMode::Skipped;
			return Ok(());
		};

		let step = RelayStep::InstallCookieRule;
		let limit = self.config.rule_timeout();
		let site_cookies = match bounded(cancel, step, limit, self.host.site_cookies(&spec.origin_url)).await? {
			Ok(cookies) => cookies,
			Err(e) => {
				debug!(target = "shield.relay", %request_id, error = %e, "site cookies unavailable");
				Vec::new()
			}
		};
		let cookie = merge_cookie_header(session, &site_cookies);

		let install = bounded(cancel, step, limit, self.rules.apply(tab_id, &spec.fetch_url, &cookie)).await?;
		meta.isolation = install.isolation();
		match install {
			RuleInstall::Installed(rule_id) => {
				debug!(target = "shield.relay", %request_id, %tab_id, rule_id, "session cookie isolated");
			}
			RuleInstall::Unsupported(reason) => meta.degradations.push(Degradation::RuleInstallUnsupported { reason }),
			RuleInstall::Failed(reason) => meta.degradations.push(Degradation::RuleInstallFailed { reason }),
		}
		Ok(())
	}
}

/// Runs `fut` unless the run is cancelled or `limit` elapses first.
async fn bounded<T>(cancel: &mut watch::Receiver<bool>, step: RelayStep, limit: Duration, fut: impl Future<Output = T>) -> Result<T, StepFailure> {
	tokio::select! {
		biased;
		_ = cancelled(cancel) => Err(StepFailure::new(step, RelayError::Cancelled)),
		res = tokio::time::timeout(limit, fut) => res.map_err(|_| StepFailure::new(step, RelayError::Timeout { step })),
	}
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
	if cancel.wait_for(|flag| *flag).await.is_err() {
		std::future::pending::<()>().await;
	}
}

fn validate(spec: &FetchSpec) -> Result<(), RelayError> {
	if spec.request_id.is_empty() {
		return Err(RelayError::InvalidRequest("empty request id".into()));
	}
	if spec.account_id.trim().is_empty() {
		return Err(RelayError::InvalidRequest("empty account id".into()));
	}
	if !is_http_url(&spec.origin_url) {
		return Err(RelayError::InvalidRequest(format!("origin is not an http(s) URL: {:?}", spec.origin_url)));
	}
	if !is_http_url(&spec.fetch_url) {
		return Err(RelayError::InvalidRequest(format!("fetch URL is not an http(s) URL: {:?}", spec.fetch_url)));
	}
	Ok(())
}

fn fetch_error(err: HostError, step: RelayStep) -> StepFailure {
	if err.is_timeout() {
		StepFailure::new(step, RelayError::Timeout { step })
	} else {
		StepFailure::new(step, RelayError::RelayedFetchFailed(err.to_string())).poisoned()
	}
}

/// Appends the challenge token to `fetch_url` as `param`.
fn with_token(fetch_url: &str, param: &str, token: Option<&str>) -> String {
	let Some(token) = token else {
		return fetch_url.to_string();
	};
	match Url::parse(fetch_url) {
		Ok(mut url) => {
			url.query_pairs_mut().append_pair(param, token);
			url.into()
		}
		Err(_) => fetch_url.to_string(),
	}
}

/// Normalises the body of a relayed reply for `response_type`.
///
/// JSON bodies delivered as strings are re-parsed. Binary bodies end up as
/// base64; the page may hand them over already encoded, as a byte array or
/// wrapped as `{data: [...]}`.
fn decode_reply(mut reply: RelayReply, response_type: ResponseType) -> Result<RelayReply, String> {
	if !reply.success {
		return Ok(reply);
	}
	reply.data = match (response_type, reply.data) {
		(ResponseType::Json, Value::String(raw)) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
		(ResponseType::ArrayBuffer | ResponseType::Blob, data) => Value::String(binary_body(data)?),
		(_, data) => data,
	};
	Ok(reply)
}

fn binary_body(data: Value) -> Result<String, String> {
	match data {
		Value::Null => Ok(String::new()),
		Value::String(encoded) => match STANDARD.decode(&encoded) {
			Ok(_) => Ok(encoded),
			Err(e) => Err(format!("binary body is not valid base64: {e}")),
		},
		Value::Array(items) => {
			let bytes = items
				.iter()
				.map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
				.collect::<Option<Vec<u8>>>()
				.ok_or_else(|| "binary body contains non-byte values".to_string())?;
			Ok(STANDARD.encode(bytes))
		}
		Value::Object(mut map) => match map.remove("data") {
			Some(inner @ (Value::Array(_) | Value::String(_))) => binary_body(inner),
			_ => Err("binary body object carries no data".into()),
		},
		other => Err(format!("unexpected binary body: {other}")),
	}
}

fn finish(request_id: RequestId, mut meta: OutcomeMeta, result: Result<RelayReply, StepFailure>) -> FetchOutcome {
	meta.steps.push(RelayStep::Done);
	match result {
		Ok(reply) if reply.success => FetchOutcome {
			request_id,
			success: true,
			status: reply.status,
			headers: reply.headers,
			data: reply.data,
			error: None,
			meta,
		},
		Ok(reply) => {
			meta.failed_step = Some(RelayStep::PerformRelayedFetch);
			let message = reply.error.unwrap_or_else(|| match reply.status {
				Some(status) => format!("HTTP {status}"),
				None => "relayed fetch failed".to_string(),
			});
			FetchOutcome {
				request_id,
				success: false,
				status: reply.status,
				headers: reply.headers,
				data: reply.data,
				error: Some(RelayError::RelayedFetchFailed(message).to_string()),
				meta,
			}
		}
		Err(failure) => {
			meta.failed_step = Some(failure.step);
			FetchOutcome {
				meta,
				..FetchOutcome::failure(request_id, failure.error.to_string())
			}
		}
	}
}
