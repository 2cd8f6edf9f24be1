//! Ephemeral sandbox pool.
//!
//! Sandboxes are keyed by account and origin. A Ready sandbox of the same
//! account and origin is reused; otherwise a new non-foreground one is
//! opened. A per-account semaphore caps how many sandboxes one account can
//! hold, and idle sandboxes are closed after a short grace period.
//!
//! Every successful [`ContextPool::acquire`] yields a [`ContextLease`] that
//! must be handed back through [`ContextPool::release`] or
//! [`ContextPool::destroy`]. Both consume the lease, so teardown happens once.
//! Teardown removes the tab's cookie rule before the sandbox is returned or
//! closed, and a failure in either step never skips the other.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use shield_protocol::{TabId, WindowId};
use shield_runtime::TabEvent;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{OverflowPolicy, PoolConfig};
use crate::cookie_rule::CookieRuleManager;
use crate::error::{HostError, PoolError};
use crate::host::{LoadState, SandboxHost, TabUpdate};

/// Lifecycle of one sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextState {
	Creating,
	Ready,
	InUse,
	TearingDown,
	Closed,
}

impl ContextState {
	pub fn can_transition_to(self, next: ContextState) -> bool {
		use ContextState::*;
		matches!(
			(self, next),
			(Creating, Ready)
				| (Creating, TearingDown)
				| (Ready, InUse)
				| (Ready, TearingDown)
				| (InUse, Ready)
				| (InUse, TearingDown)
				| (TearingDown, Closed)
		)
	}
}

impl fmt::Display for ContextState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralContext {
	pub tab_id: TabId,
	pub window_id: Option<WindowId>,
	pub account_id: String,
	pub origin: String,
	/// Page the sandbox was last pointed at.
	pub url: String,
	pub state: ContextState,
	#[serde(skip)]
	pub created_at: Instant,
	#[serde(skip)]
	pub last_used: Instant,
	/// Number of leases handed out for this sandbox.
	pub uses: u32,
}

impl EphemeralContext {
	fn transition(&mut self, next: ContextState) -> Result<(), PoolError> {
		if !self.state.can_transition_to(next) {
			return Err(PoolError::InvalidTransition {
				tab_id: self.tab_id,
				from: self.state,
				to: next,
			});
		}
		debug!(target = "shield.pool", tab_id = %self.tab_id, from = %self.state, to = %next, "context transition");
		self.state = next;
		Ok(())
	}
}

/// How a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Disposition {
	/// Returned to the pool as Ready.
	Released,
	/// Closed.
	Destroyed,
	/// The sandbox had already been closed externally.
	AlreadyGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
	pub tab_id: TabId,
	pub rule_removed: bool,
	pub disposition: Disposition,
}

/// Normalised `scheme://host[:port]` of `url`.
pub fn origin_of(url: &str) -> Option<String> {
	let url = Url::parse(url).ok()?;
	match url.origin() {
		origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
		url::Origin::Opaque(_) => None,
	}
}

/// Exclusive use of one sandbox until handed back to the pool.
#[must_use = "a lease must be released or destroyed"]
pub struct ContextLease {
	tab_id: TabId,
	window_id: Option<WindowId>,
	account_id: String,
	origin: String,
	reused: bool,
	permit: Option<OwnedSemaphorePermit>,
	pool: Weak<PoolInner>,
	settled: bool,
}

impl ContextLease {
	pub fn tab_id(&self) -> TabId {
		self.tab_id
	}

	pub fn window_id(&self) -> Option<WindowId> {
		self.window_id
	}

	pub fn account_id(&self) -> &str {
		&self.account_id
	}

	pub fn origin(&self) -> &str {
		&self.origin
	}

	/// Whether an existing sandbox was reused.
	pub fn reused(&self) -> bool {
		self.reused
	}
}

impl fmt::Debug for ContextLease {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ContextLease")
			.field("tab_id", &self.tab_id)
			.field("account_id", &self.account_id)
			.field("origin", &self.origin)
			.field("reused", &self.reused)
			.finish()
	}
}

impl Drop for ContextLease {
	fn drop(&mut self) {
		if self.settled {
			return;
		}
		// Dropped without teardown (e.g. the owning future was cancelled).
		let Some(inner) = self.pool.upgrade() else {
			return;
		};
		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			warn!(target = "shield.pool", tab_id = %self.tab_id, "lease dropped outside a runtime; sandbox leaked until reaped");
			return;
		};
		warn!(target = "shield.pool", tab_id = %self.tab_id, "lease dropped without teardown; destroying sandbox");
		let tab_id = self.tab_id;
		let permit = self.permit.take();
		handle.spawn(async move {
			inner.settle(tab_id, false).await;
			drop(permit);
		});
	}
}

#[derive(Default)]
struct PoolState {
	contexts: HashMap<TabId, EphemeralContext>,
	slots: HashMap<String, Arc<Semaphore>>,
	/// Creations per account that passed the cap check but are not tracked
	/// in `contexts` yet.
	pending: HashMap<String, usize>,
	shut_down: bool,
}

/// Holds one unit of an account's cap for a sandbox being created. Dropping
/// it (tracked, failed or abandoned) gives the unit back.
struct PendingCreation<'a> {
	inner: &'a PoolInner,
	account_id: String,
}

impl Drop for PendingCreation<'_> {
	fn drop(&mut self) {
		let mut state = self.inner.state.lock();
		let remaining = match state.pending.get_mut(&self.account_id) {
			Some(count) => {
				*count = count.saturating_sub(1);
				*count
			}
			None => return,
		};
		if remaining == 0 {
			state.pending.remove(&self.account_id);
		}
	}
}

struct PoolInner {
	host: Arc<dyn SandboxHost>,
	rules: Arc<CookieRuleManager>,
	config: PoolConfig,
	state: Mutex<PoolState>,
}

#[derive(Clone)]
pub struct ContextPool {
	inner: Arc<PoolInner>,
}

impl ContextPool {
	pub fn new(host: Arc<dyn SandboxHost>, rules: Arc<CookieRuleManager>, config: PoolConfig) -> Self {
		Self {
			inner: Arc::new(PoolInner {
				host,
				rules,
				config,
				state: Mutex::new(PoolState::default()),
			}),
		}
	}

	pub fn config(&self) -> &PoolConfig {
		&self.inner.config
	}

	/// Hands out a sandbox for `account_id` showing `url`.
	///
	/// # Errors
	///
	/// - [`PoolError::Exhausted`] / [`PoolError::QueueTimeout`] when the
	///   account's cap is reached, depending on the overflow policy
	/// - [`PoolError::CreationFailed`] / [`PoolError::LoadTimeout`] when a new
	///   sandbox could not be brought up; never retried here
	/// - [`PoolError::ShutDown`] after [`shutdown`](Self::shutdown)
	pub async fn acquire(&self, account_id: &str, url: &str) -> Result<ContextLease, PoolError> {
		let inner = &self.inner;
		let origin = origin_of(url).ok_or_else(|| PoolError::CreationFailed(format!("not a sandbox URL: {url:?}")))?;
		let permit = inner.reserve_slot(account_id).await?;

		while let Some(tab_id) = inner.claim_ready(account_id, &origin)? {
			match inner.prepare_reused(tab_id, url).await {
				Ok(()) => {
					info!(target = "shield.pool", %tab_id, account_id, origin = %origin, "reusing sandbox");
					return Ok(self.lease(tab_id, account_id, &origin, true, permit));
				}
				Err(e) => {
					debug!(target = "shield.pool", %tab_id, error = %e, "reuse candidate unusable");
				}
			}
		}

		let reservation = inner.reserve_creation(account_id).await?;
		let tab_id = inner.create(account_id, &origin, url, reservation).await?;
		info!(target = "shield.pool", %tab_id, account_id, origin = %origin, "sandbox created");
		Ok(self.lease(tab_id, account_id, &origin, false, permit))
	}

	fn lease(&self, tab_id: TabId, account_id: &str, origin: &str, reused: bool, permit: OwnedSemaphorePermit) -> ContextLease {
		let window_id = {
			let mut state = self.inner.state.lock();
			state.contexts.get_mut(&tab_id).and_then(|ctx| {
				ctx.uses += 1;
				ctx.last_used = Instant::now();
				ctx.window_id
			})
		};
		ContextLease {
			tab_id,
			window_id,
			account_id: account_id.to_string(),
			origin: origin.to_string(),
			reused,
			permit: Some(permit),
			pool: Arc::downgrade(&self.inner),
			settled: false,
		}
	}

	/// Removes the cookie rule, then returns the sandbox to the pool.
	/// After [`shutdown`](Self::shutdown) the sandbox is closed instead.
	pub async fn release(&self, mut lease: ContextLease) -> TeardownReport {
		lease.settled = true;
		let permit = lease.permit.take();
		let report = self.inner.settle(lease.tab_id, true).await;
		drop(permit);
		if report.disposition == Disposition::Released {
			self.inner.schedule_idle_reap(lease.tab_id);
		}
		report
	}

	/// Removes the cookie rule, then closes the sandbox.
	pub async fn destroy(&self, mut lease: ContextLease) -> TeardownReport {
		lease.settled = true;
		let permit = lease.permit.take();
		let report = self.inner.settle(lease.tab_id, false).await;
		drop(permit);
		report
	}

	/// Closes every Ready sandbox idle for at least the idle timeout.
	pub async fn reap_idle(&self) -> usize {
		let Some(idle) = self.inner.config.idle_timeout() else {
			return 0;
		};
		let victims: Vec<TabId> = {
			let mut state = self.inner.state.lock();
			state
				.contexts
				.values_mut()
				.filter(|ctx| ctx.state == ContextState::Ready && ctx.last_used.elapsed() >= idle)
				.filter_map(|ctx| ctx.transition(ContextState::TearingDown).ok().map(|()| ctx.tab_id))
				.collect()
		};
		for tab_id in &victims {
			self.inner.dispose(*tab_id, true).await;
		}
		victims.len()
	}

	/// The host reported that `tab_id` was closed outside the pool.
	///
	/// Forgets the sandbox and clears its rule without another browser
	/// removal. A lease still holding it settles as [`Disposition::AlreadyGone`].
	pub async fn on_tab_removed(&self, tab_id: TabId) -> bool {
		let known = self.inner.forget(tab_id);
		if known {
			info!(target = "shield.pool", %tab_id, "sandbox closed externally");
			if let Err(e) = self.inner.rules.remove_for_tab(tab_id).await {
				warn!(target = "shield.pool", %tab_id, error = %e, "rule cleanup after external close failed");
			}
		}
		known
	}

	/// Feeds `tabRemoved` events from the runtime into [`on_tab_removed`](Self::on_tab_removed).
	pub fn watch_tab_events(&self, mut events: broadcast::Receiver<TabEvent>) -> JoinHandle<()> {
		let pool = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(event) if event.is_tab_removed() => {
						let Some(inner) = pool.upgrade() else {
							return;
						};
						ContextPool { inner }.on_tab_removed(event.tab_id).await;
					}
					Ok(_) => {}
					Err(broadcast::error::RecvError::Lagged(missed)) => {
						warn!(target = "shield.pool", missed, "tab events lagged");
					}
					Err(broadcast::error::RecvError::Closed) => return,
				}
			}
		})
	}

	/// Closes every idle sandbox and refuses further acquisitions. Sandboxes
	/// still leased are closed when their lease settles.
	pub async fn shutdown(&self) -> usize {
		let victims: Vec<TabId> = {
			let mut state = self.inner.state.lock();
			state.shut_down = true;
			for slot in state.slots.values() {
				slot.close();
			}
			state
				.contexts
				.values_mut()
				.filter(|ctx| ctx.state == ContextState::Ready)
				.filter_map(|ctx| ctx.transition(ContextState::TearingDown).ok().map(|()| ctx.tab_id))
				.collect()
		};
		info!(target = "shield.pool", idle = victims.len(), "pool shutting down");
		for tab_id in &victims {
			self.inner.dispose(*tab_id, true).await;
		}
		victims.len()
	}

	/// Sandboxes currently tracked, ordered by tab id.
	pub fn snapshot(&self) -> Vec<EphemeralContext> {
		let state = self.inner.state.lock();
		let mut contexts: Vec<_> = state.contexts.values().cloned().collect();
		contexts.sort_by_key(|ctx| ctx.tab_id);
		contexts
	}

	pub fn state_of(&self, tab_id: TabId) -> Option<ContextState> {
		self.inner.state.lock().contexts.get(&tab_id).map(|ctx| ctx.state)
	}
}

impl PoolInner {
	async fn reserve_slot(&self, account_id: &str) -> Result<OwnedSemaphorePermit, PoolError> {
		let cap = self.config.max_contexts_per_account;
		let slot = {
			let mut state = self.state.lock();
			if state.shut_down {
				return Err(PoolError::ShutDown);
			}
			Arc::clone(state.slots.entry(account_id.to_string()).or_insert_with(|| Arc::new(Semaphore::new(cap))))
		};

		match self.config.overflow {
			OverflowPolicy::Reject => slot.try_acquire_owned().map_err(|e| match e {
				tokio::sync::TryAcquireError::Closed => PoolError::ShutDown,
				tokio::sync::TryAcquireError::NoPermits => PoolError::Exhausted {
					account_id: account_id.to_string(),
					cap,
				},
			}),
			OverflowPolicy::Queue => match tokio::time::timeout(self.config.queue_timeout(), slot.acquire_owned()).await {
				Ok(Ok(permit)) => Ok(permit),
				Ok(Err(_)) => Err(PoolError::ShutDown),
				Err(_) => Err(PoolError::QueueTimeout {
					account_id: account_id.to_string(),
				}),
			},
		}
	}

	/// Marks the most recently used Ready sandbox of this account and origin
	/// as InUse.
	fn claim_ready(&self, account_id: &str, origin: &str) -> Result<Option<TabId>, PoolError> {
		let mut state = self.state.lock();
		if state.shut_down {
			return Err(PoolError::ShutDown);
		}
		let candidate = state
			.contexts
			.values_mut()
			.filter(|ctx| ctx.state == ContextState::Ready && ctx.account_id == account_id && ctx.origin == origin)
			.max_by_key(|ctx| ctx.last_used);
		match candidate {
			Some(ctx) => {
				ctx.transition(ContextState::InUse)?;
				Ok(Some(ctx.tab_id))
			}
			None => Ok(None),
		}
	}

	/// Probes a claimed sandbox and points it at `url` if needed. On failure
	/// the sandbox leaves the pool: forgotten if the tab is already gone,
	/// closed otherwise.
	async fn prepare_reused(&self, tab_id: TabId, url: &str) -> Result<(), PoolError> {
		match self.host.load_state(tab_id).await {
			Ok(_) => {}
			Err(e @ HostError::TabNotFound(_)) => {
				debug!(target = "shield.pool", %tab_id, "sandbox no longer alive");
				self.forget(tab_id);
				return Err(e.into());
			}
			Err(e) => {
				warn!(target = "shield.pool", %tab_id, error = %e, "probing reused sandbox failed; closing it");
				if self.mark(tab_id, ContextState::TearingDown).is_ok() {
					self.dispose(tab_id, true).await;
				}
				return Err(e.into());
			}
		}

		let current = self.state.lock().contexts.get(&tab_id).map(|ctx| ctx.url.clone());
		if current.as_deref() == Some(url) {
			return Ok(());
		}

		let navigated = async {
			self.host.update(tab_id, TabUpdate::navigate(url)).await?;
			self.wait_for_load(tab_id).await
		};
		match navigated.await {
			Ok(()) => {
				if let Some(ctx) = self.state.lock().contexts.get_mut(&tab_id) {
					ctx.url = url.to_string();
				}
				Ok(())
			}
			Err(e) => {
				warn!(target = "shield.pool", %tab_id, error = %e, "navigating reused sandbox failed");
				let tearing_down = self.mark(tab_id, ContextState::TearingDown).is_ok();
				if tearing_down {
					self.dispose(tab_id, true).await;
				}
				Err(e)
			}
		}
	}

	/// Takes one unit of the account's cap for a new sandbox.
	///
	/// Existing sandboxes and creations still in flight both count, under
	/// one lock. At the cap, the least recently used idle sandbox of the
	/// account is closed first. If the only surplus is sandboxes already
	/// closing, waits for them.
	async fn reserve_creation(&self, account_id: &str) -> Result<PendingCreation<'_>, PoolError> {
		let cap = self.config.max_contexts_per_account;
		loop {
			let reserved = {
				let mut state = self.state.lock();
				if state.shut_down {
					return Err(PoolError::ShutDown);
				}
				let pending = state.pending.get(account_id).copied().unwrap_or(0);
				let existing = state
					.contexts
					.values()
					.filter(|ctx| ctx.account_id == account_id && ctx.state != ContextState::Closed)
					.count();
				let victim = if existing + pending < cap {
					None
				} else {
					state
						.contexts
						.values_mut()
						.filter(|ctx| ctx.account_id == account_id && ctx.state == ContextState::Ready)
						.min_by_key(|ctx| ctx.last_used)
						.and_then(|ctx| ctx.transition(ContextState::TearingDown).ok().map(|()| ctx.tab_id))
				};
				if existing + pending < cap || victim.is_some() {
					*state.pending.entry(account_id.to_string()).or_insert(0) += 1;
					Some(victim)
				} else {
					None
				}
			};

			match reserved {
				Some(victim) => {
					let reservation = PendingCreation {
						inner: self,
						account_id: account_id.to_string(),
					};
					if let Some(tab_id) = victim {
						info!(target = "shield.pool", %tab_id, account_id, "evicting idle sandbox to stay under cap");
						self.dispose(tab_id, true).await;
					}
					return Ok(reservation);
				}
				None => {
					debug!(target = "shield.pool", account_id, "at cap with sandboxes still closing; waiting");
					tokio::time::sleep(self.config.load_poll_interval()).await;
				}
			}
		}
	}

	async fn create(&self, account_id: &str, origin: &str, url: &str, reservation: PendingCreation<'_>) -> Result<TabId, PoolError> {
		let handle = self
			.host
			.create(url, false)
			.await
			.map_err(|e| PoolError::CreationFailed(e.to_string()))?;
		let Some(tab_id) = handle.tab_id else {
			return Err(PoolError::CreationFailed("host returned no tab id".into()));
		};

		let now = Instant::now();
		self.state.lock().contexts.insert(
			tab_id,
			EphemeralContext {
				tab_id,
				window_id: handle.window_id,
				account_id: account_id.to_string(),
				origin: origin.to_string(),
				url: url.to_string(),
				state: ContextState::Creating,
				created_at: now,
				last_used: now,
				uses: 0,
			},
		);
		drop(reservation);

		let ready = match self.wait_for_load(tab_id).await {
			Ok(()) => self.activate_created(tab_id),
			Err(e) => Err(e),
		};
		if let Err(e) = ready {
			warn!(target = "shield.pool", %tab_id, error = %e, "sandbox creation failed; removing half-created tab");
			if self.mark(tab_id, ContextState::TearingDown).is_ok() {
				self.dispose(tab_id, true).await;
			}
			return Err(e);
		}
		Ok(tab_id)
	}

	fn activate_created(&self, tab_id: TabId) -> Result<(), PoolError> {
		let mut state = self.state.lock();
		if state.shut_down {
			return Err(PoolError::ShutDown);
		}
		let ctx = state.contexts.get_mut(&tab_id).ok_or(HostError::TabNotFound(tab_id))?;
		ctx.transition(ContextState::Ready)?;
		ctx.transition(ContextState::InUse)
	}

	async fn wait_for_load(&self, tab_id: TabId) -> Result<(), PoolError> {
		let limit = self.config.load_timeout();
		match tokio::time::timeout(limit, self.poll_until_complete(tab_id)).await {
			Ok(result) => result,
			Err(_) => Err(PoolError::LoadTimeout {
				tab_id,
				waited_ms: limit.as_millis() as u64,
			}),
		}
	}

	async fn poll_until_complete(&self, tab_id: TabId) -> Result<(), PoolError> {
		loop {
			match self.host.load_state(tab_id).await? {
				LoadState::Complete => return Ok(()),
				LoadState::Loading => tokio::time::sleep(self.config.load_poll_interval()).await,
			}
		}
	}

	fn mark(&self, tab_id: TabId, next: ContextState) -> Result<(), PoolError> {
		let mut state = self.state.lock();
		let ctx = state.contexts.get_mut(&tab_id).ok_or(HostError::TabNotFound(tab_id))?;
		ctx.transition(next)
	}

	/// Drops a sandbox from the pool without touching the browser.
	fn forget(&self, tab_id: TabId) -> bool {
		let mut state = self.state.lock();
		match state.contexts.remove(&tab_id) {
			Some(mut ctx) => {
				if ctx.state != ContextState::TearingDown {
					ctx.state = ContextState::TearingDown;
				}
				let _ = ctx.transition(ContextState::Closed);
				true
			}
			None => false,
		}
	}

	/// Teardown of a leased sandbox: rule removal, then release or close.
	async fn settle(&self, tab_id: TabId, want_release: bool) -> TeardownReport {
		let rule_removed = match self.rules.remove_for_tab(tab_id).await {
			Ok(()) => true,
			Err(e) => {
				warn!(target = "shield.pool", %tab_id, error = %e, "cookie rule removal failed; continuing teardown");
				false
			}
		};

		let disposition = {
			let mut state = self.state.lock();
			let shut_down = state.shut_down;
			match state.contexts.get_mut(&tab_id) {
				None => Disposition::AlreadyGone,
				Some(ctx) if ctx.state != ContextState::InUse => Disposition::AlreadyGone,
				Some(ctx) => {
					let next = if want_release && !shut_down {
						ContextState::Ready
					} else {
						ContextState::TearingDown
					};
					match ctx.transition(next) {
						Ok(()) if next == ContextState::Ready => {
							ctx.last_used = Instant::now();
							Disposition::Released
						}
						Ok(()) => Disposition::Destroyed,
						Err(_) => Disposition::AlreadyGone,
					}
				}
			}
		};

		if disposition == Disposition::Destroyed {
			self.dispose(tab_id, false).await;
		}
		info!(target = "shield.pool", %tab_id, rule_removed, disposition = ?disposition, "lease settled");
		TeardownReport {
			tab_id,
			rule_removed,
			disposition,
		}
	}

	/// Closes a sandbox already marked TearingDown. `clear_rule` also
	/// removes its cookie rule first.
	async fn dispose(&self, tab_id: TabId, clear_rule: bool) {
		if clear_rule {
			if let Err(e) = self.rules.remove_for_tab(tab_id).await {
				warn!(target = "shield.pool", %tab_id, error = %e, "cookie rule removal failed; closing anyway");
			}
		}
		if let Err(e) = self.host.remove(tab_id).await {
			warn!(target = "shield.pool", %tab_id, error = %e, "closing sandbox failed");
		}
		let mut state = self.state.lock();
		if let Some(mut ctx) = state.contexts.remove(&tab_id) {
			let _ = ctx.transition(ContextState::Closed);
		}
		debug!(target = "shield.pool", %tab_id, "sandbox closed");
	}

	fn schedule_idle_reap(self: &Arc<Self>, tab_id: TabId) {
		let Some(idle) = self.config.idle_timeout() else {
			return;
		};
		let pool = Arc::downgrade(self);
		tokio::spawn(async move {
			tokio::time::sleep(idle).await;
			let Some(inner) = pool.upgrade() else {
				return;
			};
			let expired = {
				let mut state = inner.state.lock();
				match state.contexts.get_mut(&tab_id) {
					Some(ctx) if ctx.state == ContextState::Ready && ctx.last_used.elapsed() >= idle => {
						ctx.transition(ContextState::TearingDown).is_ok()
					}
					_ => false,
				}
			};
			if expired {
				debug!(target = "shield.pool", %tab_id, "reaping idle sandbox");
				inner.dispose(tab_id, true).await;
			}
		});
	}
}
