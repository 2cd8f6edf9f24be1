//! Sandboxed fetch fallback orchestrator.
//!
//! When a direct request to an API gateway is refused by an anti-bot layer,
//! `shield` replays it from inside a short-lived, non-foreground sandbox tab
//! that already carries the site's clearance:
//!
//! 1. [`policy`] decides whether the failure is eligible for the fallback
//! 2. [`pool`] hands out a sandbox for the account and origin
//! 3. [`cookie_rule`] pins the account's session cookie to that sandbox only
//! 4. [`guard`] confirms the protection screens are cleared
//! 5. [`challenge`] waits for an interactive challenge token, if one is shown
//! 6. [`relay`] performs the fetch in the page and tears everything down
//!
//! The browser itself sits behind the traits in [`host`]; [`fake`] provides
//! a scripted implementation for tests and dry runs.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shield::{FetchRelay, ShieldConfig, fake::FakeBrowser};
//! use shield_protocol::FetchSpec;
//!
//! let relay = FetchRelay::with_browser(Arc::new(FakeBrowser::new()), &ShieldConfig::default());
//! let outcome = relay
//!     .execute(FetchSpec::new("https://api.example.com", "https://api.example.com/api/user/self", "acct-1"))
//!     .await;
//! assert!(outcome.success);
//! ```

pub mod challenge;
pub mod config;
pub mod cookie_rule;
pub mod cookies;
pub mod error;
pub mod fake;
pub mod guard;
pub mod host;
pub mod policy;
pub mod pool;
pub mod relay;

pub use challenge::ChallengeWaiter;
pub use config::{ChallengeConfig, FallbackConfig, GuardConfig, OverflowPolicy, PoolConfig, RelayConfig, RuleConfig, ShieldConfig};
pub use cookie_rule::{CookieRuleManager, RuleInstall};
pub use error::{ConfigError, GuardFailure, HostError, PoolError, RelayError, Result};
pub use guard::{GuardCheckResult, GuardChecker};
pub use host::{HeaderRuleSurface, LoadState, PageMessenger, SandboxHandle, SandboxHost, SiteCookie, TabUpdate};
pub use policy::{CallingContext, DirectFetchError, FallbackAllowlist, FallbackDecision, FallbackGate, FallbackPreferences, FallbackRequest, is_eligible};
pub use pool::{ContextLease, ContextPool, ContextState, Disposition, EphemeralContext, TeardownReport};
pub use relay::{CancelAck, FetchRelay};
pub use shield_protocol as protocol;
