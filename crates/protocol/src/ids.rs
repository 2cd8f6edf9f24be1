//! Identifier newtypes shared across crates.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Browser tab hosting a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u32);

impl fmt::Display for TabId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Window owning a sandbox tab. Equal to the tab id on hosts without windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub u32);

impl fmt::Display for WindowId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Correlation key for one fallback request.
///
/// Unique per in-flight request; every async reply and the final
/// [`FetchOutcome`](crate::FetchOutcome) carry it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

impl RequestId {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Generates a process-unique id of the form `temp-fetch-<millis>-<seq>`.
	pub fn generate() -> Self {
		let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or_default();
		let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
		Self(format!("temp-fetch-{millis}-{seq}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for RequestId {
	fn from(value: &str) -> Self {
		Self::new(value)
	}
}

impl From<String> for RequestId {
	fn from(value: String) -> Self {
		Self(value)
	}
}
