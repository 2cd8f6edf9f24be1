//! Wire types for the sandboxed fetch fallback.
//!
//! This crate contains the serde-serializable types exchanged between the
//! orchestrator, the direct-fetch layer that calls it, and the script running
//! inside each sandbox tab. These types represent the "protocol layer": the
//! shapes of data as they cross a context boundary.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization and small constructors
//! * 1:1 with the message contract: field names match what the sandbox script sends
//! * Stable: Changes only when the message contract changes
//!
//! The orchestration built on top of these types lives in `shield-core`.

pub mod challenge;
pub mod fetch;
pub mod ids;
pub mod rule;
pub mod sandbox;

pub use challenge::*;
pub use fetch::*;
pub use ids::*;
pub use rule::*;
pub use sandbox::*;
