//! Minimal async RPC layer between the orchestrator and sandbox tabs.
//!
//! The sandbox script and the orchestrator share no memory; every exchange is
//! a message. This crate turns that message stream into awaitable calls:
//!
//! - [`transport`]: the byte/JSON pipe ([`Transport`], [`TransportReceiver`])
//! - [`connection`]: the correlation table (request id → pending completion)
//!   with a timer per request, plus tab event fan-out
//! - [`fake_transport`]: an in-memory transport for tests

pub mod connection;
pub mod error;
pub mod fake_transport;
pub mod transport;

pub use connection::{Connection, Envelope, Inbound, Reply, ReplyError, TabEvent};
pub use error::{Error, Result};
pub use transport::{LineTransport, Transport, TransportParts, TransportReceiver};
