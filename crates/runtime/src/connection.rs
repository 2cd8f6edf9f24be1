//! Request/response correlation between the orchestrator and sandbox tabs.
//!
//! This module implements the correlation layer on top of a transport.
//! It handles:
//! - Generating unique message IDs
//! - Correlating replies with pending requests
//! - Bounding every request with its own timer
//! - Distinguishing tab events from replies
//! - Fanning tab events out to subscribers
//!
//! # Message Flow
//!
//! 1. Caller invokes `send_message()` with a tab id, payload and timeout
//! 2. Connection generates a unique ID and registers a oneshot channel
//! 3. The envelope is serialized and sent via the transport
//! 4. Caller awaits the receiver, bounded by the timeout
//! 5. Message loop receives the reply from the transport
//! 6. Reply is correlated by ID and sent via the oneshot channel
//! 7. On timeout the pending entry is removed, so a late reply is dropped
//!
//! # Wire format
//!
//! ```json
//! { "id": 42, "tabId": 7, "payload": { "action": "checkCapGuard" } }
//! { "id": 42, "result": { "success": true, "passed": true } }
//! { "id": 42, "error": { "message": "No receiving end", "name": "TabClosedError" } }
//! { "tabId": 7, "event": "tabRemoved", "params": {} }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shield_protocol::TabId;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, TransportReceiver};

const EVENT_CAPACITY: usize = 64;

/// Outbound message addressed to the script in one tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
	/// Unique message ID for correlating the reply
	pub id: u64,
	/// Tab whose script should handle the payload
	pub tab_id: TabId,
	pub payload: Value,
}

/// Reply from a tab script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
	pub id: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyError {
	pub message: String,
	/// Error type name (e.g., "TimeoutError", "TabClosedError")
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

/// Unsolicited notification about a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEvent {
	pub tab_id: TabId,
	pub event: String,
	#[serde(default)]
	pub params: Value,
}

impl TabEvent {
	pub const TAB_REMOVED: &'static str = "tabRemoved";

	pub fn is_tab_removed(&self) -> bool {
		self.event == Self::TAB_REMOVED
	}
}

/// Inbound messages, distinguished by the presence of `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
	Reply(Reply),
	Event(TabEvent),
}

/// Correlated connection to the sandbox scripts.
///
/// Uses sequential message IDs and oneshot channels for correlation. Safe to
/// share across tasks behind an `Arc`; concurrent requests to different tabs
/// (or the same tab) are independent.
pub struct Connection {
	last_id: AtomicU64,
	/// Pending request callbacks keyed by message ID
	callbacks: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>,
	sender: tokio::sync::Mutex<Box<dyn Transport>>,
	receiver: Mutex<Option<Box<dyn TransportReceiver>>>,
	message_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
	events: broadcast::Sender<TabEvent>,
	closed: AtomicBool,
}

impl Connection {
	pub fn new(parts: TransportParts) -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		Self {
			last_id: AtomicU64::new(0),
			callbacks: Arc::new(Mutex::new(HashMap::new())),
			sender: tokio::sync::Mutex::new(parts.sender),
			receiver: Mutex::new(Some(parts.receiver)),
			message_rx: Mutex::new(Some(parts.message_rx)),
			events,
			closed: AtomicBool::new(false),
		}
	}

	/// Subscribes to tab events received after this call.
	pub fn subscribe(&self) -> broadcast::Receiver<TabEvent> {
		self.events.subscribe()
	}

	/// Number of requests still awaiting a reply.
	pub fn pending_requests(&self) -> usize {
		self.callbacks.lock().len()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Sends `payload` to the script in `tab_id` and awaits its reply.
	///
	/// # Errors
	///
	/// - [`Error::Timeout`] when no reply arrives within `timeout`
	/// - [`Error::ChannelClosed`] when the message loop ended first
	/// - [`Error::Remote`] / [`Error::TabClosed`] when the script replied with an error
	/// - transport errors from the send itself
	pub async fn send_message(&self, tab_id: TabId, payload: Value, timeout: Duration) -> Result<Value> {
		if self.is_closed() {
			return Err(Error::ChannelClosed);
		}

		let id = self.last_id.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = oneshot::channel();
		self.callbacks.lock().insert(id, tx);

		let envelope = Envelope { id, tab_id, payload };
		let sent = match serde_json::to_value(&envelope) {
			Ok(value) => self.sender.lock().await.send(value).await,
			Err(e) => Err(Error::from(e)),
		};
		if let Err(e) = sent {
			self.callbacks.lock().remove(&id);
			return Err(e);
		}

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(Error::ChannelClosed),
			Err(_) => {
				self.callbacks.lock().remove(&id);
				debug!(target = "shield.connection", id, %tab_id, "request timed out");
				Err(Error::Timeout(format!("no reply from tab {tab_id} within {} ms", timeout.as_millis())))
			}
		}
	}

	/// Runs the message dispatch loop until the transport closes.
	///
	/// Spawn this once in a background task. On exit every pending request
	/// fails with [`Error::ChannelClosed`].
	pub async fn run(&self) {
		let receiver = self.receiver.lock().take();
		let message_rx = self.message_rx.lock().take();
		let (Some(receiver), Some(mut message_rx)) = (receiver, message_rx) else {
			warn!(target = "shield.connection", "run() called more than once");
			return;
		};

		let transport_handle = tokio::spawn(async move {
			if let Err(e) = receiver.run().await {
				error!(target = "shield.connection", error = %e, "transport error");
			}
		});

		while let Some(message_value) = message_rx.recv().await {
			match serde_json::from_value::<Inbound>(message_value.clone()) {
				Ok(message) => {
					if let Err(e) = self.dispatch(message) {
						debug!(target = "shield.connection", error = %e, "dropping message");
					}
				}
				Err(e) => {
					error!(target = "shield.connection", error = %e, message = %message_value, "failed to parse message");
				}
			}
		}

		debug!(target = "shield.connection", "message loop ended (transport closed)");
		self.close();
		let _ = transport_handle.await;
	}

	/// Fails every pending request and rejects new ones.
	pub fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		let pending: Vec<_> = self.callbacks.lock().drain().collect();
		for (_, callback) in pending {
			let _ = callback.send(Err(Error::ChannelClosed));
		}
	}

	fn dispatch(&self, message: Inbound) -> Result<()> {
		match message {
			Inbound::Reply(reply) => {
				// A missing entry usually means the request already timed out.
				let callback = self
					.callbacks
					.lock()
					.remove(&reply.id)
					.ok_or_else(|| Error::ProtocolError(format!("Cannot find request to respond: id={}", reply.id)))?;

				let result = match reply.error {
					Some(error) => Err(parse_reply_error(error)),
					None => Ok(reply.result.unwrap_or(Value::Null)),
				};

				let _ = callback.send(result);
				Ok(())
			}
			Inbound::Event(event) => {
				debug!(target = "shield.connection", tab_id = %event.tab_id, event = %event.event, "tab event");
				// No subscribers is fine.
				let _ = self.events.send(event);
				Ok(())
			}
		}
	}
}

fn parse_reply_error(error: ReplyError) -> Error {
	match error.name.as_deref() {
		Some("TimeoutError") => Error::Timeout(error.message),
		Some("TabClosedError") => Error::TabClosed(error.message),
		_ => Error::Remote(error.message),
	}
}
