//! In-memory transport for exercising the correlation layer without a browser.
//!
//! ```ignore
//! let (parts, controller) = FakeTransportBuilder::new().build();
//! let connection = Arc::new(Connection::new(parts));
//! tokio::spawn({
//!     let conn = Arc::clone(&connection);
//!     async move { conn.run().await }
//! });
//!
//! let fut = connection.send_message(TabId(7), json!({"action": "checkCapGuard"}), timeout);
//! controller.inject_reply(0, json!({"success": true, "passed": true}));
//! let result = fut.await?;
//! ```
//!
//! A responder closure can answer envelopes automatically, which is how the
//! scenario tests script a whole sandbox tab.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use shield_protocol::TabId;
use tokio::sync::mpsc;

use crate::connection::Envelope;
use crate::error::Result;
use crate::transport::{Transport, TransportParts, TransportReceiver};

/// Produces the reply message for an outbound envelope, or `None` to stay silent.
pub type Responder = Arc<dyn Fn(&Envelope) -> Option<Value> + Send + Sync>;

#[derive(Default)]
pub struct FakeTransportBuilder {
	responder: Option<Responder>,
}

impl FakeTransportBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Answers every envelope with whatever `responder` returns. The returned
	/// value is the reply's `result`; wrap errors with [`error_reply`].
	pub fn respond_with<F>(mut self, responder: F) -> Self
	where
		F: Fn(&Envelope) -> Option<Value> + Send + Sync + 'static,
	{
		self.responder = Some(Arc::new(responder));
		self
	}

	/// Returns [`TransportParts`] for a [`Connection`] and a controller for
	/// injecting inbound messages and inspecting what was sent.
	///
	/// [`Connection`]: crate::connection::Connection
	pub fn build(self) -> (TransportParts, FakeTransportController) {
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let sent = Arc::new(Mutex::new(Vec::new()));

		let sender = FakeTransportSender {
			sent: Arc::clone(&sent),
			responder: self.responder,
			inbound_tx: inbound_tx.downgrade(),
		};
		let receiver = FakeTransportReceiver { inbound_rx, message_tx };
		let controller = FakeTransportController { inbound_tx, sent };

		let parts = TransportParts {
			sender: Box::new(sender),
			receiver: Box::new(receiver),
			message_rx,
		};
		(parts, controller)
	}
}

/// Wraps an error as the body a responder should return.
pub fn error_reply(name: &str, message: &str) -> Value {
	json!({ "__error": { "name": name, "message": message } })
}

pub struct FakeTransportController {
	inbound_tx: mpsc::UnboundedSender<Value>,
	sent: Arc<Mutex<Vec<Value>>>,
}

impl FakeTransportController {
	/// Injects a raw inbound message.
	pub fn inject(&self, message: Value) {
		let _ = self.inbound_tx.send(message);
	}

	pub fn inject_reply(&self, id: u64, result: Value) {
		self.inject(json!({ "id": id, "result": result }));
	}

	pub fn inject_error(&self, id: u64, name: &str, message: &str) {
		self.inject(json!({ "id": id, "error": { "message": message, "name": name } }));
	}

	pub fn inject_event(&self, tab_id: TabId, event: &str, params: Value) {
		self.inject(json!({ "tabId": tab_id, "event": event, "params": params }));
	}

	/// Takes all sent envelopes, clearing the buffer.
	pub fn take_sent(&self) -> Vec<Value> {
		std::mem::take(&mut *self.sent.lock())
	}

	/// Closes the inbound side; the connection's message loop then ends.
	pub fn close(self) {
		drop(self.inbound_tx);
	}
}

struct FakeTransportSender {
	sent: Arc<Mutex<Vec<Value>>>,
	responder: Option<Responder>,
	// Weak so that closing the controller still ends the receive loop.
	inbound_tx: mpsc::WeakUnboundedSender<Value>,
}

impl FakeTransportSender {
	fn auto_reply(&self, message: &Value) {
		let Some(responder) = &self.responder else {
			return;
		};
		let Ok(envelope) = serde_json::from_value::<Envelope>(message.clone()) else {
			return;
		};
		let Some(result) = responder(&envelope) else {
			return;
		};
		let reply = match result.get("__error") {
			Some(error) => json!({ "id": envelope.id, "error": error }),
			None => json!({ "id": envelope.id, "result": result }),
		};
		if let Some(inbound_tx) = self.inbound_tx.upgrade() {
			let _ = inbound_tx.send(reply);
		}
	}
}

impl Transport for FakeTransportSender {
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move {
			self.auto_reply(&message);
			self.sent.lock().push(message);
			Ok(())
		})
	}
}

struct FakeTransportReceiver {
	inbound_rx: mpsc::UnboundedReceiver<Value>,
	message_tx: mpsc::UnboundedSender<Value>,
}

impl TransportReceiver for FakeTransportReceiver {
	fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move {
			while let Some(message) = self.inbound_rx.recv().await {
				if self.message_tx.send(message).is_err() {
					break;
				}
			}
			Ok(())
		})
	}
}
