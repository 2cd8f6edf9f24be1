//! Transport abstraction for sandbox messaging.
//!
//! A transport is split into a sending half, owned by the [`Connection`], and a
//! receiving half whose `run` loop forwards every inbound JSON message to
//! `message_rx`. [`LineTransport`] speaks newline-delimited JSON over any async
//! byte stream, which is what a native-messaging bridge or a pipe to the
//! extension host provides.
//!
//! [`Connection`]: crate::connection::Connection

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Sending half of a transport.
pub trait Transport: Send {
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Receiving half of a transport. `run` consumes the receiver and returns when
/// the underlying stream ends.
pub trait TransportReceiver: Send {
	fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Both halves plus the channel the receiver feeds.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
	pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// Newline-delimited JSON transport over an async reader/writer pair.
pub struct LineTransport;

impl LineTransport {
	#[allow(clippy::new_ret_no_self)]
	pub fn new<R, W>(reader: R, writer: W) -> TransportParts
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		TransportParts {
			sender: Box::new(LineSender { writer }),
			receiver: Box::new(LineReceiver {
				reader: BufReader::new(reader),
				message_tx,
			}),
			message_rx,
		}
	}
}

struct LineSender<W> {
	writer: W,
}

impl<W> Transport for LineSender<W>
where
	W: AsyncWrite + Unpin + Send,
{
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move {
			let mut line = serde_json::to_vec(&message)?;
			line.push(b'\n');
			self.writer.write_all(&line).await?;
			self.writer.flush().await?;
			Ok(())
		})
	}
}

struct LineReceiver<R> {
	reader: BufReader<R>,
	message_tx: mpsc::UnboundedSender<Value>,
}

impl<R> TransportReceiver for LineReceiver<R>
where
	R: AsyncRead + Unpin + Send + 'static,
{
	fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move {
			let mut line = String::new();
			loop {
				line.clear();
				let read = self.reader.read_line(&mut line).await.map_err(|e| Error::TransportError(e.to_string()))?;
				if read == 0 {
					debug!(target = "shield.transport", "stream closed");
					return Ok(());
				}

				let trimmed = line.trim();
				if trimmed.is_empty() {
					continue;
				}

				match serde_json::from_str::<Value>(trimmed) {
					Ok(message) => {
						if self.message_tx.send(message).is_err() {
							return Ok(());
						}
					}
					Err(e) => {
						warn!(target = "shield.transport", error = %e, "dropping unparseable line");
					}
				}
			}
		})
	}
}
