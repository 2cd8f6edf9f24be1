use thiserror::Error;

/// Errors raised by the correlation layer.
#[derive(Debug, Error)]
pub enum Error {
	#[error("Timeout: {0}")]
	Timeout(String),

	#[error("Channel closed unexpectedly")]
	ChannelClosed,

	#[error("Protocol error: {0}")]
	ProtocolError(String),

	/// The sandbox script answered with an error payload.
	#[error("Sandbox error: {0}")]
	Remote(String),

	#[error("Tab closed: {0}")]
	TabClosed(String),

	#[error("Transport error: {0}")]
	TransportError(String),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
