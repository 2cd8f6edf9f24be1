//! Result envelope printed by every command.
//!
//! Stdout carries exactly one envelope per invocation:
//! `{ "ok", "command", "data" | "error", "elapsedMs" }`.

use std::io::{self, Write};
use std::time::Instant;

use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
	/// Pretty-printed JSON
	#[default]
	Json,
	/// One envelope per line
	Ndjson,
	/// Key/value lines for reading in a terminal
	Text,
}

/// Machine-readable failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	ConfigError,
	ScenarioError,
	InvalidInput,
	IoError,
	InternalError,
}

impl ErrorCode {
	pub fn as_str(self) -> &'static str {
		match self {
			ErrorCode::ConfigError => "CONFIG_ERROR",
			ErrorCode::ScenarioError => "SCENARIO_ERROR",
			ErrorCode::InvalidInput => "INVALID_INPUT",
			ErrorCode::IoError => "IO_ERROR",
			ErrorCode::InternalError => "INTERNAL_ERROR",
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeError {
	pub code: ErrorCode,
	pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
	pub ok: bool,
	pub command: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<EnvelopeError>,
	pub elapsed_ms: u64,
}

impl Envelope {
	pub fn success(command: &'static str, data: Value, started: Instant) -> Self {
		Self {
			ok: true,
			command,
			data: Some(data),
			error: None,
			elapsed_ms: elapsed_ms(started),
		}
	}

	pub fn failure(command: &'static str, err: &CliError, started: Instant) -> Self {
		Self {
			ok: false,
			command,
			data: None,
			error: Some(EnvelopeError {
				code: err.code(),
				message: err.to_string(),
			}),
			elapsed_ms: elapsed_ms(started),
		}
	}

	pub fn render(&self, format: OutputFormat, out: &mut impl Write) -> io::Result<()> {
		match format {
			OutputFormat::Json => {
				serde_json::to_writer_pretty(&mut *out, self)?;
				writeln!(out)
			}
			OutputFormat::Ndjson => {
				serde_json::to_writer(&mut *out, self)?;
				writeln!(out)
			}
			OutputFormat::Text => self.render_text(out),
		}
	}

	/// Writes to stdout; a closed pipe is not worth failing the command over.
	pub fn print(&self, format: OutputFormat) {
		let _ = self.render(format, &mut io::stdout().lock());
	}

	fn render_text(&self, out: &mut impl Write) -> io::Result<()> {
		if let Some(error) = &self.error {
			writeln!(out, "{} failed [{}]: {}", self.command, error.code.as_str(), error.message)?;
			return Ok(());
		}
		match &self.data {
			Some(Value::Object(fields)) => {
				for (key, value) in fields {
					match value {
						Value::String(s) => writeln!(out, "{key}: {s}")?,
						Value::Object(_) | Value::Array(_) => writeln!(out, "{key}: {}", serde_json::to_string(value)?)?,
						other => writeln!(out, "{key}: {other}")?,
					}
				}
			}
			Some(other) => writeln!(out, "{other}")?,
			None => {}
		}
		writeln!(out, "({} in {} ms)", self.command, self.elapsed_ms)
	}
}

fn elapsed_ms(started: Instant) -> u64 {
	u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
