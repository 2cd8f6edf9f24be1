use std::path::PathBuf;

use shield::ConfigError;
use thiserror::Error;

use crate::output::ErrorCode;

#[derive(Debug, Error)]
pub enum CliError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error("Failed to read scenario {path}: {source}")]
	ScenarioIo {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Invalid scenario {path}: {reason}")]
	Scenario { path: PathBuf, reason: String },

	#[error("Invalid input: {0}")]
	InvalidInput(String),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl CliError {
	pub fn code(&self) -> ErrorCode {
		match self {
			CliError::Config(_) => ErrorCode::ConfigError,
			CliError::ScenarioIo { .. } => ErrorCode::IoError,
			CliError::Scenario { .. } => ErrorCode::ScenarioError,
			CliError::InvalidInput(_) => ErrorCode::InvalidInput,
			CliError::Json(_) => ErrorCode::InternalError,
		}
	}
}

pub type Result<T> = std::result::Result<T, CliError>;
