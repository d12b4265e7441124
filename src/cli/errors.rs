//! CLI error types
//!
//! Every CLI error ends the process with status 1. The code string is the
//! first thing on the stderr line so scripts can match on it.

use std::io;

use thiserror::Error;

use crate::log::LogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Config file missing, unreadable or invalid
    ConfigError,
    /// A device file or stdout failed
    IoError,
    /// The log refused or failed an operation
    LogFailed,
}

impl CliErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "SAMWAL_CLI_CONFIG_ERROR",
            Self::IoError => "SAMWAL_CLI_IO_ERROR",
            Self::LogFailed => "SAMWAL_CLI_LOG_FAILED",
        }
    }
}

#[derive(Debug, Error)]
#[error("{}: {message}", code.code())]
pub struct CliError {
    code: CliErrorCode,
    message: String,
    #[source]
    cause: Option<LogError>,
}

pub type CliResult<T> = Result<T, CliError>;

impl CliError {
    fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn log_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::LogFailed, msg)
    }

    pub fn code(&self) -> CliErrorCode {
        self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The log error behind a `LogFailed`, when there is one.
    pub fn log_error(&self) -> Option<&LogError> {
        self.cause.as_ref()
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<LogError> for CliError {
    fn from(e: LogError) -> Self {
        Self {
            code: CliErrorCode::LogFailed,
            message: e.to_string(),
            cause: Some(e),
        }
    }
}
