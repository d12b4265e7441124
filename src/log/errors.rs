//! Log error types
//!
//! Error codes:
//! - SAMWAL_LOG_UNUSABLE (FATAL severity)
//! - SAMWAL_WOULD_BLOCK (ERROR severity)
//! - SAMWAL_COMMIT_PENDING (ERROR severity)
//! - SAMWAL_IO_FAILED (FATAL severity)
//! - SAMWAL_CORRUPTION (FATAL severity)
//! - SAMWAL_INVALID_CONFIG (ERROR severity)
//! - SAMWAL_INVALID_DELTA (ERROR severity)
//! - SAMWAL_LOG_FULL (FATAL severity)
//! - SAMWAL_SHUT_DOWN (ERROR severity)

use std::fmt;
use std::io;

use crate::device::DeviceError;

/// Severity levels for log errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation fails, the log unit stays usable
    Error,
    /// The log unit is unusable until remount
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Log error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogErrorCode {
    /// The unit is in the sticky error state
    LogUnusable,
    /// Try-mode admission refused
    WouldBlock,
    /// Don't-pend caller would have to wait on an in-flight commit
    CommitPending,
    /// Device I/O failed
    IoFailed,
    /// Log header or contents unreadable
    Corruption,
    /// Configuration rejected
    InvalidConfig,
    /// Malformed delta declaration
    InvalidDelta,
    /// A single commit does not fit in the log
    LogFull,
    /// Operation on an unmounted unit
    ShutDown,
}

impl LogErrorCode {
    /// Stable string code
    pub fn code(&self) -> &'static str {
        match self {
            LogErrorCode::LogUnusable => "SAMWAL_LOG_UNUSABLE",
            LogErrorCode::WouldBlock => "SAMWAL_WOULD_BLOCK",
            LogErrorCode::CommitPending => "SAMWAL_COMMIT_PENDING",
            LogErrorCode::IoFailed => "SAMWAL_IO_FAILED",
            LogErrorCode::Corruption => "SAMWAL_CORRUPTION",
            LogErrorCode::InvalidConfig => "SAMWAL_INVALID_CONFIG",
            LogErrorCode::InvalidDelta => "SAMWAL_INVALID_DELTA",
            LogErrorCode::LogFull => "SAMWAL_LOG_FULL",
            LogErrorCode::ShutDown => "SAMWAL_SHUT_DOWN",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            LogErrorCode::LogUnusable
            | LogErrorCode::IoFailed
            | LogErrorCode::Corruption
            | LogErrorCode::LogFull => Severity::Fatal,
            LogErrorCode::WouldBlock
            | LogErrorCode::CommitPending
            | LogErrorCode::InvalidConfig
            | LogErrorCode::InvalidDelta
            | LogErrorCode::ShutDown => Severity::Error,
        }
    }
}

impl fmt::Display for LogErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Log error with context
#[derive(Debug)]
pub struct LogError {
    code: LogErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl LogError {
    fn new(code: LogErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// The unit has entered the error state
    pub fn unusable(reason: impl Into<String>) -> Self {
        Self::new(LogErrorCode::LogUnusable, "log unusable").with_details(reason)
    }

    pub fn would_block(message: impl Into<String>) -> Self {
        Self::new(LogErrorCode::WouldBlock, message)
    }

    pub fn commit_pending(message: impl Into<String>) -> Self {
        Self::new(LogErrorCode::CommitPending, message)
    }

    /// Device I/O failure, keeping the underlying error as the source
    pub fn io_failed(message: impl Into<String>, source: DeviceError) -> Self {
        Self {
            code: LogErrorCode::IoFailed,
            message: message.into(),
            details: Some(source.to_string()),
            source: Some(source.into_io()),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(LogErrorCode::Corruption, message)
    }

    /// Corruption with the log position it was found at
    pub fn corruption_at_lsn(lsn: u64, reason: impl Into<String>) -> Self {
        Self::new(LogErrorCode::Corruption, reason).with_details(format!("lsn: {}", lsn))
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(LogErrorCode::InvalidConfig, message)
    }

    pub fn invalid_delta(message: impl Into<String>) -> Self {
        Self::new(LogErrorCode::InvalidDelta, message)
    }

    pub fn log_full(needed: u64, available: u64) -> Self {
        Self::new(LogErrorCode::LogFull, "commit does not fit in the log")
            .with_details(format!("needed: {}, available: {}", needed, available))
    }

    pub fn shut_down() -> Self {
        Self::new(LogErrorCode::ShutDown, "log unit is unmounted")
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn code(&self) -> LogErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for log operations
pub type LogResult<T> = Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LogErrorCode::LogUnusable.code(), "SAMWAL_LOG_UNUSABLE");
        assert_eq!(LogErrorCode::WouldBlock.code(), "SAMWAL_WOULD_BLOCK");
        assert_eq!(LogErrorCode::CommitPending.code(), "SAMWAL_COMMIT_PENDING");
        assert_eq!(LogErrorCode::LogFull.code(), "SAMWAL_LOG_FULL");
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(LogErrorCode::LogUnusable.severity(), Severity::Fatal);
        assert_eq!(LogErrorCode::IoFailed.severity(), Severity::Fatal);
        assert_eq!(LogErrorCode::WouldBlock.severity(), Severity::Error);
        assert_eq!(LogErrorCode::CommitPending.severity(), Severity::Error);
    }

    #[test]
    fn test_io_failed_keeps_source() {
        use std::error::Error;

        let err = LogError::io_failed(
            "commit write failed",
            DeviceError::Flush(io::Error::new(io::ErrorKind::Other, "disk gone")),
        );
        assert!(err.is_fatal());
        assert!(err.source().is_some());
        assert!(err.details().unwrap().contains("disk gone"));
    }

    #[test]
    fn test_display_contains_fields() {
        let err = LogError::corruption_at_lsn(4096, "bad checksum");
        let display = err.to_string();
        assert!(display.contains("FATAL"));
        assert!(display.contains("SAMWAL_CORRUPTION"));
        assert!(display.contains("bad checksum"));
        assert!(display.contains("lsn: 4096"));
    }

    #[test]
    fn test_unusable_carries_reason() {
        let err = LogError::unusable("roll write failed");
        assert_eq!(err.code(), LogErrorCode::LogUnusable);
        assert_eq!(err.details(), Some("roll write failed"));
    }
}
