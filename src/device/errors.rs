//! # Device Errors

use std::io;

use thiserror::Error;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Device errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("read failed at offset {offset} ({len} bytes): {source}")]
    Read {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("write failed at offset {offset} ({len} bytes): {source}")]
    Write {
        offset: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("flush failed: {0}")]
    Flush(#[source] io::Error),

    #[error("injected {op} failure at offset {offset}")]
    Injected { op: &'static str, offset: u64 },

    #[error("unknown device ordinal {0}")]
    UnknownOrdinal(u8),

    #[error("I/O engine is shut down")]
    EngineShutDown,
}

impl DeviceError {
    /// Whether the failure was produced by fault injection rather than a real device.
    pub fn is_injected(&self) -> bool {
        matches!(self, DeviceError::Injected { .. })
    }

    /// Convert into an `io::Error`, keeping the message.
    pub fn into_io(self) -> io::Error {
        match self {
            DeviceError::Read { source, .. }
            | DeviceError::Write { source, .. }
            | DeviceError::Flush(source) => source,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
