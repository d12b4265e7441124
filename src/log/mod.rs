//! Transactional metadata log
//!
//! Changes are declared against byte ranges of the master devices, made
//! durable together by one commit record per epoch, and later rolled to
//! their master locations by a background engine.
//!
//! # Components
//!
//! - Delta map: declared, uncommitted changes
//! - Transaction coordinator: epoch admission and group commit
//! - Log map: committed changes waiting to be rolled
//! - Roll engine: moves committed changes to the masters, trims the log
//!
//! # Guarantees
//!
//! - All deltas of an epoch survive a crash together or not at all
//! - A delta reaches its master only after its commit record is on the log
//! - At most one thread writes a commit record at a time
//! - Any commit or roll I/O failure makes the unit permanently unusable

mod checksum;
mod config;
mod coordinator;
mod delta;
mod delta_map;
mod errors;
mod log_map;
mod reader;
mod record;
mod recovery;
mod roll;
mod roll_buffer;
mod state;
mod unit;
mod writer;

pub use config::{LogConfig, MAX_ROLL_BUFFERS, MIN_ROLL_BUFFERS};
pub use coordinator::{AsyncOrigin, CoordinatorSnapshot, SyncAdmission, SyncMode, TransactionContext};
pub use delta::{DeltaKind, DeltaPayload, DeltaRange, DeltaSource};
pub use errors::{LogError, LogErrorCode, LogResult, Severity};
pub use reader::{LogReader, ScanStop};
pub use record::{LogHeader, LogRecord, RecordBody, RecordKind, HEADER_SIZE};
pub use recovery::{scan_log, Epoch, LogScan, RecoveryReport};
pub use roll::PassStats;
pub use roll_buffer::CachedRollBuffer;
pub use unit::LogUnit;
