//! Log unit configuration
//!
//! Every knob carries a serde default so a partial JSON document is a valid
//! configuration. `validate()` rejects geometry the engine cannot handle;
//! the roll buffer count and I/O thread count are clamped rather than
//! rejected.

use serde::{Deserialize, Serialize};

use super::errors::{LogError, LogResult};

/// Fewest roll buffers a pass may use.
pub const MIN_ROLL_BUFFERS: usize = 4;
/// Most roll buffers a pass may use.
pub const MAX_ROLL_BUFFERS: usize = 64;
/// Sectors per map block are tracked in one `u64`.
pub const MAX_SECTORS_PER_BLOCK: u64 = 64;

const MAX_IO_THREADS: usize = 64;

fn default_map_block_size() -> u64 {
    8192
}

fn default_sector_size() -> u64 {
    512
}

fn default_roll_buffers() -> usize {
    16
}

fn default_roll_wake_interval_ms() -> u64 {
    5000
}

fn default_logmap_roll_threshold() -> usize {
    1536
}

fn default_logmap_high_water() -> usize {
    2048
}

fn default_logmap_async_threshold() -> usize {
    4096
}

fn default_logmap_commit_threshold() -> usize {
    2048
}

fn default_deltamap_commit_threshold() -> usize {
    1024
}

fn default_log_roll_fraction() -> f64 {
    0.5
}

fn default_io_threads() -> usize {
    4
}

/// Tunables of one log unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Alignment unit of deltas and roll I/O.
    #[serde(default = "default_map_block_size")]
    pub map_block_size: u64,

    /// Granularity of roll writes.
    #[serde(default = "default_sector_size")]
    pub sector_size: u64,

    #[serde(default = "default_roll_buffers")]
    pub roll_buffers: usize,

    /// Idle sleep of the roll engine between wake checks.
    #[serde(default = "default_roll_wake_interval_ms")]
    pub roll_wake_interval_ms: u64,

    /// Log map delta count that wakes the roll engine.
    #[serde(default = "default_logmap_roll_threshold")]
    pub logmap_roll_threshold: usize,

    /// Log map delta count above which a commit requests a roll.
    #[serde(default = "default_logmap_high_water")]
    pub logmap_high_water: usize,

    /// Log map delta count above which an async end requests a roll.
    #[serde(default = "default_logmap_async_threshold")]
    pub logmap_async_threshold: usize,

    /// Log map delta count above which an async end forces a commit.
    #[serde(default = "default_logmap_commit_threshold")]
    pub logmap_commit_threshold: usize,

    /// Delta map record count above which an async end forces a commit.
    #[serde(default = "default_deltamap_commit_threshold")]
    pub deltamap_commit_threshold: usize,

    /// Fraction of the log region in use that counts as nearly full.
    #[serde(default = "default_log_roll_fraction")]
    pub log_roll_fraction: f64,

    /// Reservation ceiling in bytes; derived from the log size when absent.
    #[serde(default)]
    pub max_reservation: Option<u64>,

    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Mount without starting the roll engine.
    #[serde(default)]
    pub no_roll: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            map_block_size: default_map_block_size(),
            sector_size: default_sector_size(),
            roll_buffers: default_roll_buffers(),
            roll_wake_interval_ms: default_roll_wake_interval_ms(),
            logmap_roll_threshold: default_logmap_roll_threshold(),
            logmap_high_water: default_logmap_high_water(),
            logmap_async_threshold: default_logmap_async_threshold(),
            logmap_commit_threshold: default_logmap_commit_threshold(),
            deltamap_commit_threshold: default_deltamap_commit_threshold(),
            log_roll_fraction: default_log_roll_fraction(),
            max_reservation: None,
            io_threads: default_io_threads(),
            no_roll: false,
        }
    }
}

impl LogConfig {
    /// Check geometry and thresholds.
    pub fn validate(&self) -> LogResult<()> {
        if self.sector_size == 0 || !self.sector_size.is_power_of_two() {
            return Err(LogError::invalid_config(format!(
                "sector_size must be a non-zero power of two, got {}",
                self.sector_size
            )));
        }
        if !self.map_block_size.is_power_of_two() || self.map_block_size < self.sector_size {
            return Err(LogError::invalid_config(format!(
                "map_block_size must be a power of two no smaller than sector_size, got {}",
                self.map_block_size
            )));
        }
        if self.sectors_per_block() > MAX_SECTORS_PER_BLOCK {
            return Err(LogError::invalid_config(format!(
                "map_block_size {} holds more than {} sectors",
                self.map_block_size, MAX_SECTORS_PER_BLOCK
            )));
        }
        if !(self.log_roll_fraction > 0.0 && self.log_roll_fraction <= 1.0) {
            return Err(LogError::invalid_config(format!(
                "log_roll_fraction must be in (0, 1], got {}",
                self.log_roll_fraction
            )));
        }
        if self.logmap_roll_threshold == 0 || self.logmap_high_water == 0 {
            return Err(LogError::invalid_config("log map thresholds must be non-zero"));
        }
        if self.max_reservation == Some(0) {
            return Err(LogError::invalid_config("max_reservation must be non-zero"));
        }
        Ok(())
    }

    /// Roll buffer count clamped to the supported range.
    pub fn clamped_roll_buffers(&self) -> usize {
        self.roll_buffers.clamp(MIN_ROLL_BUFFERS, MAX_ROLL_BUFFERS)
    }

    pub fn clamped_io_threads(&self) -> usize {
        self.io_threads.clamp(1, MAX_IO_THREADS)
    }

    pub fn sectors_per_block(&self) -> u64 {
        self.map_block_size / self.sector_size
    }

    /// Reservation ceiling for a log region of `region_size` bytes.
    pub fn max_reservable(&self, region_size: u64) -> u64 {
        match self.max_reservation {
            Some(max) => max.min(region_size),
            None => region_size / 4 * 3,
        }
    }

    pub fn roll_wake_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.roll_wake_interval_ms)
    }
}
