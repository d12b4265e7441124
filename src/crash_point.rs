//! Crash point injection for durability tests
//!
//! When `SAMWAL_CRASH_POINT` names a point, the process aborts the moment
//! execution reaches it: no cleanup, no unwinding, no buffered writes
//! flushed. Subprocess tests use this to stop the commit and roll paths at
//! exact places and then mount the devices again.
//!
//! ```bash
//! SAMWAL_CRASH_POINT=commit_after_write samwal exercise --config log.json
//! ```

use std::sync::OnceLock;

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

#[inline]
fn get_crash_point() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var("SAMWAL_CRASH_POINT").ok())
        .as_deref()
}

/// Whether `SAMWAL_CRASH_POINT` equals `name`.
#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    get_crash_point().map(|p| p == name).unwrap_or(false)
}

/// Abort the process if `name` is the configured crash point.
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] Triggering crash at point: {}", name);
        std::process::abort();
    }
}

/// All defined crash point names
pub mod points {
    // Commit path
    /// Deltas pushed, commit record not yet issued.
    pub const COMMIT_BEFORE_WRITE: &str = "commit_before_write";
    /// Commit record on the log, canceled deltas not yet released.
    pub const COMMIT_AFTER_WRITE: &str = "commit_after_write";

    // Roll engine
    pub const ROLL_BEFORE_WRITE: &str = "roll_before_write";
    pub const ROLL_AFTER_WRITE: &str = "roll_after_write";
    /// Masters written and flushed, head not yet moved.
    pub const ROLL_BEFORE_TRIM: &str = "roll_before_trim";

    // Recovery
    pub const RECOVERY_AFTER_REPLAY: &str = "recovery_after_replay";

    pub fn all() -> &'static [&'static str] {
        &[
            COMMIT_BEFORE_WRITE,
            COMMIT_AFTER_WRITE,
            ROLL_BEFORE_WRITE,
            ROLL_AFTER_WRITE,
            ROLL_BEFORE_TRIM,
            RECOVERY_AFTER_REPLAY,
        ]
    }
}
