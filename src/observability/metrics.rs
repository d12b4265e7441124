//! Metrics registry for a log unit
//!
//! - Counters only, monotonic
//! - Reset only when the unit is mounted
//! - Thread-safe, lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::log::DeltaKind;

const KINDS: usize = DeltaKind::ALL.len();

/// Operational counters of one log unit.
///
/// All counters use `Relaxed` ordering; values are exact once the unit is
/// quiescent.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Read-through calls
    log_reads: AtomicU64,
    /// Read-through calls that had to read the master
    master_reads: AtomicU64,
    /// Master reads issued by the roll engine
    roll_reads: AtomicU64,
    /// Master writes issued by the roll engine
    roll_writes: AtomicU64,
    roll_passes: AtomicU64,
    deltas_rolled: AtomicU64,
    bytes_rolled: AtomicU64,
    /// Roll buffers satisfied by a cached roll buffer
    crb_hits: AtomicU64,
    /// Commit records written
    commits: AtomicU64,
    /// Empty commits started to release reservation or relieve pressure
    forced_commits: AtomicU64,
    /// Commits carrying no deltas
    empty_commits: AtomicU64,
    /// Log bytes written by commits, deltas included
    commit_bytes: AtomicU64,
    /// Try-mode async admissions refused
    try_fail: AtomicU64,
    /// Head trims
    log_trims: AtomicU64,
    declared_by_kind: [AtomicU64; KINDS],
    rolled_by_kind: [AtomicU64; KINDS],
}

fn kind_slot(kind: DeltaKind) -> usize {
    DeltaKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(0)
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Read-through

    pub fn increment_log_reads(&self) {
        self.log_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_master_reads(&self) {
        self.master_reads.fetch_add(1, Ordering::Relaxed);
    }

    // Roll engine

    pub fn add_roll_reads(&self, n: u64) {
        self.roll_reads.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_roll_writes(&self, n: u64) {
        self.roll_writes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_roll_passes(&self) {
        self.roll_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_crb_hits(&self) {
        self.crb_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one rolled delta of `kind` covering `bytes`.
    pub fn record_rolled(&self, kind: DeltaKind, bytes: u64) {
        self.deltas_rolled.fetch_add(1, Ordering::Relaxed);
        self.bytes_rolled.fetch_add(bytes, Ordering::Relaxed);
        self.rolled_by_kind[kind_slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_log_trims(&self) {
        self.log_trims.fetch_add(1, Ordering::Relaxed);
    }

    // Commit path

    pub fn record_declared(&self, kind: DeltaKind) {
        self.declared_by_kind[kind_slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    /// Count one commit record that closed `deltas` deltas using `bytes` of log.
    pub fn record_commit(&self, deltas: usize, bytes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_bytes.fetch_add(bytes, Ordering::Relaxed);
        if deltas == 0 {
            self.empty_commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_forced_commits(&self) {
        self.forced_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_try_fail(&self) {
        self.try_fail.fetch_add(1, Ordering::Relaxed);
    }

    /// All counters as one JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let by_kind = |counters: &[AtomicU64; KINDS]| -> Vec<KindCount> {
            DeltaKind::ALL
                .iter()
                .zip(counters.iter())
                .map(|(kind, c)| KindCount {
                    kind: kind.name(),
                    count: c.load(Ordering::Relaxed),
                })
                .filter(|kc| kc.count > 0)
                .collect()
        };

        MetricsSnapshot {
            log_reads: self.log_reads.load(Ordering::Relaxed),
            master_reads: self.master_reads.load(Ordering::Relaxed),
            roll_reads: self.roll_reads.load(Ordering::Relaxed),
            roll_writes: self.roll_writes.load(Ordering::Relaxed),
            roll_passes: self.roll_passes.load(Ordering::Relaxed),
            deltas_rolled: self.deltas_rolled.load(Ordering::Relaxed),
            bytes_rolled: self.bytes_rolled.load(Ordering::Relaxed),
            crb_hits: self.crb_hits.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            forced_commits: self.forced_commits.load(Ordering::Relaxed),
            empty_commits: self.empty_commits.load(Ordering::Relaxed),
            commit_bytes: self.commit_bytes.load(Ordering::Relaxed),
            try_fail: self.try_fail.load(Ordering::Relaxed),
            log_trims: self.log_trims.load(Ordering::Relaxed),
            declared_by_kind: by_kind(&self.declared_by_kind),
            rolled_by_kind: by_kind(&self.rolled_by_kind),
        }
    }
}

/// Per-kind delta count; only kinds seen at least once are listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindCount {
    pub kind: &'static str,
    pub count: u64,
}

/// A point-in-time copy of every counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub log_reads: u64,
    pub master_reads: u64,
    pub roll_reads: u64,
    pub roll_writes: u64,
    pub roll_passes: u64,
    pub deltas_rolled: u64,
    pub bytes_rolled: u64,
    pub crb_hits: u64,
    pub commits: u64,
    pub forced_commits: u64,
    pub empty_commits: u64,
    pub commit_bytes: u64,
    pub try_fail: u64,
    pub log_trims: u64,
    pub declared_by_kind: Vec<KindCount>,
    pub rolled_by_kind: Vec<KindCount>,
}

impl MetricsSnapshot {
    /// Declared count for one kind.
    pub fn declared(&self, kind: DeltaKind) -> u64 {
        Self::lookup(&self.declared_by_kind, kind)
    }

    /// Rolled count for one kind.
    pub fn rolled(&self, kind: DeltaKind) -> u64 {
        Self::lookup(&self.rolled_by_kind, kind)
    }

    fn lookup(counts: &[KindCount], kind: DeltaKind) -> u64 {
        counts
            .iter()
            .find(|kc| kc.kind == kind.name())
            .map(|kc| kc.count)
            .unwrap_or(0)
    }
}
