//! Mount-time roll forward
//!
//! The log is scanned from the header's head LSN and grouped into epochs.
//! An epoch is complete when its commit record is intact and counts exactly
//! the delta records read for it. Complete epochs are applied to the master
//! devices in log order; a trailing incomplete epoch is discarded. Applying
//! an epoch twice leaves the masters as applying it once.

use std::sync::Arc;

use serde::Serialize;

use crate::crash_point::{maybe_crash, points};
use crate::device::{BlockDevice, MasterSet};

use super::delta::{DeltaData, DeltaKind, DeltaRange};
use super::errors::{LogError, LogResult};
use super::reader::{LogReader, ScanStop};
use super::record::{LogHeader, RecordBody};

/// One delta as found on the log.
#[derive(Debug, Clone)]
pub struct ScannedDelta {
    pub lsn: u64,
    pub range: DeltaRange,
    pub kind: DeltaKind,
    pub data: DeltaData,
}

/// A committed epoch found on the log.
#[derive(Debug, Clone)]
pub struct Epoch {
    pub tid: u64,
    pub start_lsn: u64,
    pub commit_lsn: u64,
    pub deltas: Vec<ScannedDelta>,
}

/// Result of grouping the log into epochs.
#[derive(Debug, Clone)]
pub struct LogScan {
    pub epochs: Vec<Epoch>,
    /// LSN just past the last complete epoch.
    pub tail: u64,
    /// Delta records of a trailing incomplete epoch.
    pub discarded: usize,
    /// Highest transaction id seen, complete or not.
    pub max_tid: u64,
    pub stop: Option<ScanStop>,
}

/// Summary of a recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub epochs_replayed: usize,
    pub deltas_replayed: usize,
    pub deltas_discarded: usize,
    pub bytes_replayed: u64,
    pub start_lsn: u64,
    pub end_lsn: u64,
    pub next_tid: u64,
}

/// Group the records from the head into epochs.
pub fn scan_log(device: &Arc<dyn BlockDevice>, header: &LogHeader) -> LogResult<LogScan> {
    let mut reader = LogReader::new(device.clone(), header);
    let mut epochs = Vec::new();
    let mut tail = header.head_lsn;
    let mut floor_tid = 0u64;
    let mut max_tid = 0u64;
    let mut open: Option<Epoch> = None;

    loop {
        let lsn = reader.position();
        let record = match reader.read_next()? {
            Some(record) => record,
            None => break,
        };
        if record.tid <= floor_tid {
            break;
        }
        if let Some(ref epoch) = open {
            if epoch.tid != record.tid {
                break;
            }
        }
        max_tid = max_tid.max(record.tid);

        match record.body {
            RecordBody::Delta { range, kind, data } => {
                let epoch = open.get_or_insert_with(|| Epoch {
                    tid: record.tid,
                    start_lsn: lsn,
                    commit_lsn: 0,
                    deltas: Vec::new(),
                });
                epoch.deltas.push(ScannedDelta {
                    lsn,
                    range,
                    kind,
                    data,
                });
            }
            RecordBody::Commit { delta_count } => {
                let mut epoch = open.take().unwrap_or_else(|| Epoch {
                    tid: record.tid,
                    start_lsn: lsn,
                    commit_lsn: 0,
                    deltas: Vec::new(),
                });
                if epoch.deltas.len() != delta_count as usize {
                    open = Some(epoch);
                    break;
                }
                epoch.commit_lsn = lsn;
                floor_tid = epoch.tid;
                tail = reader.position();
                epochs.push(epoch);
            }
        }
    }

    Ok(LogScan {
        epochs,
        tail,
        discarded: open.map(|e| e.deltas.len()).unwrap_or(0),
        max_tid,
        stop: reader.stop_reason().cloned(),
    })
}

/// Apply one delta to its master device.
pub fn apply_delta(masters: &MasterSet, delta: &ScannedDelta) -> LogResult<()> {
    let dev = masters
        .get(delta.range.ordinal)
        .map_err(|e| LogError::io_failed(format!("replay of {}", delta.range), e))?;
    let bytes = match &delta.data {
        DeltaData::Bytes(bytes) => bytes.to_vec(),
        DeltaData::Zeroes => vec![0u8; delta.range.len as usize],
    };
    dev.write_at(delta.range.offset, &bytes)
        .map_err(|e| LogError::io_failed(format!("replay of {}", delta.range), e))
}

/// Replay every complete epoch onto the masters and flush them.
///
/// Returns the report and the scan, whose `tail` is where new records go.
pub fn replay(
    device: &Arc<dyn BlockDevice>,
    header: &LogHeader,
    masters: &MasterSet,
) -> LogResult<(RecoveryReport, LogScan)> {
    let scan = scan_log(device, header)?;

    let mut report = RecoveryReport {
        start_lsn: header.head_lsn,
        end_lsn: scan.tail,
        deltas_discarded: scan.discarded,
        next_tid: header.next_tid.max(scan.max_tid + 1),
        ..RecoveryReport::default()
    };

    for epoch in &scan.epochs {
        for delta in &epoch.deltas {
            apply_delta(masters, delta)?;
            report.deltas_replayed += 1;
            report.bytes_replayed += delta.range.len;
        }
        report.epochs_replayed += 1;
    }

    if report.deltas_replayed > 0 {
        masters
            .flush_all()
            .map_err(|e| LogError::io_failed("master flush after replay failed", e))?;
    }
    maybe_crash(points::RECOVERY_AFTER_REPLAY);

    Ok((report, scan))
}
