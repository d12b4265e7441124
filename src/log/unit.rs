//! Log unit
//!
//! A `LogUnit` is one mounted log device together with the master devices
//! it protects. Mounting replays every committed epoch still on the log,
//! then starts the roll engine. Every transactional entry point goes
//! through the coordinator; `read` overlays the committed, not yet rolled
//! deltas on the master contents.

use std::sync::Arc;

use crate::device::{BlockDevice, IoEngine, MasterSet};
use crate::observability::{log_event, log_event_with_fields, Event, MetricsRegistry, ObservationScope};

use super::config::LogConfig;
use super::coordinator::{
    AsyncOrigin, CoordinatorSnapshot, SyncAdmission, SyncMode, TransactionContext,
    TransactionCoordinator,
};
use super::delta::{DeltaKind, DeltaPayload, DeltaRange};
use super::errors::{LogError, LogResult};
use super::record::{LogHeader, HEADER_SIZE};
use super::recovery::{replay, RecoveryReport};
use super::roll::RollEngine;
use super::roll_buffer::{covers, merge_intervals, CachedRollBuffer};
use super::state::UnitState;
use super::writer::LogWriter;

/// A mounted log.
#[derive(Debug)]
pub struct LogUnit {
    state: Arc<UnitState>,
    roll: Arc<RollEngine>,
    coordinator: Arc<TransactionCoordinator>,
    recovery: RecoveryReport,
    unmounted: bool,
}

impl LogUnit {
    /// Write a fresh header to `log`, discarding whatever it held.
    pub fn format(log: Arc<dyn BlockDevice>, log_size: u64, config: &LogConfig) -> LogResult<LogHeader> {
        config.validate()?;
        let header = LogHeader::new(log_size)?;

        log.write_at(0, &header.encode())
            .and_then(|_| log.write_at(header.region_offset, &[0u8; HEADER_SIZE as usize]))
            .and_then(|_| log.flush())
            .map_err(|e| LogError::io_failed("log format failed", e))?;

        log_event_with_fields(
            Event::LogFormatted,
            &[
                ("log_id", &header.log_id.to_string()),
                ("region_size", &header.region_size.to_string()),
            ],
        );
        Ok(header)
    }

    /// Replay the log onto `masters` and open it for transactions.
    pub fn mount(log: Arc<dyn BlockDevice>, masters: MasterSet, config: LogConfig) -> LogResult<LogUnit> {
        let scope = ObservationScope::new("MOUNT");
        match Self::mount_inner(log, masters, config) {
            Ok(unit) => {
                scope.complete_with_fields(&[
                    ("epochs_replayed", &unit.recovery.epochs_replayed.to_string()),
                    ("next_tid", &unit.recovery.next_tid.to_string()),
                ]);
                Ok(unit)
            }
            Err(err) => {
                scope.fail(&err);
                Err(err)
            }
        }
    }

    fn mount_inner(log: Arc<dyn BlockDevice>, masters: MasterSet, config: LogConfig) -> LogResult<LogUnit> {
        config.validate()?;
        if masters.is_empty() {
            return Err(LogError::invalid_config("at least one master device is required"));
        }

        let mut raw = vec![0u8; HEADER_SIZE as usize];
        log.read_at(0, &mut raw)
            .map_err(|e| LogError::io_failed("log header read failed", e))?;
        let mut header = LogHeader::decode(&raw)?;
        if header.region_offset + header.region_size > log.len() {
            return Err(LogError::corruption(format!(
                "log region ends at {} but the device holds {} bytes",
                header.region_offset + header.region_size,
                log.len()
            )));
        }

        let io = Arc::new(IoEngine::new(config.clamped_io_threads()));

        log_event_with_fields(
            Event::RecoveryStart,
            &[("head_lsn", &header.head_lsn.to_string())],
        );
        let (report, scan) = replay(&log, &header, &masters)?;
        log_event_with_fields(
            Event::RecoveryComplete,
            &[
                ("deltas_discarded", &report.deltas_discarded.to_string()),
                ("deltas_replayed", &report.deltas_replayed.to_string()),
                ("end_lsn", &report.end_lsn.to_string()),
                ("epochs_replayed", &report.epochs_replayed.to_string()),
            ],
        );

        // Everything up to the scan tail is on the masters now.
        header.head_lsn = scan.tail;
        header.next_tid = report.next_tid;
        let mut writer = LogWriter::new(log, io.clone(), header, scan.tail);
        writer.write_header()?;

        let no_roll = config.no_roll;
        let state = Arc::new(UnitState::new(config, writer, masters, io));
        let roll = Arc::new(RollEngine::new(state.clone()));
        let coordinator = TransactionCoordinator::new(state.clone(), roll.clone());
        let weak_roll = Arc::downgrade(&roll);
        state.on_error(move || {
            if let Some(roll) = weak_roll.upgrade() {
                roll.wake();
            }
        });
        if !no_roll {
            roll.start()?;
        }

        log_event_with_fields(
            Event::LogMounted,
            &[
                ("head_lsn", &scan.tail.to_string()),
                ("next_tid", &report.next_tid.to_string()),
            ],
        );
        Ok(LogUnit {
            state,
            roll,
            coordinator,
            recovery: report,
            unmounted: false,
        })
    }

    // Transactions

    pub fn begin_sync(&self, ctx: &mut TransactionContext, mode: SyncMode, size: u64) -> LogResult<SyncAdmission> {
        self.coordinator.begin_sync(ctx, mode, size)
    }

    pub fn end_sync(&self, ctx: &mut TransactionContext) -> LogResult<()> {
        self.coordinator.end_sync(ctx)
    }

    pub fn begin_async(&self, ctx: &mut TransactionContext, size: u64, try_mode: bool) -> LogResult<()> {
        self.coordinator.begin_async(ctx, size, try_mode)
    }

    pub fn end_async(&self, ctx: &mut TransactionContext, origin: AsyncOrigin, size: u64) -> LogResult<()> {
        self.coordinator.end_async(ctx, origin, size)
    }

    pub fn declare_delta(
        &self,
        ctx: &mut TransactionContext,
        range: DeltaRange,
        kind: DeltaKind,
        payload: DeltaPayload,
    ) -> LogResult<()> {
        self.masters_hold(&range)?;
        self.coordinator.declare_delta(ctx, range, kind, payload)
    }

    pub fn cancel_delta(&self, range: DeltaRange) -> LogResult<()> {
        self.coordinator.cancel_delta(range)
    }

    pub fn is_canceled(&self, range: DeltaRange) -> bool {
        self.coordinator.is_canceled(&range)
    }

    fn masters_hold(&self, range: &DeltaRange) -> LogResult<()> {
        self.state
            .masters
            .get(range.ordinal)
            .map(|_| ())
            .map_err(|_| LogError::invalid_delta(format!("no master device for {}", range)))
    }

    // Cached roll buffers

    /// Publish `image` as the current contents of one map block. The roll
    /// engine writes from it instead of reading the master.
    pub fn register_crb(&self, ordinal: u8, block_offset: u64, image: Vec<u8>) -> LogResult<Arc<CachedRollBuffer>> {
        self.state.check()?;
        let block_size = self.state.config.map_block_size;
        if block_offset % block_size != 0 || image.len() as u64 != block_size {
            return Err(LogError::invalid_delta(format!(
                "cached block at {}:{} must be {} aligned bytes, got {}",
                ordinal,
                block_offset,
                block_size,
                image.len()
            )));
        }
        self.masters_hold(&DeltaRange::new(ordinal, block_offset, block_size))?;

        let crb = Arc::new(CachedRollBuffer::new(
            ordinal,
            block_offset,
            Arc::from(image),
            self.state.delta_map.last_id(),
        ));
        self.state.log_map.register_crb(crb.clone());
        Ok(crb)
    }

    pub fn release_crb(&self, ordinal: u8, block_offset: u64) {
        self.state.log_map.release_crb(ordinal, block_offset);
    }

    // Reads

    /// Committed contents of `len` bytes at `offset` of master `ordinal`.
    pub fn read(&self, ordinal: u8, offset: u64, len: usize) -> LogResult<Vec<u8>> {
        self.state.check()?;
        let range = DeltaRange::new(ordinal, offset, len as u64);
        range.checked_end()?;
        let dev = self
            .state
            .masters
            .get(ordinal)
            .map_err(|e| LogError::io_failed("read-through", e))?;
        self.state.metrics.increment_log_reads();
        self.state.log_map.mark_referenced();

        let guard = self.state.log_map.begin_read(&range);
        let intervals = merge_intervals(
            guard
                .deltas()
                .iter()
                .filter_map(|d| d.range.clip(offset, range.end()))
                .map(|part| (part.offset, part.end()))
                .collect(),
        );

        let mut out = if len > 0 && covers(&intervals, offset, range.end()) {
            vec![0u8; len]
        } else {
            self.state.metrics.increment_master_reads();
            self.state
                .io
                .submit_read(dev, offset, len)
                .wait()
                .map_err(|e| LogError::io_failed(format!("read-through of {}", range), e))?
        };
        out.resize(len, 0);

        for delta in guard.deltas() {
            if let Some(part) = delta.range.clip(offset, range.end()) {
                let start = (part.offset - offset) as usize;
                let dst = &mut out[start..start + part.len as usize];
                delta.data.copy_into(&delta.range, &part, dst);
            }
        }
        Ok(out)
    }

    // Roll engine and error state

    pub fn request_roll(&self, force: bool) -> LogResult<()> {
        self.state.check()?;
        self.roll.request_roll(force)
    }

    /// Put the unit into the error state; every later operation fails.
    pub fn set_error(&self, reason: &str) {
        self.state.set_error(reason);
    }

    pub fn is_errored(&self) -> bool {
        self.state.is_errored()
    }

    pub fn coordinator_snapshot(&self) -> CoordinatorSnapshot {
        self.coordinator.snapshot()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.state.metrics
    }

    /// What mount-time recovery replayed.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn header(&self) -> LogHeader {
        self.state.writer().header().clone()
    }

    /// Commit what is pending, roll everything, trim the log and stop.
    pub fn unmount(mut self) -> LogResult<()> {
        let scope = ObservationScope::new("UNMOUNT");
        match self.shutdown() {
            Ok(()) => {
                scope.complete();
                Ok(())
            }
            Err(err) => {
                scope.fail(&err);
                Err(err)
            }
        }
    }

    fn shutdown(&mut self) -> LogResult<()> {
        if self.unmounted {
            return Err(LogError::shut_down());
        }
        self.unmounted = true;

        self.coordinator.wait_forced_commits();
        let drained = self.state.check().and_then(|_| {
            if self.state.delta_map.has_pending() {
                self.coordinator.issue_sync()?;
            }
            self.coordinator.wait_forced_commits();
            Ok(())
        });

        self.roll.stop();
        let result = drained
            .and_then(|_| self.roll.roll_until_drained())
            .and_then(|_| self.state.writer().write_header());

        match &result {
            Ok(()) => log_event(Event::LogUnmounted),
            Err(err) => log_event_with_fields(
                Event::LogUnmounted,
                &[("error", &err.to_string())],
            ),
        }
        result
    }
}

impl Drop for LogUnit {
    fn drop(&mut self) {
        if !self.unmounted {
            self.coordinator.wait_forced_commits();
            self.roll.stop();
        }
    }
}
