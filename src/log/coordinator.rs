//! Transaction Coordinator
//!
//! Epochs move through three closure states:
//!
//! - open: synchronous and asynchronous operations may join
//! - closed to sync: a commit is draining, async writers still join
//! - closed to all: the last sync participant waits for async writers
//!
//! The last synchronous participant to call `end_sync` performs the commit
//! for everyone in the epoch (group commit). Participants that finish
//! earlier sleep until the epoch sequence number changes; `tid` is not used
//! for that because it does not advance when the unit fails.
//!
//! Async writers are never blocked by a commit in flight: the epoch reopens
//! to them as soon as the deltas are pushed, while new synchronous starters
//! wait for the commit record to land.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;

use serde::Serialize;

use crate::crash_point::{maybe_crash, points};
use crate::observability::{log_event_with_fields, Event, Logger};

use super::delta::{DeltaKind, DeltaPayload, DeltaRange};
use super::errors::{LogError, LogResult};
use super::log_map::LoggedDelta;
use super::record::commit_record_len;
use super::roll::RollEngine;
use super::state::UnitState;
use super::writer::{wait_all, LogWriter};

/// Closed to new synchronous operations.
const CLOSED_SYNC: u8 = 0x01;
/// Closed to new asynchronous operations.
const CLOSED_ASYNC: u8 = 0x02;
/// A forced empty commit has been dispatched for this epoch.
const CLOSED_SYNC_FORCED: u8 = 0x04;

const CLOSED_ALL: u8 = CLOSED_SYNC | CLOSED_ASYNC;

/// How a synchronous operation wants to be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Normal,
    /// An fsync: a commit already in progress satisfies it.
    Fsync,
    /// An fsync that fails fast instead of waiting for a commit that
    /// cannot include the caller's writes.
    FsyncDontPend,
}

/// Outcome of `begin_sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAdmission {
    /// The caller is in the epoch and must call `end_sync`.
    Admitted,
    /// A commit that completed while waiting covered the request. The
    /// caller must not call `end_sync`.
    Covered,
}

/// Where an asynchronous operation ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncOrigin {
    Normal,
    /// Memory-reclaim path; never runs a back-pressure commit.
    Reclaim,
}

/// Per-caller transaction bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionContext {
    /// Bytes declared since the last `begin_async`.
    pub deltas_size: u64,
    /// Whether anything was declared since the last `begin_async`.
    pub any_deltas: bool,
    /// Epoch of the caller's last asynchronous operation that declared
    /// something.
    pub last_async_tid: Option<u64>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
struct CoordState {
    tid: u64,
    commit_tid: u64,
    closed: u8,
    seq: u64,
    active: usize,
    activesync: usize,
    /// Sync starters waiting for the next epoch.
    wantin: usize,
    reserved: u64,
    /// Reservations of the waiting sync starters.
    reserved_pending: u64,
    max_reservable: u64,
    forced_tasks: usize,
    committers: usize,
    max_committers: usize,
}

impl CoordState {
    fn closed_to(&self, flags: u8) -> bool {
        self.closed & flags == flags
    }

    /// The caller's last async epoch has already been committed.
    fn already_committed(&self, ctx: &TransactionContext) -> bool {
        match ctx.last_async_tid {
            Some(tid) => tid != self.tid && tid != self.commit_tid,
            None => false,
        }
    }

    /// Reserved bytes past three quarters of the ceiling.
    fn log_needs_commit(&self) -> bool {
        self.reserved > self.max_reservable / 4 * 3
    }
}

/// Point-in-time view of the coordinator counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    pub tid: u64,
    pub commit_tid: u64,
    pub seq: u64,
    pub active: usize,
    pub activesync: usize,
    pub wantin: usize,
    pub reserved: u64,
    pub reserved_pending: u64,
    pub max_reservable: u64,
    pub closed_sync: bool,
    pub closed_async: bool,
    pub sync_forced: bool,
    pub forced_tasks: usize,
    pub committers: usize,
    /// Most threads ever inside the commit critical section at once.
    pub max_committers: usize,
}

/// Admission control and group commit for one log unit.
#[derive(Debug)]
pub struct TransactionCoordinator {
    state: Arc<UnitState>,
    roll: Arc<RollEngine>,
    inner: Mutex<CoordState>,
    /// Signalled when an epoch reopens to async operations.
    cv_next: Condvar,
    /// Signalled when a commit completes.
    cv_commit: Condvar,
    /// Signalled when the last async operation of a closing epoch ends.
    cv_eot: Condvar,
    /// Signalled when a forced commit task finishes.
    cv_tasks: Condvar,
}

impl TransactionCoordinator {
    pub fn new(state: Arc<UnitState>, roll: Arc<RollEngine>) -> Arc<Self> {
        let (tid, max_reservable) = {
            let writer = state.writer();
            (
                writer.header().next_tid,
                state.config.max_reservable(writer.region_size()),
            )
        };
        let coordinator = Arc::new(Self {
            inner: Mutex::new(CoordState {
                tid,
                commit_tid: tid,
                closed: 0,
                seq: 0,
                active: 0,
                activesync: 0,
                wantin: 0,
                reserved: 0,
                reserved_pending: 0,
                max_reservable,
                forced_tasks: 0,
                committers: 0,
                max_committers: 0,
            }),
            cv_next: Condvar::new(),
            cv_commit: Condvar::new(),
            cv_eot: Condvar::new(),
            cv_tasks: Condvar::new(),
            state,
            roll,
        });

        let weak: Weak<Self> = Arc::downgrade(&coordinator);
        coordinator.state.on_error(move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.wake_all();
            }
        });
        coordinator
    }

    fn lock(&self) -> MutexGuard<'_, CoordState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, cv: &Condvar, guard: MutexGuard<'a, CoordState>) -> MutexGuard<'a, CoordState> {
        cv.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep until the epoch sequence number changes.
    fn wait_commit<'a>(&self, mut st: MutexGuard<'a, CoordState>) -> MutexGuard<'a, CoordState> {
        let seq = st.seq;
        while st.seq == seq {
            st = self.wait(&self.cv_commit, st);
        }
        st
    }

    /// Wake every waiter so it re-checks the error state.
    fn wake_all(&self) {
        drop(self.lock());
        self.cv_next.notify_all();
        self.cv_commit.notify_all();
        self.cv_eot.notify_all();
        self.cv_tasks.notify_all();
    }

    /// Join an epoch as a synchronous operation reserving `size` log bytes.
    pub fn begin_sync(
        self: &Arc<Self>,
        ctx: &mut TransactionContext,
        mode: SyncMode,
        size: u64,
    ) -> LogResult<SyncAdmission> {
        self.state.check()?;
        self.admit_sync(ctx, mode, size, true)
    }

    fn admit_sync(
        self: &Arc<Self>,
        ctx: &TransactionContext,
        mode: SyncMode,
        size: u64,
        check_error: bool,
    ) -> LogResult<SyncAdmission> {
        let mut st = self.lock();
        if size > st.max_reservable {
            return Err(LogError::log_full(size, st.max_reservable));
        }

        if mode != SyncMode::Normal {
            let dont_pend = mode == SyncMode::FsyncDontPend;
            if dont_pend && st.already_committed(ctx) {
                return Err(LogError::commit_pending(
                    "last asynchronous epoch is already committed",
                ));
            }
            if st.closed_to(CLOSED_ALL) || st.activesync > 0 {
                drop(self.wait_commit(st));
                return Ok(SyncAdmission::Covered);
            }
            if st.closed_to(CLOSED_SYNC) {
                // A commit record is being written; wait for it and retest.
                st = self.wait_commit(st);
                if dont_pend && st.already_committed(ctx) {
                    return Err(LogError::commit_pending(
                        "last asynchronous epoch committed while waiting",
                    ));
                }
            }
        }

        loop {
            if check_error {
                self.state.check()?;
            }
            self.state.log_map.mark_referenced();

            if st.closed_to(CLOSED_SYNC) {
                if size == 0 && (st.closed_to(CLOSED_ALL) || st.activesync > 0) {
                    drop(self.wait_commit(st));
                    return Ok(SyncAdmission::Covered);
                }
                if size + st.reserved_pending + st.reserved > st.max_reservable {
                    st = self.wait(&self.cv_commit, st);
                    continue;
                }
                st.wantin += 1;
                st.reserved_pending += size;
                drop(self.wait_commit(st));
                return Ok(SyncAdmission::Admitted);
            }

            if size > 0 && st.reserved > 0 && size + st.reserved > st.max_reservable {
                if st.activesync == 0 {
                    // Nobody will release the reservation; commit an empty
                    // epoch to do it.
                    drop(st);
                    self.issue_sync()?;
                    st = self.lock();
                    continue;
                }
                st = self.wait(&self.cv_commit, st);
                continue;
            }

            st.active += 1;
            st.activesync += 1;
            st.reserved += size;
            return Ok(SyncAdmission::Admitted);
        }
    }

    /// Join the current epoch as an asynchronous operation. With
    /// `try_mode` the call returns `WouldBlock` instead of waiting.
    pub fn begin_async(
        self: &Arc<Self>,
        ctx: &mut TransactionContext,
        size: u64,
        try_mode: bool,
    ) -> LogResult<()> {
        ctx.deltas_size = 0;
        ctx.any_deltas = false;

        let mut st = self.lock();
        if size > st.max_reservable {
            return Err(LogError::log_full(size, st.max_reservable));
        }
        loop {
            self.state.check()?;
            self.state.log_map.mark_referenced();

            if st.closed_to(CLOSED_ASYNC) {
                if try_mode {
                    return Err(self.try_failed("epoch closed to async operations"));
                }
                st = self.wait(&self.cv_next, st);
                continue;
            }

            if size + st.reserved + st.reserved_pending > st.max_reservable {
                // One forced empty commit per epoch; the latch clears when
                // the epoch reopens.
                if st.activesync == 0 && st.closed & CLOSED_SYNC_FORCED == 0 {
                    st.closed |= CLOSED_SYNC_FORCED;
                    st.forced_tasks += 1;
                    drop(st);
                    self.dispatch_forced_commit();
                    if try_mode {
                        return Err(self.try_failed("log over-reserved"));
                    }
                    st = self.lock();
                    continue;
                }
                if try_mode {
                    return Err(self.try_failed("log over-reserved"));
                }
                st = self.wait(&self.cv_next, st);
                continue;
            }

            st.active += 1;
            st.reserved += size;
            return Ok(());
        }
    }

    fn try_failed(&self, reason: &str) -> LogError {
        self.state.metrics.increment_try_fail();
        LogError::would_block(reason)
    }

    /// Record a change for the caller's epoch.
    pub fn declare_delta(
        &self,
        ctx: &mut TransactionContext,
        range: DeltaRange,
        kind: DeltaKind,
        payload: DeltaPayload,
    ) -> LogResult<()> {
        self.state.check()?;
        self.state.delta_map.add(range, kind, payload)?;
        self.state.metrics.record_declared(kind);
        self.state.log_map.mark_referenced();
        ctx.deltas_size += range.len;
        ctx.any_deltas = true;
        Ok(())
    }

    /// Drop pending changes overlapping `range`. The range reads as
    /// canceled until the next commit record is on the log.
    pub fn cancel_delta(&self, range: DeltaRange) -> LogResult<()> {
        self.state.check()?;
        if range.len == 0 {
            return Err(LogError::invalid_delta(format!(
                "zero-length cancel at {}",
                range
            )));
        }
        range.checked_end()?;
        let removed = self.state.delta_map.remove_overlapping(&range);
        self.state.log_map.park_canceled(range, removed);
        self.state.log_map.mark_referenced();
        Ok(())
    }

    pub fn is_canceled(&self, range: &DeltaRange) -> bool {
        self.state.is_errored() || self.state.log_map.is_canceled(range)
    }

    /// Leave the epoch. The last synchronous participant commits it.
    pub fn end_sync(&self, _ctx: &mut TransactionContext) -> LogResult<()> {
        let mut st = self.lock();
        let tid = st.tid;
        st.activesync = st.activesync.saturating_sub(1);
        st.active = st.active.saturating_sub(1);
        self.state.log_map.mark_referenced();

        if st.activesync > 0 {
            st.closed = CLOSED_SYNC;
            drop(self.wait_commit(st));
            return self.state.check();
        }

        st.closed = CLOSED_ALL;
        while st.active > 0 {
            st = self.wait(&self.cv_eot, st);
        }
        st.committers += 1;
        st.max_committers = st.max_committers.max(st.committers);
        drop(st);

        let result = self.commit_epoch(tid);

        let mut st = self.lock();
        st.active += st.wantin;
        st.reserved += st.reserved_pending;
        st.activesync = st.wantin;
        st.wantin = 0;
        st.reserved_pending = 0;
        st.closed = 0;
        st.commit_tid = st.tid;
        st.seq += 1;
        st.committers -= 1;
        drop(st);
        self.cv_commit.notify_all();

        result?;
        if self.state.log_map.need_commit(self.state.config.logmap_high_water) {
            self.roll.request_roll(false)?;
        }
        self.state.check()
    }

    /// Push the delta map through the log and write the commit record of
    /// `tid`. Reopens the epoch to async operations on every path.
    fn commit_epoch(&self, tid: u64) -> LogResult<()> {
        let mut writer = match self.state.check().and_then(|_| self.reserve_log_space()) {
            Ok(writer) => writer,
            Err(err) => {
                let _ = self.state.delta_map.push_to_log(|_| Ok(()));
                self.advance_epoch(tid);
                self.state.log_map.release_cancel_list();
                return Err(self.state.fail(err));
            }
        };

        let mut epoch_lsn = None;
        let mut bytes = 0u64;
        let pushed = self.state.delta_map.push_to_log(|record| {
            let data = record.payload.resolve(&record.range);
            let lsn = writer.append_delta(tid, record.range, record.kind, data.clone())?;
            let epoch_lsn = *epoch_lsn.get_or_insert(lsn);
            bytes += record.range.len;
            self.state.log_map.insert(LoggedDelta {
                id: record.id,
                lsn,
                epoch_lsn,
                tid,
                range: record.range,
                kind: record.kind,
                data,
            });
            Ok(())
        });

        // Canceled ranges stay visible until the commit record is written.
        self.advance_epoch(tid);

        let result = pushed.and_then(|count| {
            maybe_crash(points::COMMIT_BEFORE_WRITE);
            writer.append_commit(tid, count as u32)?;
            wait_all(writer.issue(), "commit write")?;
            Ok(count)
        });

        match result {
            Ok(count) => {
                self.state.log_map.commit_complete(tid);
                self.state.metrics.record_commit(count, bytes);
                maybe_crash(points::COMMIT_AFTER_WRITE);
                drop(writer);
                let dropped: usize = self
                    .state
                    .log_map
                    .release_cancel_list()
                    .iter()
                    .map(|c| c.records.len())
                    .sum();
                log_event_with_fields(
                    Event::CommitComplete,
                    &[
                        ("bytes", &bytes.to_string()),
                        ("canceled", &dropped.to_string()),
                        ("deltas", &count.to_string()),
                        ("tid", &tid.to_string()),
                    ],
                );
                Ok(())
            }
            Err(err) => {
                drop(writer);
                let err = self.state.fail(err);
                self.state.log_map.release_cancel_list();
                Err(err)
            }
        }
    }

    /// Advance the tid, release the reservation and reopen the epoch to
    /// async operations. The epoch's cancel list is sealed for the commit.
    fn advance_epoch(&self, tid: u64) {
        let mut st = self.lock();
        st.tid = tid + 1;
        self.state.log_map.seal_cancel_list();
        st.reserved = 0;
        st.closed = CLOSED_SYNC;
        drop(st);
        self.cv_next.notify_all();
    }

    /// Lock the writer once it has room for the pending deltas and a
    /// commit record, rolling the log map empty first if needed.
    fn reserve_log_space(&self) -> LogResult<MutexGuard<'_, LogWriter>> {
        let needed = self.state.delta_map.log_bytes() + commit_record_len() as u64;
        let mut rolled = false;
        loop {
            let writer = self.state.writer();
            if writer.free() >= needed {
                return Ok(writer);
            }
            if rolled || needed > writer.region_size() {
                return Err(LogError::log_full(needed, writer.free()));
            }
            drop(writer);
            self.roll.request_roll(true)?;
            rolled = true;
        }
    }

    /// Leave an asynchronous operation declared with `size` bytes.
    pub fn end_async(
        self: &Arc<Self>,
        ctx: &mut TransactionContext,
        origin: AsyncOrigin,
        size: u64,
    ) -> LogResult<()> {
        let mut st = self.lock();
        if size > ctx.deltas_size {
            st.reserved = st.reserved.saturating_sub(size - ctx.deltas_size);
        }
        if ctx.any_deltas {
            ctx.last_async_tid = Some(st.tid);
        }
        self.state.log_map.mark_referenced();

        st.active = st.active.saturating_sub(1);
        let wakeup = st.active == 0 && st.closed_to(CLOSED_ALL);
        let quiet = st.activesync == 0 && !st.closed_to(CLOSED_SYNC);
        let log_busy = st.log_needs_commit();
        drop(st);
        if wakeup {
            self.cv_eot.notify_all();
        }

        let config = &self.state.config;
        if quiet
            && origin != AsyncOrigin::Reclaim
            && (self.state.delta_map.need_commit(config.deltamap_commit_threshold)
                || self.state.log_map.need_commit(config.logmap_commit_threshold)
                || log_busy)
        {
            self.issue_sync()?;
        }
        if self.state.log_map.need_commit(config.logmap_async_threshold) {
            self.roll.request_roll(false)?;
        }
        self.state.check()
    }

    /// Commit an empty epoch on the calling thread.
    pub fn issue_sync(self: &Arc<Self>) -> LogResult<()> {
        let mut ctx = TransactionContext::new();
        match self.admit_sync(&ctx, SyncMode::Normal, 0, false)? {
            SyncAdmission::Covered => Ok(()),
            SyncAdmission::Admitted => self.end_sync(&mut ctx),
        }
    }

    fn dispatch_forced_commit(self: &Arc<Self>) {
        self.state.metrics.increment_forced_commits();
        log_event_with_fields(Event::ForcedCommitDispatched, &[]);

        let coordinator = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("samwal-forced-commit".to_string())
            .spawn(move || coordinator.run_forced_commit());
        if let Err(e) = spawned {
            Logger::warn("FORCED_COMMIT_INLINE", &[("reason", &e.to_string())]);
            self.run_forced_commit();
        }
    }

    fn run_forced_commit(self: &Arc<Self>) {
        if let Err(err) = self.issue_sync() {
            Logger::warn("FORCED_COMMIT_FAILED", &[("error", &err.to_string())]);
        }

        let mut st = self.lock();
        st.forced_tasks -= 1;
        drop(st);
        self.cv_tasks.notify_all();
    }

    /// Block until every dispatched forced commit has finished.
    pub fn wait_forced_commits(&self) {
        let mut st = self.lock();
        while st.forced_tasks > 0 {
            st = self.wait(&self.cv_tasks, st);
        }
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let st = self.lock();
        CoordinatorSnapshot {
            tid: st.tid,
            commit_tid: st.commit_tid,
            seq: st.seq,
            active: st.active,
            activesync: st.activesync,
            wantin: st.wantin,
            reserved: st.reserved,
            reserved_pending: st.reserved_pending,
            max_reservable: st.max_reservable,
            closed_sync: st.closed & CLOSED_SYNC != 0,
            closed_async: st.closed & CLOSED_ASYNC != 0,
            sync_forced: st.closed & CLOSED_SYNC_FORCED != 0,
            forced_tasks: st.forced_tasks,
            committers: st.committers,
            max_committers: st.max_committers,
        }
    }
}
