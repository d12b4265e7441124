//! Roll engine
//!
//! One background thread per unit moves committed deltas from the log map to
//! their master locations and then trims the log head. A pass runs in two
//! stages:
//!
//! 1. Read: claim up to `roll_buffers` blocks in ascending order. A block
//!    backed by a current cached image needs no I/O; a block whose touched
//!    sectors are only partly overwritten gets an asynchronous master read.
//! 2. Write: wait for the reads, overlay the deltas, sort by block and issue
//!    one write per run of touched sectors.
//!
//! A failed read or write puts the unit in the error state and leaves the
//! log map entries of the pass in place.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::crash_point::{maybe_crash, points};
use crate::device::IoCompletion;
use crate::observability::{log_event, log_event_with_fields, Event};

use super::errors::{LogError, LogResult};
use super::log_map::{BlockKey, Claim};
use super::roll_buffer::{RollBuffer, RollBufferPool};
use super::state::UnitState;
use super::writer::wait_all;

/// How long the first claim of a pass waits for a reader before retrying.
const READER_WAIT: Duration = Duration::from_millis(50);

/// Why the roll thread woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// A caller waits for the log map to drain.
    Forced(u64),
    /// A caller asked for a pass without waiting.
    Requested,
    /// The log map holds more than `logmap_roll_threshold` deltas.
    Pressure,
    /// Nothing referenced the unit since the last check.
    Idle,
    /// The log is nearly full.
    LogFull,
}

#[derive(Debug, Default)]
struct Control {
    running: bool,
    shutdown: bool,
    nudged: bool,
    force_requested: u64,
    force_completed: u64,
}

/// Result of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub buffers: usize,
    pub reads: usize,
    pub writes: usize,
    pub crb_hits: usize,
    pub deltas: usize,
    pub trimmed: bool,
}

/// The roll engine of one unit.
#[derive(Debug)]
pub struct RollEngine {
    state: Arc<UnitState>,
    control: Mutex<Control>,
    wake: Condvar,
    done: Condvar,
    /// Held for the length of a pass; passes never overlap.
    pool: Mutex<RollBufferPool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RollEngine {
    pub fn new(state: Arc<UnitState>) -> Self {
        let pool = RollBufferPool::new(
            state.config.clamped_roll_buffers(),
            state.config.map_block_size as usize,
        );
        Self {
            state,
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            done: Condvar::new(),
            pool: Mutex::new(pool),
            thread: Mutex::new(None),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the background thread.
    pub fn start(self: &Arc<Self>) -> LogResult<()> {
        let mut slot = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        self.control().running = true;
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("samwal-roll".to_string())
            .spawn(move || engine.run())
            .map_err(|e| {
                self.control().running = false;
                LogError::invalid_config(format!("cannot start roll thread: {}", e))
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Ask the thread to exit and wait for it.
    pub fn stop(&self) {
        {
            let mut ctl = self.control();
            ctl.shutdown = true;
        }
        self.wake.notify_all();
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.control().running
    }

    /// Wake the thread so it re-evaluates its triggers.
    pub fn wake(&self) {
        drop(self.control());
        self.wake.notify_all();
    }

    /// Request rolling. With `force` the call returns once every committed
    /// delta has been rolled (or the unit failed); without it the thread is
    /// asked for a pass and the call returns at once.
    pub fn request_roll(&self, force: bool) -> LogResult<()> {
        let mut ctl = self.control();
        if !ctl.running {
            drop(ctl);
            return if force { self.roll_until_drained() } else { Ok(()) };
        }
        if !force {
            ctl.nudged = true;
            drop(ctl);
            self.wake.notify_all();
            return Ok(());
        }

        ctl.force_requested += 1;
        let generation = ctl.force_requested;
        self.wake.notify_all();
        while ctl.force_completed < generation && ctl.running {
            ctl = self.done.wait(ctl).unwrap_or_else(|e| e.into_inner());
        }
        let finished = ctl.force_completed >= generation;
        drop(ctl);

        self.state.check()?;
        if !finished {
            // The thread stopped before serving the request.
            return self.roll_until_drained();
        }
        Ok(())
    }

    /// Run passes until one finds nothing to roll.
    pub fn roll_until_drained(&self) -> LogResult<()> {
        loop {
            let stats = self.roll_pass()?;
            if stats.buffers == 0 {
                return Ok(());
            }
        }
    }

    fn run(self: Arc<Self>) {
        log_event(Event::RollEngineStart);
        while let Some(trigger) = self.next_trigger() {
            let result = match trigger {
                Trigger::Forced(generation) => {
                    let result = self.roll_until_drained();
                    let mut ctl = self.control();
                    ctl.force_completed = ctl.force_completed.max(generation);
                    drop(ctl);
                    self.done.notify_all();
                    result
                }
                _ => self.roll_pass().map(|_| ()),
            };
            if result.is_err() {
                break;
            }
        }

        let mut ctl = self.control();
        ctl.running = false;
        drop(ctl);
        self.done.notify_all();
        log_event(Event::RollEngineStop);
    }

    /// Block until there is a reason to roll; `None` means exit.
    fn next_trigger(&self) -> Option<Trigger> {
        let config = &self.state.config;
        let mut waited = false;
        loop {
            if self.state.is_errored() {
                return None;
            }
            let (used, nearly_full) = {
                let writer = self.state.writer();
                (writer.used(), writer.nearly_full(config.log_roll_fraction))
            };

            let mut ctl = self.control();
            if ctl.shutdown {
                return None;
            }
            if ctl.force_requested > ctl.force_completed {
                return Some(Trigger::Forced(ctl.force_requested));
            }
            if ctl.nudged {
                ctl.nudged = false;
                return Some(Trigger::Requested);
            }
            if self.state.log_map.len() > config.logmap_roll_threshold {
                return Some(Trigger::Pressure);
            }
            if waited && !self.state.log_map.take_referenced() && used > 0 {
                return Some(Trigger::Idle);
            }
            if nearly_full && self.state.log_map.rollable() > 0 {
                return Some(Trigger::LogFull);
            }

            ctl = self
                .wake
                .wait_timeout(ctl, config.roll_wake_interval())
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
            drop(ctl);
            waited = true;
        }
    }

    /// One read/write pass followed by a head trim.
    pub fn roll_pass(&self) -> LogResult<PassStats> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        self.state.check()?;

        let mut buffers: Vec<RollBuffer> = Vec::new();
        let mut stats = PassStats::default();
        let result = self.fill_and_write(&mut pool, &mut buffers, &mut stats);

        match result {
            Ok(()) => {
                for buf in buffers {
                    let key = buf.key();
                    let ids = buf.delta_ids();
                    for delta in buf.deltas() {
                        self.state.metrics.record_rolled(delta.kind, delta.range.len);
                    }
                    self.state.log_map.finish_roll(key, &ids);
                    pool.release(buf.into_data());
                }
            }
            Err(err) => {
                for buf in buffers {
                    // Reads still in flight must finish before the
                    // scratch block is reused.
                    let mut buf = buf;
                    if let Some(read) = buf.take_pending_read() {
                        let _ = read.wait();
                    }
                    self.state.log_map.abort_roll(buf.key());
                    pool.release(buf.into_data());
                }
                return Err(self.state.fail(err));
            }
        }

        maybe_crash(points::ROLL_BEFORE_TRIM);
        stats.trimmed = self.trim()?;

        self.state.metrics.increment_roll_passes();
        if stats.buffers > 0 || stats.trimmed {
            log_event_with_fields(
                Event::RollPass,
                &[
                    ("buffers", &stats.buffers.to_string()),
                    ("crb_hits", &stats.crb_hits.to_string()),
                    ("deltas", &stats.deltas.to_string()),
                    ("reads", &stats.reads.to_string()),
                    ("writes", &stats.writes.to_string()),
                ],
            );
        }
        Ok(stats)
    }

    fn fill_and_write(
        &self,
        pool: &mut RollBufferPool,
        buffers: &mut Vec<RollBuffer>,
        stats: &mut PassStats,
    ) -> LogResult<()> {
        self.read_stage(pool, buffers, stats)?;
        if buffers.is_empty() {
            return Ok(());
        }

        for buf in buffers.iter_mut() {
            if let Some(read) = buf.take_pending_read() {
                let bytes = read
                    .wait()
                    .map_err(|e| LogError::io_failed(format!("roll read of {:?}", buf.key()), e))?;
                buf.load_master(&bytes);
            }
            buf.overlay();
        }
        buffers.sort_by_key(|b| b.key());

        maybe_crash(points::ROLL_BEFORE_WRITE);
        self.write_stage(buffers, stats)?;
        maybe_crash(points::ROLL_AFTER_WRITE);
        Ok(())
    }

    fn read_stage(
        &self,
        pool: &mut RollBufferPool,
        buffers: &mut Vec<RollBuffer>,
        stats: &mut PassStats,
    ) -> LogResult<()> {
        let state = &self.state;
        let mut cursor: Option<BlockKey> = None;

        while buffers.len() < pool.capacity() {
            let work = match state.log_map.claim_next(cursor) {
                Claim::Exhausted => break,
                Claim::Busy(key) if buffers.is_empty() => {
                    state.log_map.wait_readers(key, READER_WAIT);
                    if state.is_errored() {
                        break;
                    }
                    continue;
                }
                Claim::Busy(_) => break,
                Claim::Ready(work) => work,
            };
            cursor = Some(work.key);

            let mut work = work;
            if let Some(crb) = &work.crb {
                let block_end = work.block_offset + state.config.map_block_size;
                if state.delta_map.holds_through(
                    work.key.ordinal,
                    work.block_offset,
                    block_end,
                    crb.covers_through(),
                ) {
                    // The image includes changes that are not committed yet.
                    work.crb = None;
                }
            }

            stats.deltas += work.deltas.len();
            let mut buf = RollBuffer::new(work, pool.acquire(), state.config.sector_size);
            if buf.crb().is_some() {
                stats.crb_hits += 1;
                state.metrics.increment_crb_hits();
            } else if buf.needs_master() {
                buf.set_pending_read(self.read_master(&buf));
                stats.reads += 1;
                state.metrics.add_roll_reads(1);
            }
            buffers.push(buf);
        }
        stats.buffers = buffers.len();
        Ok(())
    }

    fn read_master(&self, buf: &RollBuffer) -> IoCompletion {
        let key = buf.key();
        match self.state.masters.get(key.ordinal) {
            Ok(dev) => self.state.io.submit_read(
                dev,
                buf.block_offset(),
                self.state.config.map_block_size as usize,
            ),
            Err(e) => IoCompletion::ready(Err(e)),
        }
    }

    fn write_stage(&self, buffers: &[RollBuffer], stats: &mut PassStats) -> LogResult<()> {
        let state = &self.state;
        let mut completions = Vec::new();
        let mut ordinals = BTreeSet::new();

        for buf in buffers {
            let ordinal = buf.key().ordinal;
            let dev = state
                .masters
                .get(ordinal)
                .map_err(|e| LogError::io_failed("roll write", e))?;
            ordinals.insert(ordinal);
            for (offset, data) in buf.writes() {
                completions.push(state.io.submit_write(dev, offset, data, false));
            }
        }
        stats.writes = completions.len();
        state.metrics.add_roll_writes(completions.len() as u64);
        wait_all(completions, "roll write")?;

        for ordinal in ordinals {
            let dev = state
                .masters
                .get(ordinal)
                .map_err(|e| LogError::io_failed("master flush", e))?;
            dev.flush()
                .map_err(|e| LogError::io_failed("master flush after roll", e))?;
        }
        Ok(())
    }

    /// Move the head to the oldest epoch still referenced by the log map,
    /// or to the tail when nothing is left.
    fn trim(&self) -> LogResult<bool> {
        let mut writer = self.state.writer();
        let target = self
            .state
            .log_map
            .oldest_lsn()
            .unwrap_or_else(|| writer.tail());
        let moved = writer
            .trim_head(target)
            .map_err(|e| self.state.fail(e))?;
        if moved {
            self.state.metrics.increment_log_trims();
            log_event_with_fields(
                Event::LogTrimmed,
                &[
                    ("head_lsn", &writer.head().to_string()),
                    ("used", &writer.used().to_string()),
                ],
            );
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, IoEngine, MasterSet, MemDevice};
    use crate::log::config::LogConfig;
    use crate::log::delta::{DeltaData, DeltaKind, DeltaRange};
    use crate::log::errors::LogErrorCode;
    use crate::log::log_map::LoggedDelta;
    use crate::log::record::LogHeader;
    use crate::log::roll_buffer::CachedRollBuffer;
    use crate::log::writer::LogWriter;

    const BS: u64 = 8192;

    struct Fixture {
        master: Arc<MemDevice>,
        state: Arc<UnitState>,
        engine: Arc<RollEngine>,
        next_lsn: u64,
        next_id: u64,
    }

    fn fixture() -> Fixture {
        fixture_with(LogConfig::default())
    }

    fn fixture_with(config: LogConfig) -> Fixture {
        let log: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(1 << 16));
        let master = Arc::new(MemDevice::new(1 << 16));
        let io = Arc::new(IoEngine::new(2));
        let header = LogHeader::new(1 << 16).unwrap();
        let writer = LogWriter::new(log, io.clone(), header, 0);
        let state = Arc::new(UnitState::new(
            config,
            writer,
            MasterSet::single(master.clone()),
            io,
        ));
        let engine = Arc::new(RollEngine::new(state.clone()));
        Fixture {
            master,
            state,
            engine,
            next_lsn: 0,
            next_id: 1,
        }
    }

    impl Fixture {
        /// Insert a committed delta as if tid 1 had logged it.
        fn committed(&mut self, offset: u64, bytes: &[u8]) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            self.state.log_map.insert(LoggedDelta {
                id,
                lsn: self.next_lsn,
                epoch_lsn: 0,
                tid: 1,
                range: DeltaRange::new(0, offset, bytes.len() as u64),
                kind: DeltaKind::Inode,
                data: DeltaData::Bytes(Arc::from(bytes)),
            });
            self.next_lsn += 100;
            self.state.log_map.commit_complete(1);
            id
        }

        /// Insert a delta of `tid` whose commit record is not written yet.
        fn in_flight(&mut self, tid: u64, offset: u64, bytes: &[u8]) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            self.state.log_map.insert(LoggedDelta {
                id,
                lsn: self.next_lsn,
                epoch_lsn: self.next_lsn,
                tid,
                range: DeltaRange::new(0, offset, bytes.len() as u64),
                kind: DeltaKind::Inode,
                data: DeltaData::Bytes(Arc::from(bytes)),
            });
            self.next_lsn += 100;
            id
        }

        /// Put one commit record on the log so it is not empty.
        fn log_commit(&self, tid: u64) {
            let mut writer = self.state.writer();
            writer.append_commit(tid, 0).unwrap();
            wait_all(writer.issue(), "commit").unwrap();
        }
    }

    // ==================== Pass Tests ====================

    #[test]
    fn test_adjacent_deltas_and_crb_take_two_writes() {
        let mut f = fixture();
        f.committed(0, &[1; 512]);
        f.committed(512, &[2; 512]);
        f.committed(1024, &[3; 512]);
        let crb_id = f.committed(4 * BS, &[4; 64]);
        let mut image = vec![0u8; BS as usize];
        image[..64].fill(4);
        f.state.log_map.register_crb(Arc::new(CachedRollBuffer::new(
            0,
            4 * BS,
            Arc::from(image),
            crb_id,
        )));
        f.master.clear_stats();

        let stats = f.engine.roll_pass().unwrap();
        assert_eq!(stats.buffers, 2);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.reads, 0);
        assert_eq!(stats.crb_hits, 1);
        let mut writes = f.master.write_log();
        writes.sort();
        assert_eq!(writes, vec![(0, 1536), (4 * BS, 512)]);
        assert!(f.state.log_map.is_empty());

        let data = f.master.snapshot();
        assert_eq!(&data[510..514], &[1, 1, 2, 2]);
        assert_eq!(data[4 * BS as usize], 4);
    }

    #[test]
    fn test_partial_sector_reads_master() {
        let mut f = fixture();
        f.master.write_at(0, &[9; 512]).unwrap();
        f.committed(100, b"hello");

        let stats = f.engine.roll_pass().unwrap();
        assert_eq!(stats.reads, 1);
        let data = f.master.snapshot();
        assert_eq!(&data[98..100], &[9, 9]);
        assert_eq!(&data[100..105], b"hello");
        assert_eq!(&data[105..107], &[9, 9]);
    }

    #[test]
    fn test_pass_bounded_by_pool() {
        let mut f = fixture_with(LogConfig {
            roll_buffers: 4,
            ..LogConfig::default()
        });
        for block in 0..10 {
            f.committed(block * BS, &[block as u8; 512]);
        }
        let stats = f.engine.roll_pass().unwrap();
        assert_eq!(stats.buffers, 4);
        assert_eq!(f.state.log_map.len(), 6);
        f.engine.roll_until_drained().unwrap();
        assert!(f.state.log_map.is_empty());
    }

    #[test]
    fn test_write_failure_sets_error_and_keeps_entries() {
        let mut f = fixture();
        f.committed(0, &[1; 512]);
        f.master.fail_writes(true);

        let err = f.engine.roll_pass().unwrap_err();
        assert!(err.is_fatal());
        assert!(f.state.is_errored());
        assert_eq!(f.state.log_map.len(), 1);
        assert_eq!(
            f.engine.roll_pass().unwrap_err().code(),
            LogErrorCode::LogUnusable
        );
    }

    #[test]
    fn test_trim_moves_head_to_tail_when_empty() {
        let mut f = fixture();
        {
            let mut writer = f.state.writer();
            writer.append_commit(1, 0).unwrap();
            wait_all(writer.issue(), "commit").unwrap();
        }
        f.committed(0, &[1; 8]);
        f.engine.roll_pass().unwrap();
        let writer = f.state.writer();
        assert_eq!(writer.used(), 0);
    }

    #[test]
    fn test_crb_ignored_while_commit_in_flight() {
        let mut f = fixture();
        f.committed(0, &[0xAA; 8]);
        let pending = f.in_flight(2, 16, &[0xBB; 8]);
        let mut image = vec![0u8; BS as usize];
        image[..8].fill(0xAA);
        image[16..24].fill(0xBB);
        f.state.log_map.register_crb(Arc::new(CachedRollBuffer::new(
            0,
            0,
            Arc::from(image),
            pending,
        )));

        let stats = f.engine.roll_pass().unwrap();
        assert_eq!(stats.crb_hits, 0);
        assert_eq!(stats.reads, 1);
        let data = f.master.snapshot();
        assert_eq!(&data[..8], &[0xAA; 8]);
        assert_eq!(&data[16..24], &[0; 8]);
        assert_eq!(f.state.log_map.len(), 1);

        f.state.log_map.commit_complete(2);
        let stats = f.engine.roll_pass().unwrap();
        assert_eq!(stats.crb_hits, 1);
        assert_eq!(&f.master.snapshot()[16..24], &[0xBB; 8]);
        assert!(f.state.log_map.is_empty());
    }

    #[test]
    fn test_pass_stops_at_block_being_read() {
        let mut f = fixture();
        for block in 0..3 {
            f.committed(block * BS, &[block as u8 + 1; 512]);
        }
        let guard = f.state.log_map.begin_read(&DeltaRange::new(0, 2 * BS, 16));

        let stats = f.engine.roll_pass().unwrap();
        assert_eq!(stats.buffers, 2);
        assert_eq!(f.state.log_map.len(), 1);
        assert_eq!(guard.deltas().len(), 1);
        assert_eq!(f.master.snapshot()[2 * BS as usize], 0);

        drop(guard);
        let stats = f.engine.roll_pass().unwrap();
        assert_eq!(stats.buffers, 1);
        assert_eq!(f.master.snapshot()[2 * BS as usize], 3);
        assert!(f.state.log_map.is_empty());
    }

    // ==================== Trigger Tests ====================

    fn quick(config: LogConfig) -> LogConfig {
        LogConfig {
            roll_wake_interval_ms: 10,
            ..config
        }
    }

    #[test]
    fn test_shutdown_outranks_every_trigger() {
        let mut f = fixture_with(quick(LogConfig {
            logmap_roll_threshold: 0,
            ..LogConfig::default()
        }));
        f.committed(0, &[1; 8]);
        {
            let mut ctl = f.engine.control();
            ctl.nudged = true;
            ctl.force_requested = 1;
            ctl.shutdown = true;
        }
        assert_eq!(f.engine.next_trigger(), None);
    }

    #[test]
    fn test_forced_outranks_requested() {
        let f = fixture();
        {
            let mut ctl = f.engine.control();
            ctl.nudged = true;
            ctl.force_requested = 3;
            ctl.force_completed = 2;
        }
        assert_eq!(f.engine.next_trigger(), Some(Trigger::Forced(3)));

        f.engine.control().force_completed = 3;
        assert_eq!(f.engine.next_trigger(), Some(Trigger::Requested));
        assert!(!f.engine.control().nudged);
    }

    #[test]
    fn test_log_map_over_threshold_triggers() {
        let mut f = fixture_with(LogConfig {
            logmap_roll_threshold: 2,
            ..LogConfig::default()
        });
        for i in 0..3 {
            f.committed(i * 64, &[1; 8]);
        }
        assert_eq!(f.engine.next_trigger(), Some(Trigger::Pressure));
    }

    #[test]
    fn test_nearly_full_log_triggers() {
        let mut f = fixture_with(LogConfig {
            log_roll_fraction: 0.0001,
            ..LogConfig::default()
        });
        f.log_commit(1);
        f.committed(0, &[1; 8]);
        // Referenced: the idle check must not be what fires.
        f.state.log_map.mark_referenced();
        assert_eq!(f.engine.next_trigger(), Some(Trigger::LogFull));
    }

    #[test]
    fn test_unreferenced_log_triggers_idle() {
        let f = fixture_with(quick(LogConfig::default()));
        f.log_commit(1);
        assert_eq!(f.engine.next_trigger(), Some(Trigger::Idle));
    }

    #[test]
    fn test_empty_log_waits_until_shutdown() {
        let f = fixture_with(quick(LogConfig::default()));
        let engine = f.engine.clone();
        let waiter = thread::spawn(move || engine.next_trigger());

        thread::sleep(Duration::from_millis(60));
        assert!(!waiter.is_finished());
        f.engine.control().shutdown = true;
        f.engine.wake();
        assert_eq!(waiter.join().unwrap(), None);
    }

    // ==================== Thread Tests ====================

    #[test]
    fn test_idle_thread_rolls_without_request() {
        let mut f = fixture_with(quick(LogConfig::default()));
        f.log_commit(1);
        f.committed(0, &[7; 512]);
        f.engine.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !f.state.log_map.is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        f.engine.stop();
        assert!(f.state.log_map.is_empty());
        assert_eq!(f.master.snapshot()[0], 7);
        assert_eq!(f.state.writer().used(), 0);
    }


    #[test]
    fn test_forced_roll_through_thread() {
        let mut f = fixture();
        f.engine.start().unwrap();
        f.committed(0, &[5; 512]);
        f.engine.request_roll(true).unwrap();
        assert!(f.state.log_map.is_empty());
        f.engine.stop();
        assert!(!f.engine.is_running());
    }

    #[test]
    fn test_thread_exits_on_error() {
        let f = fixture();
        f.engine.start().unwrap();
        f.state.set_error("test");
        f.engine.wake();
        f.engine.stop();
        assert!(!f.engine.is_running());
    }
}
