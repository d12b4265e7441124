//! Log Map
//!
//! Committed deltas waiting to be rolled to their master locations, grouped
//! by map block. Also owns the cancel list, the registered cached roll
//! buffers, and the "referenced" flag the roll engine's idle check reads.
//!
//! Head trimming is bounded by `oldest_lsn`: the start of the oldest epoch
//! that still has a delta here. Trimming past an epoch's start while some of
//! its deltas remain would make that epoch unrecoverable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::delta::{DeltaData, DeltaKind, DeltaRange, DeltaRecord};
use super::roll_buffer::CachedRollBuffer;

/// A delta that has been written to the log.
#[derive(Debug, Clone)]
pub struct LoggedDelta {
    pub id: u64,
    pub lsn: u64,
    /// LSN of the first record of the epoch this delta belongs to.
    pub epoch_lsn: u64,
    pub tid: u64,
    pub range: DeltaRange,
    pub kind: DeltaKind,
    pub data: DeltaData,
}

/// One map block on one master device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    pub ordinal: u8,
    pub block: u64,
}

impl BlockKey {
    pub fn of(range: &DeltaRange, block_size: u64) -> Self {
        Self {
            ordinal: range.ordinal,
            block: range.offset / block_size,
        }
    }
}

#[derive(Debug, Default)]
struct BlockEntry {
    deltas: Vec<LoggedDelta>,
    readers: usize,
    rolling: bool,
}

/// Ranges canceled since the last commit, with the records they removed.
#[derive(Debug)]
pub struct CancelEntry {
    pub range: DeltaRange,
    pub records: Vec<DeltaRecord>,
}

/// A block claimed for rolling.
#[derive(Debug)]
pub struct RollWork {
    pub key: BlockKey,
    pub block_offset: u64,
    /// Committed deltas of the block, oldest first.
    pub deltas: Vec<LoggedDelta>,
    /// Cached image of the block that already reflects every delta above.
    pub crb: Option<Arc<CachedRollBuffer>>,
}

/// Outcome of looking for the next block to roll.
#[derive(Debug)]
pub enum Claim {
    Ready(RollWork),
    /// The next candidate is being read through.
    Busy(BlockKey),
    Exhausted,
}

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<BlockKey, BlockEntry>,
    /// Live delta count per epoch start LSN.
    epochs: BTreeMap<u64, usize>,
    committed_tid: u64,
    count: usize,
    bytes: u64,
    cancel: Vec<CancelEntry>,
    /// Cancels of the epoch whose commit record is being written.
    committing: Vec<CancelEntry>,
    crbs: HashMap<BlockKey, Arc<CachedRollBuffer>>,
}

impl Inner {
    fn committed(&self, delta: &LoggedDelta) -> bool {
        delta.tid <= self.committed_tid
    }
}

/// Committed, not yet rolled deltas of one log unit.
#[derive(Debug)]
pub struct LogMap {
    inner: Mutex<Inner>,
    readers_done: Condvar,
    referenced: AtomicBool,
    block_size: u64,
}

impl LogMap {
    /// Empty map; transactions up to `committed_tid` count as committed.
    pub fn new(block_size: u64, committed_tid: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                committed_tid,
                ..Inner::default()
            }),
            readers_done: Condvar::new(),
            referenced: AtomicBool::new(false),
            block_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Add a delta just appended to the log. It is not rollable until
    /// `commit_complete` covers its tid.
    pub fn insert(&self, delta: LoggedDelta) {
        let key = BlockKey::of(&delta.range, self.block_size);
        let mut inner = self.lock();
        *inner.epochs.entry(delta.epoch_lsn).or_insert(0) += 1;
        inner.count += 1;
        inner.bytes += delta.range.len;
        inner.blocks.entry(key).or_default().deltas.push(delta);
    }

    /// The commit record of `tid` is on the log.
    pub fn commit_complete(&self, tid: u64) {
        let mut inner = self.lock();
        inner.committed_tid = inner.committed_tid.max(tid);
    }

    pub fn committed_tid(&self) -> u64 {
        self.lock().committed_tid
    }

    /// Claim the first rollable block after `after`.
    pub fn claim_next(&self, after: Option<BlockKey>) -> Claim {
        let mut inner = self.lock();
        let committed_tid = inner.committed_tid;
        let candidate = inner
            .blocks
            .iter()
            .filter(|(key, _)| after.map_or(true, |a| **key > a))
            .find(|(_, entry)| {
                !entry.rolling && entry.deltas.iter().any(|d| d.tid <= committed_tid)
            })
            .map(|(key, entry)| (*key, entry.readers));

        let (key, readers) = match candidate {
            Some(found) => found,
            None => return Claim::Exhausted,
        };
        if readers > 0 {
            return Claim::Busy(key);
        }

        let crb = inner.crbs.get(&key).cloned();
        let entry = match inner.blocks.get_mut(&key) {
            Some(entry) => entry,
            None => return Claim::Exhausted,
        };
        entry.rolling = true;
        let mut deltas: Vec<LoggedDelta> = entry
            .deltas
            .iter()
            .filter(|d| d.tid <= committed_tid)
            .cloned()
            .collect();
        deltas.sort_by_key(|d| d.lsn);

        // The image must include every committed delta of the block and no
        // delta whose commit record is still being written.
        let newest = deltas.iter().map(|d| d.id).max().unwrap_or(0);
        let crb = crb.filter(|c| {
            c.covers_through() >= newest
                && !entry
                    .deltas
                    .iter()
                    .any(|d| d.tid > committed_tid && d.id <= c.covers_through())
        });

        Claim::Ready(RollWork {
            key,
            block_offset: key.block * self.block_size,
            deltas,
            crb,
        })
    }

    /// Wait up to `timeout` for read-through of `key` to finish.
    pub fn wait_readers(&self, key: BlockKey, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            let busy = inner.blocks.get(&key).map_or(false, |e| e.readers > 0);
            let now = Instant::now();
            if !busy || now >= deadline {
                return;
            }
            inner = self
                .readers_done
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Drop the rolled deltas `ids` of `key` and release the claim.
    pub fn finish_roll(&self, key: BlockKey, ids: &[u64]) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = match inner.blocks.get_mut(&key) {
            Some(entry) => entry,
            None => return,
        };
        entry.rolling = false;

        let mut removed = Vec::new();
        entry.deltas.retain(|d| {
            if ids.contains(&d.id) {
                removed.push((d.epoch_lsn, d.range.len));
                false
            } else {
                true
            }
        });
        let now_empty = entry.deltas.is_empty() && entry.readers == 0;

        for (epoch_lsn, len) in removed {
            inner.count -= 1;
            inner.bytes -= len;
            if let Some(n) = inner.epochs.get_mut(&epoch_lsn) {
                *n -= 1;
                if *n == 0 {
                    inner.epochs.remove(&epoch_lsn);
                }
            }
        }
        if now_empty {
            inner.blocks.remove(&key);
        }
    }

    /// Release a claim without removing anything.
    pub fn abort_roll(&self, key: BlockKey) {
        if let Some(entry) = self.lock().blocks.get_mut(&key) {
            entry.rolling = false;
        }
    }

    /// Start of the oldest epoch that still has a delta here.
    pub fn oldest_lsn(&self) -> Option<u64> {
        self.lock().epochs.keys().next().copied()
    }

    /// Mark the blocks under `range` as being read and collect their
    /// committed deltas overlapping it, oldest first.
    pub fn begin_read(&self, range: &DeltaRange) -> ReadGuard<'_> {
        if range.len == 0 {
            return ReadGuard {
                map: self,
                keys: Vec::new(),
                deltas: Vec::new(),
            };
        }
        let mut inner = self.lock();
        let committed_tid = inner.committed_tid;
        let first = BlockKey::of(range, self.block_size);
        let last = BlockKey {
            ordinal: range.ordinal,
            block: (range.end() - 1) / self.block_size,
        };

        let mut keys = Vec::new();
        let mut deltas = Vec::new();
        for (key, entry) in inner.blocks.range_mut(first..=last) {
            entry.readers += 1;
            keys.push(*key);
            deltas.extend(
                entry
                    .deltas
                    .iter()
                    .filter(|d| d.tid <= committed_tid && d.range.overlaps(range))
                    .cloned(),
            );
        }
        deltas.sort_by_key(|d| d.lsn);

        ReadGuard {
            map: self,
            keys,
            deltas,
        }
    }

    fn end_read(&self, keys: &[BlockKey]) {
        let mut inner = self.lock();
        for key in keys {
            let remove = match inner.blocks.get_mut(key) {
                Some(entry) => {
                    entry.readers -= 1;
                    entry.readers == 0 && entry.deltas.is_empty()
                }
                None => false,
            };
            if remove {
                inner.blocks.remove(key);
            }
        }
        drop(inner);
        self.readers_done.notify_all();
    }

    // Cancel list

    pub fn park_canceled(&self, range: DeltaRange, records: Vec<DeltaRecord>) {
        self.lock().cancel.push(CancelEntry { range, records });
    }

    /// Hand the cancel list to the commit in flight. Later cancels start a
    /// new list. Returns the number of entries sealed.
    pub fn seal_cancel_list(&self) -> usize {
        let mut inner = self.lock();
        let cancel = std::mem::take(&mut inner.cancel);
        let sealed = cancel.len();
        inner.committing.extend(cancel);
        sealed
    }

    /// Drop the sealed list once its commit record is on the log.
    pub fn release_cancel_list(&self) -> Vec<CancelEntry> {
        std::mem::take(&mut self.lock().committing)
    }

    pub fn is_canceled(&self, range: &DeltaRange) -> bool {
        let inner = self.lock();
        inner
            .cancel
            .iter()
            .chain(inner.committing.iter())
            .any(|c| c.range.overlaps(range))
    }

    // Cached roll buffers

    pub fn register_crb(&self, crb: Arc<CachedRollBuffer>) {
        let key = BlockKey {
            ordinal: crb.ordinal(),
            block: crb.block_offset() / self.block_size,
        };
        self.lock().crbs.insert(key, crb);
    }

    pub fn release_crb(&self, ordinal: u8, block_offset: u64) -> Option<Arc<CachedRollBuffer>> {
        let key = BlockKey {
            ordinal,
            block: block_offset / self.block_size,
        };
        self.lock().crbs.remove(&key)
    }

    pub fn crb_count(&self) -> usize {
        self.lock().crbs.len()
    }

    // Sizes

    pub fn len(&self) -> usize {
        self.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the lengths of all held ranges.
    pub fn bytes(&self) -> u64 {
        self.lock().bytes
    }

    /// Committed deltas not yet rolled.
    pub fn rollable(&self) -> usize {
        let inner = self.lock();
        inner
            .blocks
            .values()
            .flat_map(|e| e.deltas.iter())
            .filter(|d| inner.committed(d))
            .count()
    }

    pub fn need_commit(&self, threshold: usize) -> bool {
        self.len() > threshold
    }

    // Idle tracking

    pub fn mark_referenced(&self) {
        self.referenced.store(true, Ordering::Relaxed);
    }

    /// Read and clear the referenced flag.
    pub fn take_referenced(&self) -> bool {
        self.referenced.swap(false, Ordering::Relaxed)
    }
}

/// Committed deltas under a range, held while it is read through.
#[derive(Debug)]
pub struct ReadGuard<'a> {
    map: &'a LogMap,
    keys: Vec<BlockKey>,
    deltas: Vec<LoggedDelta>,
}

impl ReadGuard<'_> {
    pub fn deltas(&self) -> &[LoggedDelta] {
        &self.deltas
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.map.end_read(&self.keys);
    }
}
