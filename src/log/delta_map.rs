//! Delta Map
//!
//! Holds declared changes that have not been committed yet. Declarations are
//! split at map-block boundaries so that every record belongs to exactly one
//! block; a later declaration of an identical range replaces the earlier
//! record. `push_to_log` drains everything in declaration order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::delta::{DeltaKind, DeltaPayload, DeltaRange, DeltaRecord};
use super::errors::LogResult;
use super::record::delta_record_len;

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<DeltaRange, DeltaRecord>,
    bytes: u64,
}

/// Uncommitted deltas of one log unit.
#[derive(Debug)]
pub struct DeltaMap {
    inner: Mutex<Inner>,
    block_size: u64,
    next_id: AtomicU64,
}

impl DeltaMap {
    pub fn new(block_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            block_size,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a change. Returns the number of per-block records created.
    pub fn add(&self, range: DeltaRange, kind: DeltaKind, payload: DeltaPayload) -> LogResult<usize> {
        payload.validate(&range)?;

        let parts = range.split_at_blocks(self.block_size);
        let mut inner = self.lock();
        for part in &parts {
            let record = DeltaRecord {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                range: *part,
                kind,
                payload: payload.slice(&range, part),
            };
            if let Some(old) = inner.records.insert(*part, record) {
                inner.bytes -= old.range.len;
            }
            inner.bytes += part.len;
        }
        Ok(parts.len())
    }

    /// Remove every record overlapping `range`. Returns the removed records.
    pub fn remove_overlapping(&self, range: &DeltaRange) -> Vec<DeltaRecord> {
        let mut inner = self.lock();
        let keys: Vec<DeltaRange> = inner
            .records
            .keys()
            .filter(|k| k.overlaps(range))
            .copied()
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = inner.records.remove(&key) {
                inner.bytes -= record.range.len;
                removed.push(record);
            }
        }
        removed
    }

    /// Move every record out, oldest declaration first, handing each to
    /// `append`. The map is empty afterwards even if `append` fails.
    pub fn push_to_log<F>(&self, mut append: F) -> LogResult<usize>
    where
        F: FnMut(DeltaRecord) -> LogResult<()>,
    {
        let mut drained: Vec<DeltaRecord> = {
            let mut inner = self.lock();
            inner.bytes = 0;
            std::mem::take(&mut inner.records).into_values().collect()
        };
        drained.sort_by_key(|r| r.id);

        let count = drained.len();
        for record in drained {
            append(record)?;
        }
        Ok(count)
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the lengths of all pending ranges.
    pub fn pending_bytes(&self) -> u64 {
        self.lock().bytes
    }

    /// Whether the map holds more records than `threshold`.
    pub fn need_commit(&self, threshold: usize) -> bool {
        self.len() > threshold
    }

    /// Log bytes the pending records will take once pushed.
    pub fn log_bytes(&self) -> u64 {
        self.lock()
            .records
            .values()
            .map(|r| {
                let payload = match r.payload {
                    DeltaPayload::Zeroes => 0,
                    _ => r.range.len as usize,
                };
                delta_record_len(payload) as u64
            })
            .sum()
    }

    /// Whether a pending record inside `[start, end)` of `ordinal` was
    /// declared at or before `id`.
    pub fn holds_through(&self, ordinal: u8, start: u64, end: u64, id: u64) -> bool {
        let window = DeltaRange::new(ordinal, start, end - start);
        self.lock()
            .records
            .values()
            .any(|r| r.id <= id && r.range.overlaps(&window))
    }

    /// Id of the most recent declaration (0 before any).
    pub fn last_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst) - 1
    }

    /// Ranges currently pending, in key order.
    pub fn ranges(&self) -> Vec<DeltaRange> {
        self.lock().records.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::errors::{LogError, LogErrorCode};

    fn bytes(range: &DeltaRange, v: u8) -> DeltaPayload {
        DeltaPayload::Bytes(vec![v; range.len as usize])
    }

    // ==================== Declaration Tests ====================

    #[test]
    fn test_add_splits_at_block_boundary() {
        let map = DeltaMap::new(8192);
        let range = DeltaRange::new(0, 8000, 400);
        assert_eq!(map.add(range, DeltaKind::Inode, bytes(&range, 1)).unwrap(), 2);
        assert_eq!(
            map.ranges(),
            vec![DeltaRange::new(0, 8000, 192), DeltaRange::new(0, 8192, 208)]
        );
        assert_eq!(map.pending_bytes(), 400);
    }

    #[test]
    fn test_identical_range_replaces() {
        let map = DeltaMap::new(8192);
        let range = DeltaRange::new(0, 0, 64);
        map.add(range, DeltaKind::Inode, bytes(&range, 1)).unwrap();
        map.add(range, DeltaKind::Inode, bytes(&range, 2)).unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map.pending_bytes(), 64);

        let mut seen = Vec::new();
        map.push_to_log(|r| {
            seen.push(r);
            Ok(())
        })
        .unwrap();
        match &seen[0].payload {
            DeltaPayload::Bytes(b) => assert_eq!(b[0], 2),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_length() {
        let map = DeltaMap::new(8192);
        let err = map
            .add(DeltaRange::new(0, 0, 0), DeltaKind::Inode, DeltaPayload::Zeroes)
            .unwrap_err();
        assert_eq!(err.code(), LogErrorCode::InvalidDelta);
        assert!(!map.has_pending());
    }

    #[test]
    fn test_rejects_range_past_end_of_device_space() {
        let map = DeltaMap::new(8192);
        let err = map
            .add(DeltaRange::new(0, u64::MAX - 10, 100), DeltaKind::Inode, DeltaPayload::Zeroes)
            .unwrap_err();
        assert_eq!(err.code(), LogErrorCode::InvalidDelta);
        assert!(map.is_empty());
        assert_eq!(map.last_id(), 0);
    }

    // ==================== Cancel Tests ====================

    #[test]
    fn test_remove_overlapping() {
        let map = DeltaMap::new(8192);
        for offset in [0u64, 100, 200, 300] {
            let r = DeltaRange::new(0, offset, 50);
            map.add(r, DeltaKind::Directory, bytes(&r, 0)).unwrap();
        }
        let removed = map.remove_overlapping(&DeltaRange::new(0, 120, 100));
        assert_eq!(removed.len(), 2);
        assert_eq!(
            map.ranges(),
            vec![DeltaRange::new(0, 0, 50), DeltaRange::new(0, 300, 50)]
        );
        assert_eq!(map.pending_bytes(), 100);
    }

    #[test]
    fn test_remove_ignores_other_ordinal() {
        let map = DeltaMap::new(8192);
        let r = DeltaRange::new(1, 0, 10);
        map.add(r, DeltaKind::Inode, bytes(&r, 0)).unwrap();
        assert!(map.remove_overlapping(&DeltaRange::new(0, 0, 10)).is_empty());
        assert_eq!(map.len(), 1);
    }

    // ==================== Push Tests ====================

    #[test]
    fn test_push_in_declaration_order() {
        let map = DeltaMap::new(8192);
        let late = DeltaRange::new(0, 0, 8);
        let early = DeltaRange::new(0, 4096, 8);
        map.add(early, DeltaKind::Inode, bytes(&early, 1)).unwrap();
        map.add(late, DeltaKind::Inode, bytes(&late, 2)).unwrap();

        let mut order = Vec::new();
        let n = map
            .push_to_log(|r| {
                order.push(r.range);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(order, vec![early, late]);
        assert!(map.is_empty());
        assert_eq!(map.pending_bytes(), 0);
    }

    #[test]
    fn test_push_failure_still_empties() {
        let map = DeltaMap::new(8192);
        let r = DeltaRange::new(0, 0, 8);
        map.add(r, DeltaKind::Inode, bytes(&r, 1)).unwrap();

        let result = map.push_to_log(|_| Err(LogError::unusable("test")));
        assert!(result.is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn test_need_commit_threshold() {
        let map = DeltaMap::new(8192);
        for i in 0..3u64 {
            let r = DeltaRange::new(0, i * 16, 8);
            map.add(r, DeltaKind::Inode, bytes(&r, 0)).unwrap();
        }
        assert!(map.need_commit(2));
        assert!(!map.need_commit(3));
        assert_eq!(map.last_id(), 3);
    }

    // ==================== Sizing Tests ====================

    #[test]
    fn test_log_bytes_counts_zeroes_without_payload() {
        let map = DeltaMap::new(8192);
        let data = DeltaRange::new(0, 0, 100);
        let zero = DeltaRange::new(0, 4096, 512);
        map.add(data, DeltaKind::Inode, bytes(&data, 7)).unwrap();
        map.add(zero, DeltaKind::Inode, DeltaPayload::Zeroes).unwrap();

        let expected = (delta_record_len(100) + delta_record_len(0)) as u64;
        assert_eq!(map.log_bytes(), expected);
    }

    #[test]
    fn test_holds_through_respects_id() {
        let map = DeltaMap::new(8192);
        let r = DeltaRange::new(0, 8192 + 10, 20);
        map.add(r, DeltaKind::Inode, bytes(&r, 1)).unwrap();
        let id = map.last_id();

        assert!(map.holds_through(0, 8192, 16384, id));
        assert!(!map.holds_through(0, 8192, 16384, id - 1));
        assert!(!map.holds_through(0, 0, 8192, id));
        assert!(!map.holds_through(1, 8192, 16384, id));
    }
}
