//! Roll buffers
//!
//! A roll buffer carries one map block through a roll pass: the master
//! contents (or a cached image), the deltas laid over them, and a sector
//! bitmap recording which sectors the deltas touched. Only touched sectors
//! are written back, as one write per contiguous run.

use std::sync::Arc;

use crate::device::{IoBuffer, IoCompletion};

use super::log_map::{BlockKey, LoggedDelta, RollWork};

/// Merge half-open intervals into a sorted, disjoint list.
pub fn merge_intervals(mut intervals: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    intervals.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Whether merged `intervals` cover `[start, end)` entirely.
pub fn covers(intervals: &[(u64, u64)], start: u64, end: u64) -> bool {
    intervals.iter().any(|&(s, e)| s <= start && end <= e)
}

/// One bit per sector of a map block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectorBitmap(u64);

impl SectorBitmap {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, sector: u64) {
        self.0 |= 1u64 << sector;
    }

    pub fn is_set(&self, sector: u64) -> bool {
        self.0 & (1u64 << sector) != 0
    }

    /// Mark `count` sectors starting at `first`.
    pub fn mark_range(&mut self, first: u64, count: u64) {
        for sector in first..first + count {
            self.set(sector);
        }
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether every sector set here is also set in `other`.
    pub fn is_subset_of(&self, other: &SectorBitmap) -> bool {
        self.0 & !other.0 == 0
    }

    /// Contiguous runs of set sectors as `(first, count)`.
    pub fn runs(&self) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        let mut sector = 0u64;
        while sector < 64 {
            if !self.is_set(sector) {
                sector += 1;
                continue;
            }
            let first = sector;
            while sector < 64 && self.is_set(sector) {
                sector += 1;
            }
            runs.push((first, sector - first));
        }
        runs
    }
}

/// A resident image of a map block that already reflects every delta
/// declared up to `covers_through`. Read-only once published.
#[derive(Debug)]
pub struct CachedRollBuffer {
    ordinal: u8,
    block_offset: u64,
    image: Arc<[u8]>,
    covers_through: u64,
}

impl CachedRollBuffer {
    pub fn new(ordinal: u8, block_offset: u64, image: Arc<[u8]>, covers_through: u64) -> Self {
        Self {
            ordinal,
            block_offset,
            image,
            covers_through,
        }
    }

    pub fn ordinal(&self) -> u8 {
        self.ordinal
    }

    pub fn block_offset(&self) -> u64 {
        self.block_offset
    }

    pub fn image(&self) -> &Arc<[u8]> {
        &self.image
    }

    /// Highest delta id reflected in the image.
    pub fn covers_through(&self) -> u64 {
        self.covers_through
    }
}

/// One block in flight through a roll pass.
#[derive(Debug)]
pub struct RollBuffer {
    key: BlockKey,
    block_offset: u64,
    sector_size: u64,
    touched: SectorBitmap,
    /// Sectors the deltas overwrite completely.
    covered: SectorBitmap,
    deltas: Vec<LoggedDelta>,
    data: Vec<u8>,
    crb: Option<Arc<CachedRollBuffer>>,
    pending_read: Option<IoCompletion>,
}

impl RollBuffer {
    /// Build from claimed work, using `data` (one block long) as scratch.
    pub fn new(work: RollWork, data: Vec<u8>, sector_size: u64) -> Self {
        let mut touched = SectorBitmap::new();
        let mut covered = SectorBitmap::new();
        let base = work.block_offset;

        let intervals = merge_intervals(
            work.deltas
                .iter()
                .map(|d| (d.range.offset - base, d.range.end() - base))
                .collect(),
        );
        for &(start, end) in &intervals {
            let first = start / sector_size;
            let last = (end + sector_size - 1) / sector_size;
            touched.mark_range(first, last - first);
        }
        for sector in touched.runs().iter().flat_map(|&(f, n)| f..f + n) {
            let start = sector * sector_size;
            if covers(&intervals, start, start + sector_size) {
                covered.set(sector);
            }
        }

        Self {
            key: work.key,
            block_offset: base,
            sector_size,
            touched,
            covered,
            deltas: work.deltas,
            data,
            crb: work.crb,
            pending_read: None,
        }
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn block_offset(&self) -> u64 {
        self.block_offset
    }

    pub fn touched(&self) -> SectorBitmap {
        self.touched
    }

    pub fn deltas(&self) -> &[LoggedDelta] {
        &self.deltas
    }

    pub fn delta_ids(&self) -> Vec<u64> {
        self.deltas.iter().map(|d| d.id).collect()
    }

    pub fn crb(&self) -> Option<&Arc<CachedRollBuffer>> {
        self.crb.as_ref()
    }

    /// Whether the master block must be read before overlaying: some
    /// touched sector is only partly overwritten and no cached image exists.
    pub fn needs_master(&self) -> bool {
        self.crb.is_none() && !self.touched.is_subset_of(&self.covered)
    }

    pub fn set_pending_read(&mut self, completion: IoCompletion) {
        self.pending_read = Some(completion);
    }

    pub fn take_pending_read(&mut self) -> Option<IoCompletion> {
        self.pending_read.take()
    }

    /// Install master contents read from the device.
    pub fn load_master(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
    }

    /// Lay the deltas over the block in log order. A cached image already
    /// holds them.
    pub fn overlay(&mut self) {
        if self.crb.is_some() {
            return;
        }
        for delta in &self.deltas {
            let start = (delta.range.offset - self.block_offset) as usize;
            let dst = &mut self.data[start..start + delta.range.len as usize];
            delta.data.copy_into(&delta.range, &delta.range, dst);
        }
    }

    /// One write per run of touched sectors, as `(device offset, buffer)`.
    pub fn writes(&self) -> Vec<(u64, IoBuffer)> {
        let ss = self.sector_size as usize;
        self.touched
            .runs()
            .into_iter()
            .map(|(first, count)| {
                let start = first as usize * ss;
                let len = count as usize * ss;
                let buf = match &self.crb {
                    Some(crb) => IoBuffer::Shared {
                        data: crb.image().clone(),
                        start,
                        len,
                    },
                    None => IoBuffer::Owned(self.data[start..start + len].to_vec()),
                };
                (self.block_offset + start as u64, buf)
            })
            .collect()
    }

    /// Give the scratch block back.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Reusable scratch blocks for the roll engine.
#[derive(Debug)]
pub struct RollBufferPool {
    free: Vec<Vec<u8>>,
    capacity: usize,
    block_size: usize,
}

impl RollBufferPool {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
            block_size,
        }
    }

    /// Buffers per pass.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A zeroed block, reused when one is free.
    pub fn acquire(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(mut data) => {
                data.clear();
                data.resize(self.block_size, 0);
                data
            }
            None => vec![0u8; self.block_size],
        }
    }

    pub fn release(&mut self, data: Vec<u8>) {
        if self.free.len() < self.capacity {
            self.free.push(data);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}
