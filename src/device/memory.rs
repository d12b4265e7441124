//! In-memory block device
//!
//! Used for tests and for simulating crashes: `snapshot()` captures the
//! device contents at an exact instant, which is what survives a power
//! loss at that point. Fault injection makes reads or writes fail on demand.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use super::errors::{DeviceError, DeviceResult};
use super::BlockDevice;

/// Sentinel meaning "no write budget configured".
const UNLIMITED: u64 = u64::MAX;

/// A `Vec<u8>`-backed device.
#[derive(Debug)]
pub struct MemDevice {
    data: RwLock<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Remaining successful writes before every write fails.
    write_budget: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    write_log: Mutex<Vec<(u64, usize)>>,
}

impl MemDevice {
    /// Create a zero-filled device of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0u8; len])
    }

    /// Create a device holding the given contents.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(bytes),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_budget: AtomicU64::new(UNLIMITED),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            write_log: Mutex::new(Vec::new()),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// A new device holding a copy of this one's contents, as a crash at
    /// this instant would leave it. Counters and faults are not carried over.
    pub fn crash_copy(&self) -> MemDevice {
        MemDevice::from_bytes(self.snapshot())
    }

    /// Make every subsequent read fail (or stop failing).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail (or stop failing).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        if !fail {
            self.write_budget.store(UNLIMITED, Ordering::SeqCst);
        }
    }

    /// Allow `n` more writes to succeed, then fail all following ones.
    pub fn fail_writes_after(&self, n: u64) {
        self.write_budget.store(n, Ordering::SeqCst);
    }

    /// Number of successful reads.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of flushes.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// `(offset, len)` of every successful write, in completion order.
    pub fn write_log(&self) -> Vec<(u64, usize)> {
        self.write_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forget recorded writes and reset the counters.
    pub fn clear_stats(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
        self.flushes.store(0, Ordering::SeqCst);
        self.write_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn take_write_budget(&self) -> bool {
        let mut current = self.write_budget.load(Ordering::SeqCst);
        loop {
            if current == UNLIMITED {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self.write_budget.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> DeviceResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DeviceError::Injected { op: "read", offset });
        }
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        buf.fill(0);
        if start < data.len() {
            let end = (start + buf.len()).min(data.len());
            buf[..end - start].copy_from_slice(&data[start..end]);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> DeviceResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) || !self.take_write_budget() {
            return Err(DeviceError::Injected { op: "write", offset });
        }
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        drop(data);

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.write_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((offset, bytes.len()));
        Ok(())
    }

    fn flush(&self) -> DeviceResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len() as u64
    }
}
