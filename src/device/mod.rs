//! Block devices and asynchronous I/O
//!
//! The log and the master devices are addressed as flat byte ranges. The
//! roll engine and the log writer never touch a device directly; they submit
//! reads and writes to an `IoEngine` and wait on the returned completions.

mod errors;
mod file;
mod io;
mod memory;

use std::fmt;
use std::sync::Arc;

pub use errors::{DeviceError, DeviceResult};
pub use file::FileDevice;
pub use io::{IoBuffer, IoCompletion, IoEngine};
pub use memory::MemDevice;

/// A byte-addressable device.
///
/// Reads beyond the end of the device fill with zeros; writes beyond the end
/// extend it.
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> DeviceResult<()>;

    /// Write `bytes` starting at `offset`.
    fn write_at(&self, offset: u64, bytes: &[u8]) -> DeviceResult<()>;

    /// Make completed writes durable.
    fn flush(&self) -> DeviceResult<()>;

    /// Current device length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Master devices of one filesystem, addressed by ordinal.
#[derive(Debug, Clone, Default)]
pub struct MasterSet {
    devices: Vec<Arc<dyn BlockDevice>>,
}

impl MasterSet {
    pub fn new(devices: Vec<Arc<dyn BlockDevice>>) -> Self {
        Self { devices }
    }

    /// A set with a single device at ordinal 0.
    pub fn single(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            devices: vec![device],
        }
    }

    /// Device at `ordinal`.
    pub fn get(&self, ordinal: u8) -> DeviceResult<&Arc<dyn BlockDevice>> {
        self.devices
            .get(ordinal as usize)
            .ok_or(DeviceError::UnknownOrdinal(ordinal))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Flush every device.
    pub fn flush_all(&self) -> DeviceResult<()> {
        for dev in &self.devices {
            dev.flush()?;
        }
        Ok(())
    }
}
