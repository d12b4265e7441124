//! File-backed block device

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::errors::{DeviceError, DeviceResult};
use super::BlockDevice;

/// A regular file used as a block device.
///
/// Reads past end of file return zeros; writes past end of file extend it.
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDevice {
    /// Open (creating if missing) the file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Create the file at `path` with `len` zero bytes, replacing any contents.
    pub fn create(path: &Path, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> DeviceResult<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let len = buf.len();
        let map_err = |source| DeviceError::Read {
            offset,
            len,
            source,
        };

        file.seek(SeekFrom::Start(offset)).map_err(map_err)?;

        let mut filled = 0;
        while filled < len {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_err(e)),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> DeviceResult<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let map_err = |source| DeviceError::Write {
            offset,
            len: bytes.len(),
            source,
        };

        file.seek(SeekFrom::Start(offset)).map_err(map_err)?;
        file.write_all(bytes).map_err(map_err)
    }

    fn flush(&self) -> DeviceResult<()> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.sync_data().map_err(DeviceError::Flush)
    }

    fn len(&self) -> u64 {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.metadata().map(|m| m.len()).unwrap_or(0)
    }
}
