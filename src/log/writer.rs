//! Physical log writer
//!
//! Records are appended to an in-memory buffer and handed to the I/O engine
//! in one batch by `issue`. Positions are LSNs: byte counts since format that
//! never wrap, mapped onto the circular region by `lsn % region_size`.
//!
//! Space accounting:
//! - used = tail - head
//! - free = region_size - used
//! - `trim_head` moves the head forward and rewrites the header

use std::sync::Arc;

use crate::device::{BlockDevice, IoBuffer, IoCompletion, IoEngine};

use super::delta::{DeltaData, DeltaKind, DeltaRange};
use super::errors::{LogError, LogResult};
use super::record::{LogHeader, LogRecord, RecordBody};

/// Appends records to the circular log region.
#[derive(Debug)]
pub struct LogWriter {
    device: Arc<dyn BlockDevice>,
    io: Arc<IoEngine>,
    header: LogHeader,
    /// LSN past the last appended record, including the unissued buffer.
    tail: u64,
    /// LSN up to which records have been handed to the I/O engine.
    issued: u64,
    pending: Vec<u8>,
    last_tid: u64,
}

impl LogWriter {
    /// Writer continuing at `tail` with `header` as the current header.
    pub fn new(device: Arc<dyn BlockDevice>, io: Arc<IoEngine>, header: LogHeader, tail: u64) -> Self {
        let last_tid = header.next_tid.saturating_sub(1);
        Self {
            device,
            io,
            header,
            tail,
            issued: tail,
            pending: Vec::new(),
            last_tid,
        }
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn head(&self) -> u64 {
        self.header.head_lsn
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn region_size(&self) -> u64 {
        self.header.region_size
    }

    pub fn used(&self) -> u64 {
        self.tail - self.header.head_lsn
    }

    pub fn free(&self) -> u64 {
        self.region_size() - self.used()
    }

    /// Whether more than `fraction` of the region is in use.
    pub fn nearly_full(&self, fraction: f64) -> bool {
        self.used() as f64 > self.region_size() as f64 * fraction
    }

    /// Bytes appended but not yet issued.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn append(&mut self, tid: u64, body: RecordBody) -> LogResult<u64> {
        let record = LogRecord {
            lsn: self.tail,
            tid,
            body,
        };
        let len = record.encoded_len() as u64;
        if len > self.free() {
            return Err(LogError::log_full(len, self.free()));
        }
        record.encode_into(&mut self.pending);
        self.tail += len;
        Ok(record.lsn)
    }

    /// Append a delta record; returns its LSN.
    pub fn append_delta(
        &mut self,
        tid: u64,
        range: DeltaRange,
        kind: DeltaKind,
        data: DeltaData,
    ) -> LogResult<u64> {
        self.append(tid, RecordBody::Delta { range, kind, data })
    }

    /// Append the commit record closing epoch `tid`; returns its LSN.
    pub fn append_commit(&mut self, tid: u64, delta_count: u32) -> LogResult<u64> {
        let lsn = self.append(tid, RecordBody::Commit { delta_count })?;
        self.last_tid = tid;
        Ok(lsn)
    }

    /// Hand the buffered records to the I/O engine as synchronous writes.
    /// A batch crossing the end of the region is split in two.
    pub fn issue(&mut self) -> Vec<IoCompletion> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let bytes: Arc<[u8]> = Arc::from(std::mem::take(&mut self.pending));
        let start = self.issued;
        self.issued = self.tail;

        let region = self.region_size();
        let first_len = (region - start % region).min(bytes.len() as u64) as usize;

        let mut completions = vec![self.io.submit_write(
            &self.device,
            self.physical(start),
            IoBuffer::Shared {
                data: bytes.clone(),
                start: 0,
                len: first_len,
            },
            true,
        )];
        if first_len < bytes.len() {
            let rest = bytes.len() - first_len;
            completions.push(self.io.submit_write(
                &self.device,
                self.header.region_offset,
                IoBuffer::Shared {
                    data: bytes,
                    start: first_len,
                    len: rest,
                },
                true,
            ));
        }
        completions
    }

    /// Move the head to `lsn` and persist the header. Returns whether the
    /// head moved.
    pub fn trim_head(&mut self, lsn: u64) -> LogResult<bool> {
        let lsn = lsn.min(self.tail);
        if lsn <= self.header.head_lsn {
            return Ok(false);
        }
        self.header.head_lsn = lsn;
        self.write_header()?;
        Ok(true)
    }

    /// Persist the current header.
    pub fn write_header(&mut self) -> LogResult<()> {
        self.header.next_tid = self.header.next_tid.max(self.last_tid + 1);
        self.io
            .submit_write(&self.device, 0, IoBuffer::Owned(self.header.encode()), true)
            .wait()
            .map(|_| ())
            .map_err(|e| LogError::io_failed("log header write failed", e))
    }

    fn physical(&self, lsn: u64) -> u64 {
        self.header.region_offset + lsn % self.region_size()
    }
}

/// Wait for every completion, returning the first failure.
pub fn wait_all(completions: Vec<IoCompletion>, what: &str) -> LogResult<()> {
    let mut first_err = None;
    for completion in completions {
        if let Err(e) = completion.wait() {
            if first_err.is_none() {
                first_err = Some(LogError::io_failed(format!("{} failed", what), e));
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::log::record::{commit_record_len, delta_record_len, HEADER_SIZE};

    fn setup(log_size: u64) -> (Arc<MemDevice>, LogWriter) {
        let raw = Arc::new(MemDevice::new(log_size as usize));
        let dev: Arc<dyn BlockDevice> = raw.clone();
        let header = LogHeader::new(log_size).unwrap();
        let writer = LogWriter::new(dev, Arc::new(IoEngine::new(1)), header, 0);
        (raw, writer)
    }

    fn bytes(b: &[u8]) -> DeltaData {
        DeltaData::Bytes(Arc::from(b))
    }

    #[test]
    fn test_append_assigns_consecutive_lsns() {
        let (_, mut writer) = setup(8192);
        let a = writer
            .append_delta(1, DeltaRange::new(0, 0, 4), DeltaKind::Inode, bytes(b"abcd"))
            .unwrap();
        let c = writer.append_commit(1, 1).unwrap();

        assert_eq!(a, 0);
        assert_eq!(c, delta_record_len(4) as u64);
        assert_eq!(writer.tail(), (delta_record_len(4) + commit_record_len()) as u64);
        assert_eq!(writer.pending_len() as u64, writer.tail());
    }

    #[test]
    fn test_issue_writes_after_header() {
        let (raw, mut writer) = setup(8192);
        writer.append_commit(1, 0).unwrap();
        wait_all(writer.issue(), "commit").unwrap();

        assert_eq!(raw.write_log(), vec![(HEADER_SIZE, commit_record_len())]);
        assert_eq!(raw.flush_count(), 1);
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn test_batch_crossing_region_end_is_split() {
        let log_size = HEADER_SIZE + 100;
        let raw = Arc::new(MemDevice::new(log_size as usize));
        let dev: Arc<dyn BlockDevice> = raw.clone();
        let mut header = LogHeader::new(4096).unwrap();
        header.region_size = 100;
        header.head_lsn = 90;
        let mut writer = LogWriter::new(dev, Arc::new(IoEngine::new(1)), header, 90);

        writer.append_commit(5, 0).unwrap();
        wait_all(writer.issue(), "commit").unwrap();

        let len = commit_record_len();
        assert_eq!(
            raw.write_log(),
            vec![(HEADER_SIZE + 90, 10), (HEADER_SIZE, len - 10)]
        );
    }

    #[test]
    fn test_append_refuses_when_full() {
        let (_, mut writer) = setup(HEADER_SIZE * 2 + 64);
        let err = writer
            .append_delta(1, DeltaRange::new(0, 0, 600), DeltaKind::Inode, bytes(&[0; 600]))
            .unwrap_err();
        assert_eq!(err.code(), crate::log::errors::LogErrorCode::LogFull);
        assert_eq!(writer.tail(), 0);
    }

    #[test]
    fn test_trim_head_persists_header() {
        let (raw, mut writer) = setup(8192);
        writer.append_commit(1, 0).unwrap();
        wait_all(writer.issue(), "commit").unwrap();

        let tail = writer.tail();
        assert!(writer.trim_head(tail).unwrap());
        assert!(!writer.trim_head(tail).unwrap());
        assert_eq!(writer.used(), 0);

        let header = LogHeader::decode(&raw.snapshot()[..HEADER_SIZE as usize]).unwrap();
        assert_eq!(header.head_lsn, tail);
        assert_eq!(header.next_tid, 2);
    }

    #[test]
    fn test_nearly_full() {
        let (_, mut writer) = setup(HEADER_SIZE + 1000);
        assert!(!writer.nearly_full(0.5));
        writer
            .append_delta(1, DeltaRange::new(0, 0, 500), DeltaKind::Inode, bytes(&[1; 500]))
            .unwrap();
        assert!(writer.nearly_full(0.5));
    }

    #[test]
    fn test_wait_all_reports_failure() {
        let (raw, mut writer) = setup(8192);
        raw.fail_writes(true);
        writer.append_commit(1, 0).unwrap();
        let err = wait_all(writer.issue(), "commit write").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.message().contains("commit write"));
    }
}
