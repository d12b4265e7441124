//! Sequential log scanner
//!
//! Walks the circular region from a starting LSN. The scan ends at the first
//! position that does not hold a plausible, intact record written at that
//! LSN: a torn write, a stale record from an earlier lap, or never-written
//! space all look the same and all end the log.

use std::sync::Arc;

use crate::device::BlockDevice;

use super::errors::{LogError, LogResult};
use super::record::{min_record_len, LogHeader, LogRecord, FRAME_LEN_BYTES};

/// Why a scan stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Read the whole region.
    RegionExhausted,
    /// Length prefix outside the plausible range.
    BadLength(usize),
    /// Intact frame whose stored LSN is from another lap.
    LsnMismatch { expected: u64, found: u64 },
    /// Frame failed to decode.
    Corrupt(String),
}

/// Reads records from the log region.
#[derive(Debug)]
pub struct LogReader {
    device: Arc<dyn BlockDevice>,
    region_offset: u64,
    region_size: u64,
    start: u64,
    lsn: u64,
    stop: Option<ScanStop>,
}

impl LogReader {
    /// Reader positioned at `header.head_lsn`.
    pub fn new(device: Arc<dyn BlockDevice>, header: &LogHeader) -> Self {
        Self::at(device, header, header.head_lsn)
    }

    pub fn at(device: Arc<dyn BlockDevice>, header: &LogHeader, lsn: u64) -> Self {
        Self {
            device,
            region_offset: header.region_offset,
            region_size: header.region_size,
            start: lsn,
            lsn,
            stop: None,
        }
    }

    /// LSN of the next record to read.
    pub fn position(&self) -> u64 {
        self.lsn
    }

    /// Why the scan ended, once it has.
    pub fn stop_reason(&self) -> Option<&ScanStop> {
        self.stop.as_ref()
    }

    /// Read the next record; `Ok(None)` at the end of the log.
    pub fn read_next(&mut self) -> LogResult<Option<LogRecord>> {
        if self.stop.is_some() {
            return Ok(None);
        }
        let remaining = self.region_size - (self.lsn - self.start);
        if remaining < min_record_len() as u64 {
            return self.finish(ScanStop::RegionExhausted);
        }

        let mut prefix = [0u8; FRAME_LEN_BYTES];
        self.read_wrapped(self.lsn, &mut prefix)?;
        let len = u32::from_le_bytes(prefix) as usize;
        if len < min_record_len() || len as u64 > remaining {
            return self.finish(ScanStop::BadLength(len));
        }

        let mut frame = vec![0u8; len];
        self.read_wrapped(self.lsn, &mut frame)?;
        let record = match LogRecord::decode(self.lsn, &frame) {
            Ok(record) => record,
            Err(e) => return self.finish(ScanStop::Corrupt(e.to_string())),
        };
        if record.lsn != self.lsn {
            return self.finish(ScanStop::LsnMismatch {
                expected: self.lsn,
                found: record.lsn,
            });
        }

        self.lsn += len as u64;
        Ok(Some(record))
    }

    /// Read every remaining record.
    pub fn read_all(&mut self) -> LogResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_next()? {
            records.push(record);
        }
        Ok(records)
    }

    fn finish(&mut self, reason: ScanStop) -> LogResult<Option<LogRecord>> {
        self.stop = Some(reason);
        Ok(None)
    }

    fn read_wrapped(&self, lsn: u64, buf: &mut [u8]) -> LogResult<()> {
        let pos = lsn % self.region_size;
        let first = ((self.region_size - pos) as usize).min(buf.len());
        let (head, rest) = buf.split_at_mut(first);
        self.device
            .read_at(self.region_offset + pos, head)
            .map_err(|e| LogError::io_failed("log read failed", e))?;
        if !rest.is_empty() {
            self.device
                .read_at(self.region_offset, rest)
                .map_err(|e| LogError::io_failed("log read failed", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{IoEngine, MemDevice};
    use crate::log::delta::{DeltaData, DeltaKind, DeltaRange};
    use crate::log::record::RecordBody;
    use crate::log::writer::{wait_all, LogWriter};

    fn write_epoch(writer: &mut LogWriter, tid: u64, payloads: &[&[u8]]) {
        for (i, p) in payloads.iter().enumerate() {
            writer
                .append_delta(
                    tid,
                    DeltaRange::new(0, i as u64 * 512, p.len() as u64),
                    DeltaKind::Inode,
                    DeltaData::Bytes(Arc::from(*p)),
                )
                .unwrap();
        }
        writer.append_commit(tid, payloads.len() as u32).unwrap();
        wait_all(writer.issue(), "test write").unwrap();
    }

    #[test]
    fn test_reads_back_written_records() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(8192));
        let header = LogHeader::new(8192).unwrap();
        let mut writer = LogWriter::new(dev.clone(), Arc::new(IoEngine::new(1)), header.clone(), 0);
        write_epoch(&mut writer, 1, &[b"one", b"two"]);

        let mut reader = LogReader::new(dev, &header);
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[2].body, RecordBody::Commit { delta_count: 2 }));
        assert_eq!(reader.position(), writer.tail());
        assert!(matches!(reader.stop_reason(), Some(ScanStop::BadLength(0))));
    }

    #[test]
    fn test_reads_across_region_wrap() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096));
        let mut header = LogHeader::new(4096).unwrap();
        header.region_size = 200;
        header.head_lsn = 170;
        let mut writer = LogWriter::new(dev.clone(), Arc::new(IoEngine::new(1)), header.clone(), 170);
        write_epoch(&mut writer, 4, &[b"wrapping payload"]);

        let mut reader = LogReader::new(dev, &header);
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lsn, 170);
        match &records[0].body {
            RecordBody::Delta { data, .. } => {
                assert_eq!(data, &DeltaData::Bytes(Arc::from(&b"wrapping payload"[..])))
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_stale_lap_stops_scan() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(8192));
        let header = LogHeader::new(8192).unwrap();
        let mut writer = LogWriter::new(dev.clone(), Arc::new(IoEngine::new(1)), header.clone(), 0);
        write_epoch(&mut writer, 1, &[b"x"]);

        // Same bytes, read as if one lap later.
        let mut later = header.clone();
        later.head_lsn = header.region_size;
        let mut reader = LogReader::new(dev, &later);
        assert!(reader.read_next().unwrap().is_none());
        assert!(matches!(
            reader.stop_reason(),
            Some(ScanStop::LsnMismatch { .. })
        ));
    }

    #[test]
    fn test_torn_record_stops_scan() {
        let raw = Arc::new(MemDevice::new(8192));
        let dev: Arc<dyn BlockDevice> = raw.clone();
        let header = LogHeader::new(8192).unwrap();
        let mut writer = LogWriter::new(dev.clone(), Arc::new(IoEngine::new(1)), header.clone(), 0);
        write_epoch(&mut writer, 1, &[b"first"]);
        let second_start = writer.tail();
        write_epoch(&mut writer, 2, &[b"second"]);

        // Tear the second epoch's delta payload.
        let off = header.region_offset + second_start + 40;
        raw.write_at(off, &[0xee]).unwrap();

        let mut reader = LogReader::new(dev, &header);
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(reader.stop_reason(), Some(ScanStop::Corrupt(_))));
    }

    #[test]
    fn test_read_failure_is_error() {
        let raw = Arc::new(MemDevice::new(8192));
        raw.fail_reads(true);
        let dev: Arc<dyn BlockDevice> = raw;
        let header = LogHeader::new(8192).unwrap();
        let mut reader = LogReader::new(dev, &header);
        assert!(reader.read_next().is_err());
    }
}
