//! On-log record formats
//!
//! The log device starts with one header sector followed by the circular
//! record region. Every record has the same frame:
//! - Record Length (u32 LE), whole frame including checksum
//! - Record Kind (u8): DELTA / COMMIT
//! - LSN (u64 LE), the record's position in the log
//! - Transaction id (u64 LE)
//! - Body (variable)
//! - Checksum (u32 LE) over everything before it
//!
//! Delta body: ordinal (u8), delta kind (u8), flags (u8), offset (u64 LE),
//! length (u32 LE), then `length` payload bytes unless the zero-fill flag is
//! set. Commit body: number of delta records in the epoch (u32 LE).

use std::io::{Cursor, Read};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::checksum::{compute_checksum, verify_checksum};
use super::delta::{DeltaData, DeltaKind, DeltaRange};
use super::errors::{LogError, LogResult};

pub const LOG_MAGIC: &[u8; 8] = b"SAMWLOG1";
pub const LOG_VERSION: u32 = 1;
/// Bytes reserved for the header at the start of the log device.
pub const HEADER_SIZE: u64 = 512;

/// Length + kind + lsn + tid + checksum.
pub const RECORD_OVERHEAD: usize = 4 + 1 + 8 + 8 + 4;
const DELTA_BODY_FIXED: usize = 1 + 1 + 1 + 8 + 4;
const COMMIT_BODY: usize = 4;

const FLAG_ZERO_FILL: u8 = 0x01;

/// Log header, rewritten on every head trim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogHeader {
    pub version: u32,
    pub log_id: Uuid,
    /// Device offset of the record region.
    pub region_offset: u64,
    pub region_size: u64,
    /// Oldest LSN recovery must replay from.
    pub head_lsn: u64,
    /// First transaction id not yet used.
    pub next_tid: u64,
    pub created_at: DateTime<Utc>,
}

impl LogHeader {
    /// Header for a freshly formatted log of `log_size` bytes.
    pub fn new(log_size: u64) -> LogResult<Self> {
        if log_size <= HEADER_SIZE * 2 {
            return Err(LogError::invalid_config(format!(
                "log size {} is too small",
                log_size
            )));
        }
        Ok(Self {
            version: LOG_VERSION,
            log_id: Uuid::new_v4(),
            region_offset: HEADER_SIZE,
            region_size: log_size - HEADER_SIZE,
            head_lsn: 0,
            next_tid: 1,
            created_at: Utc::now(),
        })
    }

    /// Encode into one header sector.
    pub fn encode(&self) -> Vec<u8> {
        let created = self.created_at.to_rfc3339();
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        buf.extend_from_slice(LOG_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(self.log_id.as_bytes());
        buf.extend_from_slice(&self.region_offset.to_le_bytes());
        buf.extend_from_slice(&self.region_size.to_le_bytes());
        buf.extend_from_slice(&self.head_lsn.to_le_bytes());
        buf.extend_from_slice(&self.next_tid.to_le_bytes());
        buf.extend_from_slice(&(created.len() as u16).to_le_bytes());
        buf.extend_from_slice(created.as_bytes());
        let checksum = compute_checksum(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    /// Decode and verify a header sector.
    pub fn decode(data: &[u8]) -> LogResult<Self> {
        let bad = |what: &str| LogError::corruption(format!("log header: {}", what));

        if data.len() < 8 || &data[..8] != LOG_MAGIC {
            return Err(bad("bad magic"));
        }
        let mut cursor = Cursor::new(data);
        cursor.set_position(8);
        let short = |_| bad("truncated");

        let version = read_u32(&mut cursor).map_err(short)?;
        if version != LOG_VERSION {
            return Err(bad(&format!("unsupported version {}", version)));
        }
        let mut id = [0u8; 16];
        cursor.read_exact(&mut id).map_err(short)?;
        let region_offset = read_u64(&mut cursor).map_err(short)?;
        let region_size = read_u64(&mut cursor).map_err(short)?;
        let head_lsn = read_u64(&mut cursor).map_err(short)?;
        let next_tid = read_u64(&mut cursor).map_err(short)?;
        let created_len = read_u16(&mut cursor).map_err(short)? as usize;
        let mut created = vec![0u8; created_len];
        cursor.read_exact(&mut created).map_err(short)?;

        let covered = cursor.position() as usize;
        let stored = read_u32(&mut cursor).map_err(short)?;
        if !verify_checksum(&data[..covered], stored) {
            return Err(bad("checksum mismatch"));
        }

        let created = String::from_utf8(created).map_err(|_| bad("bad timestamp"))?;
        let created_at = DateTime::parse_from_rfc3339(&created)
            .map_err(|_| bad("bad timestamp"))?
            .with_timezone(&Utc);

        if region_size == 0 {
            return Err(bad("empty region"));
        }

        Ok(Self {
            version,
            log_id: Uuid::from_bytes(id),
            region_offset,
            region_size,
            head_lsn,
            next_tid,
            created_at,
        })
    }
}

/// Record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Delta = 1,
    Commit = 2,
}

impl RecordKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::Delta),
            2 => Some(RecordKind::Commit),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Delta {
        range: DeltaRange,
        kind: DeltaKind,
        data: DeltaData,
    },
    Commit {
        delta_count: u32,
    },
}

/// One framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: u64,
    pub tid: u64,
    pub body: RecordBody,
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        match self.body {
            RecordBody::Delta { .. } => RecordKind::Delta,
            RecordBody::Commit { .. } => RecordKind::Commit,
        }
    }

    /// Size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        match &self.body {
            RecordBody::Delta { data, .. } => delta_record_len(data.logged_len()),
            RecordBody::Commit { .. } => commit_record_len(),
        }
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.extend_from_slice(&(self.encoded_len() as u32).to_le_bytes());
        buf.push(self.kind().as_u8());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.tid.to_le_bytes());

        match &self.body {
            RecordBody::Delta { range, kind, data } => {
                buf.push(range.ordinal);
                buf.push(kind.as_u8());
                let flags = match data {
                    DeltaData::Zeroes => FLAG_ZERO_FILL,
                    DeltaData::Bytes(_) => 0,
                };
                buf.push(flags);
                buf.extend_from_slice(&range.offset.to_le_bytes());
                buf.extend_from_slice(&(range.len as u32).to_le_bytes());
                if let DeltaData::Bytes(bytes) = data {
                    buf.extend_from_slice(bytes);
                }
            }
            RecordBody::Commit { delta_count } => {
                buf.extend_from_slice(&delta_count.to_le_bytes());
            }
        }

        let checksum = compute_checksum(&buf[start..]);
        buf.extend_from_slice(&checksum.to_le_bytes());
    }

    /// Decode one complete frame. `lsn` is the position it was read from and
    /// is reported in errors.
    pub fn decode(lsn: u64, frame: &[u8]) -> LogResult<Self> {
        if frame.len() < RECORD_OVERHEAD {
            return Err(LogError::corruption_at_lsn(lsn, "record shorter than its frame"));
        }
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared != frame.len() {
            return Err(LogError::corruption_at_lsn(lsn, "record length mismatch"));
        }

        let body_end = frame.len() - 4;
        let stored = u32::from_le_bytes([
            frame[body_end],
            frame[body_end + 1],
            frame[body_end + 2],
            frame[body_end + 3],
        ]);
        if !verify_checksum(&frame[..body_end], stored) {
            return Err(LogError::corruption_at_lsn(lsn, "record checksum mismatch"));
        }

        let truncated = |_| LogError::corruption_at_lsn(lsn, "record body truncated");
        let mut cursor = Cursor::new(&frame[4..body_end]);
        let kind = read_u8(&mut cursor).map_err(truncated)?;
        let record_lsn = read_u64(&mut cursor).map_err(truncated)?;
        let tid = read_u64(&mut cursor).map_err(truncated)?;

        let body = match RecordKind::from_u8(kind) {
            Some(RecordKind::Delta) => {
                let ordinal = read_u8(&mut cursor).map_err(truncated)?;
                let delta_kind = read_u8(&mut cursor).map_err(truncated)?;
                let flags = read_u8(&mut cursor).map_err(truncated)?;
                let offset = read_u64(&mut cursor).map_err(truncated)?;
                let len = read_u32(&mut cursor).map_err(truncated)? as u64;
                let kind = DeltaKind::from_u8(delta_kind).ok_or_else(|| {
                    LogError::corruption_at_lsn(lsn, format!("unknown delta kind {}", delta_kind))
                })?;
                let data = if flags & FLAG_ZERO_FILL != 0 {
                    DeltaData::Zeroes
                } else {
                    let mut bytes = vec![0u8; len as usize];
                    cursor.read_exact(&mut bytes).map_err(truncated)?;
                    DeltaData::Bytes(Arc::from(bytes))
                };
                RecordBody::Delta {
                    range: DeltaRange::new(ordinal, offset, len),
                    kind,
                    data,
                }
            }
            Some(RecordKind::Commit) => RecordBody::Commit {
                delta_count: read_u32(&mut cursor).map_err(truncated)?,
            },
            None => {
                return Err(LogError::corruption_at_lsn(
                    lsn,
                    format!("unknown record kind {}", kind),
                ))
            }
        };

        if cursor.position() as usize != body_end - 4 {
            return Err(LogError::corruption_at_lsn(lsn, "trailing bytes in record"));
        }

        Ok(Self {
            lsn: record_lsn,
            tid,
            body,
        })
    }
}

/// Encoded size of a delta record carrying `payload_len` bytes.
pub fn delta_record_len(payload_len: usize) -> usize {
    RECORD_OVERHEAD + DELTA_BODY_FIXED + payload_len
}

pub fn commit_record_len() -> usize {
    RECORD_OVERHEAD + COMMIT_BODY
}

/// Smallest valid frame, used to reject implausible lengths while scanning.
pub fn min_record_len() -> usize {
    commit_record_len()
}

/// Bytes of the length prefix, read before the rest of a frame.
pub const FRAME_LEN_BYTES: usize = 4;

fn read_u8(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u8> {
    let mut b = [0u8; 1];
    cursor.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u16> {
    let mut b = [0u8; 2];
    cursor.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u32> {
    let mut b = [0u8; 4];
    cursor.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u64> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(lsn: u64, tid: u64, bytes: &[u8]) -> LogRecord {
        LogRecord {
            lsn,
            tid,
            body: RecordBody::Delta {
                range: DeltaRange::new(1, 4096, bytes.len() as u64),
                kind: DeltaKind::Inode,
                data: DeltaData::Bytes(Arc::from(bytes)),
            },
        }
    }

    // ==================== Header Tests ====================

    #[test]
    fn test_header_decodes_what_it_encodes() {
        let mut header = LogHeader::new(1 << 20).unwrap();
        header.head_lsn = 12345;
        header.next_tid = 7;
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE as usize);

        let decoded = LogHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.head_lsn, 12345);
        assert_eq!(decoded.next_tid, 7);
        assert_eq!(decoded.log_id, header.log_id);
        assert_eq!(decoded.region_size, (1 << 20) - HEADER_SIZE);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let err = LogHeader::decode(&[0u8; 512]).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_header_rejects_corrupt_field() {
        let header = LogHeader::new(1 << 16).unwrap();
        let mut encoded = header.encode();
        encoded[40] ^= 0xff;
        assert!(LogHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_header_rejects_tiny_log() {
        assert!(LogHeader::new(HEADER_SIZE).is_err());
    }

    // ==================== Record Tests ====================

    #[test]
    fn test_delta_record_frame() {
        let record = delta(100, 3, b"abcd");
        let mut buf = Vec::new();
        record.encode_into(&mut buf);
        assert_eq!(buf.len(), delta_record_len(4));
        assert_eq!(LogRecord::decode(100, &buf).unwrap(), record);
    }

    #[test]
    fn test_zero_fill_delta_carries_no_payload() {
        let record = LogRecord {
            lsn: 0,
            tid: 1,
            body: RecordBody::Delta {
                range: DeltaRange::new(0, 0, 8192),
                kind: DeltaKind::AllocBlockZero,
                data: DeltaData::Zeroes,
            },
        };
        let mut buf = Vec::new();
        record.encode_into(&mut buf);
        assert_eq!(buf.len(), delta_record_len(0));
        assert_eq!(LogRecord::decode(0, &buf).unwrap(), record);
    }

    #[test]
    fn test_commit_record_frame() {
        let record = LogRecord {
            lsn: 64,
            tid: 9,
            body: RecordBody::Commit { delta_count: 2 },
        };
        let mut buf = Vec::new();
        record.encode_into(&mut buf);
        assert_eq!(buf.len(), commit_record_len());
        assert_eq!(LogRecord::decode(64, &buf).unwrap(), record);
    }

    #[test]
    fn test_flipped_payload_bit_is_corruption() {
        let mut buf = Vec::new();
        delta(0, 1, b"payload").encode_into(&mut buf);
        let n = buf.len();
        buf[n - 6] ^= 0x10;
        let err = LogRecord::decode(0, &buf).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut buf = Vec::new();
        delta(0, 1, b"payload").encode_into(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(LogRecord::decode(0, &buf).is_err());
    }
}
