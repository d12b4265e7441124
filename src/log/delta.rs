//! Delta records
//!
//! A delta names a byte range on one master device that a transaction has
//! changed, the kind of metadata it holds, and where its new contents come
//! from.

use std::fmt;
use std::sync::Arc;

use super::errors::{LogError, LogResult};

/// A byte range on a master device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeltaRange {
    pub ordinal: u8,
    pub offset: u64,
    pub len: u64,
}

impl DeltaRange {
    pub fn new(ordinal: u8, offset: u64, len: u64) -> Self {
        Self {
            ordinal,
            offset,
            len,
        }
    }

    /// First byte past the range, clamped to `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    /// First byte past the range; an end beyond `u64::MAX` is an invalid
    /// delta.
    pub fn checked_end(&self) -> LogResult<u64> {
        self.offset.checked_add(self.len).ok_or_else(|| {
            LogError::invalid_delta(format!("{} ends past the last addressable byte", self))
        })
    }

    pub fn overlaps(&self, other: &DeltaRange) -> bool {
        self.ordinal == other.ordinal && self.offset < other.end() && other.offset < self.end()
    }

    pub fn contains(&self, other: &DeltaRange) -> bool {
        self.ordinal == other.ordinal && self.offset <= other.offset && other.end() <= self.end()
    }

    /// The part of this range inside `[start, end)`, if any.
    pub fn clip(&self, start: u64, end: u64) -> Option<DeltaRange> {
        let lo = self.offset.max(start);
        let hi = self.end().min(end);
        (lo < hi).then(|| DeltaRange::new(self.ordinal, lo, hi - lo))
    }

    /// Split at every multiple of `block_size`.
    pub fn split_at_blocks(&self, block_size: u64) -> Vec<DeltaRange> {
        let mut parts = Vec::new();
        let mut offset = self.offset;
        while offset < self.end() {
            let block_end = (offset / block_size + 1).saturating_mul(block_size);
            let end = block_end.min(self.end());
            parts.push(DeltaRange::new(self.ordinal, offset, end - offset));
            offset = end;
        }
        parts
    }
}

impl fmt::Display for DeltaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.ordinal, self.offset, self.len)
    }
}

/// What a delta's range holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Unassigned,
    Superblock,
    CylinderGroup,
    SummaryInfo,
    AllocBlock,
    /// A zero-filled allocation block
    AllocBlockZero,
    Directory,
    Inode,
    FbiWrite,
    QuotaRecord,
    UserData,
    Shadow,
}

impl DeltaKind {
    pub const ALL: [DeltaKind; 12] = [
        DeltaKind::Unassigned,
        DeltaKind::Superblock,
        DeltaKind::CylinderGroup,
        DeltaKind::SummaryInfo,
        DeltaKind::AllocBlock,
        DeltaKind::AllocBlockZero,
        DeltaKind::Directory,
        DeltaKind::Inode,
        DeltaKind::FbiWrite,
        DeltaKind::QuotaRecord,
        DeltaKind::UserData,
        DeltaKind::Shadow,
    ];

    pub fn as_u8(&self) -> u8 {
        match self {
            DeltaKind::Unassigned => 0,
            DeltaKind::Superblock => 1,
            DeltaKind::CylinderGroup => 2,
            DeltaKind::SummaryInfo => 3,
            DeltaKind::AllocBlock => 4,
            DeltaKind::AllocBlockZero => 5,
            DeltaKind::Directory => 6,
            DeltaKind::Inode => 7,
            DeltaKind::FbiWrite => 8,
            DeltaKind::QuotaRecord => 9,
            DeltaKind::UserData => 14,
            DeltaKind::Shadow => 16,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        DeltaKind::ALL.iter().copied().find(|k| k.as_u8() == value)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeltaKind::Unassigned => "unassigned",
            DeltaKind::Superblock => "superblock",
            DeltaKind::CylinderGroup => "cylinder_group",
            DeltaKind::SummaryInfo => "summary_info",
            DeltaKind::AllocBlock => "alloc_block",
            DeltaKind::AllocBlockZero => "alloc_block_zero",
            DeltaKind::Directory => "directory",
            DeltaKind::Inode => "inode",
            DeltaKind::FbiWrite => "fbi_write",
            DeltaKind::QuotaRecord => "quota_record",
            DeltaKind::UserData => "user_data",
            DeltaKind::Shadow => "shadow",
        }
    }
}

/// Reads the current contents of a range when the delta is pushed to the log.
pub type DeltaSource = Arc<dyn Fn(&DeltaRange) -> Vec<u8> + Send + Sync>;

/// Where a delta's new contents come from.
#[derive(Clone)]
pub enum DeltaPayload {
    /// The new bytes, exactly as long as the range.
    Bytes(Vec<u8>),
    /// The range becomes all zeros; nothing but the range is logged.
    Zeroes,
    /// Contents captured from the source at commit time.
    Source(DeltaSource),
}

impl DeltaPayload {
    /// Check the payload against the range it is declared for.
    pub fn validate(&self, range: &DeltaRange) -> LogResult<()> {
        range.checked_end()?;
        if range.len == 0 {
            return Err(LogError::invalid_delta(format!(
                "zero-length delta at {}",
                range
            )));
        }
        if let DeltaPayload::Bytes(bytes) = self {
            if bytes.len() as u64 != range.len {
                return Err(LogError::invalid_delta(format!(
                    "payload of {} bytes declared for {}",
                    bytes.len(),
                    range
                )));
            }
        }
        Ok(())
    }

    /// The part of the payload covering `part`, a sub-range of `whole`.
    pub fn slice(&self, whole: &DeltaRange, part: &DeltaRange) -> DeltaPayload {
        match self {
            DeltaPayload::Bytes(bytes) => {
                let start = (part.offset - whole.offset) as usize;
                DeltaPayload::Bytes(bytes[start..start + part.len as usize].to_vec())
            }
            DeltaPayload::Zeroes => DeltaPayload::Zeroes,
            DeltaPayload::Source(source) => DeltaPayload::Source(source.clone()),
        }
    }

    /// Materialize the contents for `range`.
    pub fn resolve(&self, range: &DeltaRange) -> DeltaData {
        match self {
            DeltaPayload::Bytes(bytes) => DeltaData::Bytes(Arc::from(bytes.as_slice())),
            DeltaPayload::Zeroes => DeltaData::Zeroes,
            DeltaPayload::Source(source) => {
                let mut bytes = source(range);
                bytes.resize(range.len as usize, 0);
                DeltaData::Bytes(Arc::from(bytes))
            }
        }
    }
}

impl fmt::Debug for DeltaPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeltaPayload::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            DeltaPayload::Zeroes => write!(f, "Zeroes"),
            DeltaPayload::Source(_) => write!(f, "Source"),
        }
    }
}

/// Resolved delta contents, shared between the log map and readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaData {
    Bytes(Arc<[u8]>),
    Zeroes,
}

impl DeltaData {
    /// Copy the bytes for `part` (inside `whole`) into `dst`.
    pub fn copy_into(&self, whole: &DeltaRange, part: &DeltaRange, dst: &mut [u8]) {
        match self {
            DeltaData::Bytes(bytes) => {
                let start = (part.offset - whole.offset) as usize;
                dst.copy_from_slice(&bytes[start..start + dst.len()]);
            }
            DeltaData::Zeroes => dst.fill(0),
        }
    }

    /// Bytes this delta occupies in a log record body.
    pub fn logged_len(&self) -> usize {
        match self {
            DeltaData::Bytes(bytes) => bytes.len(),
            DeltaData::Zeroes => 0,
        }
    }
}

/// A declared, not yet committed change.
#[derive(Debug, Clone)]
pub struct DeltaRecord {
    /// Declaration order across the whole unit.
    pub id: u64,
    pub range: DeltaRange,
    pub kind: DeltaKind,
    pub payload: DeltaPayload,
}
