//! Dense fixed-width entry index.
//!
//! One 32-byte record per entry, stored at the absolute slot
//! `16 + (index - 1) * 32` of the `index` file behind a small header
//! `{magic, version, first_index}`. Appends write the new record and
//! zero the following slot so a recovery walk always finds a
//! terminator; prefix truncation rewrites only the header and leaves
//! the dropped slots as dead bytes.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use tracing::warn;

use crate::error::{WalError, WalResult};
use crate::fs::Layout;

const INDEX_MAGIC: u32 = 0x4B4C_4958; // "KLIX"
const INDEX_VERSION: u32 = 1;
const INDEX_HEADER_SIZE: u64 = 16;
pub(crate) const INDEX_RECORD_SIZE: u64 = 32;

/// Snapshot marker bit in the record flags word.
pub const FLAG_SNAPSHOT: u32 = 1 << 0;

/// Location and shape of one entry: `{address, length, term,
/// timestamp, flags}`, little-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub address: u64,
    pub length: u32,
    pub term: u64,
    pub timestamp: i64,
    pub flags: u32,
}

impl IndexRecord {
    #[inline]
    pub fn is_snapshot(&self) -> bool {
        self.flags & FLAG_SNAPSHOT != 0
    }

    #[inline]
    pub fn end_address(&self) -> u64 {
        self.address + self.length as u64
    }

    fn encode(&self, buf: &mut [u8; INDEX_RECORD_SIZE as usize]) {
        buf[0..8].copy_from_slice(&self.address.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..20].copy_from_slice(&self.term.to_le_bytes());
        buf[20..28].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[28..32].copy_from_slice(&self.flags.to_le_bytes());
    }

    fn decode(buf: &[u8; INDEX_RECORD_SIZE as usize]) -> WalResult<Self> {
        let short = || WalError::integrity("index record too short");
        Ok(Self {
            address: u64::from_le_bytes(buf[0..8].try_into().map_err(|_| short())?),
            length: u32::from_le_bytes(buf[8..12].try_into().map_err(|_| short())?),
            term: u64::from_le_bytes(buf[12..20].try_into().map_err(|_| short())?),
            timestamp: i64::from_le_bytes(buf[20..28].try_into().map_err(|_| short())?),
            flags: u32::from_le_bytes(buf[28..32].try_into().map_err(|_| short())?),
        })
    }

    fn is_vacant(buf: &[u8; INDEX_RECORD_SIZE as usize]) -> bool {
        buf.iter().all(|byte| *byte == 0)
    }
}

/// What the recovery walk found in an existing index file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    pub recovered: u64,
    pub truncated: bool,
}

/// Mapping from entry index to its [`IndexRecord`], persisted densely
/// and mirrored in memory for O(1) lookups.
pub struct EntryIndex {
    file: File,
    path: PathBuf,
    first_index: u64,
    records: VecDeque<IndexRecord>,
}

impl EntryIndex {
    /// Opens or creates the index file and replays its records.
    ///
    /// The walk starts at the header's `first_index` and accepts
    /// records while the address chain stays contiguous and inside
    /// `allocated_end`; the first vacant or inconsistent slot
    /// terminates it.
    pub fn open(layout: &Layout, allocated_end: u64) -> WalResult<(Self, RecoveryReport)> {
        let path = layout.index_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| WalError::io_at(&path, 0, err))?;

        let len = file.metadata().map_err(WalError::from)?.len();
        let mut index = Self {
            file,
            path,
            first_index: 1,
            records: VecDeque::new(),
        };

        if len < INDEX_HEADER_SIZE {
            index.write_header()?;
            return Ok((index, RecoveryReport::default()));
        }

        index.first_index = index.read_header()?;
        let report = index.replay(len, allocated_end)?;
        Ok((index, report))
    }

    fn write_header(&self) -> WalResult<()> {
        let mut buf = [0u8; INDEX_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&INDEX_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&INDEX_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.first_index.to_le_bytes());
        self.file
            .write_at(&buf, 0)
            .map_err(|err| WalError::io_at(&self.path, 0, err))?;
        self.file.sync_data().map_err(WalError::from)?;
        Ok(())
    }

    fn read_header(&self) -> WalResult<u64> {
        let mut buf = [0u8; INDEX_HEADER_SIZE as usize];
        self.file
            .read_exact_at(&mut buf, 0)
            .map_err(|err| WalError::io_at(&self.path, 0, err))?;
        let short = || WalError::integrity("index header too short");
        let magic = u32::from_le_bytes(buf[0..4].try_into().map_err(|_| short())?);
        if magic != INDEX_MAGIC {
            return Err(WalError::integrity(format!(
                "index magic {magic:#010x} does not match {INDEX_MAGIC:#010x}"
            )));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().map_err(|_| short())?);
        if version != INDEX_VERSION {
            return Err(WalError::integrity(format!(
                "index version {version} unsupported (expected {INDEX_VERSION})"
            )));
        }
        let first_index = u64::from_le_bytes(buf[8..16].try_into().map_err(|_| short())?);
        if first_index == 0 {
            return Err(WalError::integrity("index first_index cannot be zero"));
        }
        Ok(first_index)
    }

    fn replay(&mut self, file_len: u64, allocated_end: u64) -> WalResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut cursor = self.first_index;
        let mut expected_address: Option<u64> = None;
        loop {
            let offset = Self::slot_offset(cursor);
            if offset + INDEX_RECORD_SIZE > file_len {
                break;
            }
            let mut buf = [0u8; INDEX_RECORD_SIZE as usize];
            self.file
                .read_exact_at(&mut buf, offset)
                .map_err(|err| WalError::io_at(&self.path, offset, err))?;
            if IndexRecord::is_vacant(&buf) {
                break;
            }
            let record = IndexRecord::decode(&buf)?;
            if record.length == 0 || record.end_address() > allocated_end {
                report.truncated = true;
                break;
            }
            if let Some(expected) = expected_address {
                if record.address != expected {
                    report.truncated = true;
                    break;
                }
            }
            expected_address = Some(record.end_address());
            self.records.push_back(record);
            report.recovered += 1;
            cursor += 1;
        }
        if report.truncated {
            warn!(
                first = self.first_index,
                recovered = report.recovered,
                "index replay stopped at an inconsistent record"
            );
        }
        Ok(report)
    }

    #[inline]
    fn slot_offset(index: u64) -> u64 {
        INDEX_HEADER_SIZE + (index - 1) * INDEX_RECORD_SIZE
    }

    #[inline]
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Index of the newest entry, or `first_index - 1` when empty
    /// (0 on a fresh log).
    #[inline]
    pub fn last_index(&self) -> u64 {
        self.first_index + self.records.len() as u64 - 1
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends the record at the next index and returns that index.
    /// The slot after it is zeroed in the same write so a crashed run
    /// recovers up to exactly this record.
    pub fn append(&mut self, record: IndexRecord) -> WalResult<u64> {
        let index = self.last_index() + 1;
        let mut buf = [0u8; 2 * INDEX_RECORD_SIZE as usize];
        let mut slot = [0u8; INDEX_RECORD_SIZE as usize];
        record.encode(&mut slot);
        buf[..INDEX_RECORD_SIZE as usize].copy_from_slice(&slot);
        let offset = Self::slot_offset(index);
        self.file
            .write_at(&buf, offset)
            .map_err(|err| WalError::io_at(&self.path, offset, err))?;
        self.records.push_back(record);
        Ok(index)
    }

    pub fn lookup(&self, index: u64) -> Option<IndexRecord> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.records
            .get((index - self.first_index) as usize)
            .copied()
    }

    /// Lazy sequence of `(index, record)` over `[from..to]`, clamped
    /// to the live range.
    pub fn range(&self, from: u64, to: u64) -> impl Iterator<Item = (u64, IndexRecord)> + '_ {
        let lo = from.max(self.first_index);
        let hi = to.min(self.last_index());
        (lo..=hi).filter_map(move |index| self.lookup(index).map(|record| (index, record)))
    }

    /// Drops records at and above `from` and zeroes its slot so the
    /// old suffix can never be replayed. Returns the dropped count.
    pub fn truncate_suffix(&mut self, from: u64) -> WalResult<u64> {
        if from > self.last_index() {
            return Ok(0);
        }
        let from = from.max(self.first_index);
        let keep = (from - self.first_index) as usize;
        let dropped = self.records.len() - keep;
        self.records.truncate(keep);
        let zero = [0u8; INDEX_RECORD_SIZE as usize];
        let offset = Self::slot_offset(from);
        self.file
            .write_at(&zero, offset)
            .map_err(|err| WalError::io_at(&self.path, offset, err))?;
        self.file.sync_data().map_err(WalError::from)?;
        Ok(dropped as u64)
    }

    /// Drops records below `below` (exclusive bound) by advancing the
    /// header's `first_index`. Dead slots are not rewritten.
    pub fn truncate_prefix(&mut self, below: u64) -> WalResult<u64> {
        if below <= self.first_index {
            return Ok(0);
        }
        let below = below.min(self.last_index() + 1);
        let dropped = below - self.first_index;
        for _ in 0..dropped {
            self.records.pop_front();
        }
        self.first_index = below;
        self.write_header()?;
        Ok(dropped)
    }

    /// Makes every written record durable.
    pub fn sync(&self) -> WalResult<()> {
        self.file.sync_data().map_err(WalError::from)
    }
}
