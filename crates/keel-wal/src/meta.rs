//! Fixed-size voter-state record.
//!
//! The `metadata` file holds one 52-byte record: magic, version, term,
//! voted-for identity, committed and applied watermarks, checksum.
//! Every store replaces the file atomically (temp + rename + fsync of
//! the directory), so a crashed store leaves either the old or the
//! new record, never a torn one.

use std::io::Read;
use std::path::PathBuf;

use crc64fast_nvme::Digest;

use crate::config::NodeId;
use crate::error::{WalError, WalResult};
use crate::fs::{self, Layout};

const METADATA_MAGIC: u32 = 0x4B4C_4D44; // "KLMD"
const METADATA_VERSION: u32 = 1;
pub(crate) const METADATA_SIZE: usize = 52;

pub(crate) fn fold_crc64(value: u64) -> u32 {
    let upper = (value >> 32) as u32;
    let lower = value as u32;
    upper ^ lower
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut digest = Digest::new();
    digest.write(bytes);
    fold_crc64(digest.sum64())
}

/// Durable voter state plus the two watermarks the log anchors on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    pub term: u64,
    pub voted_for: NodeId,
    pub last_committed: u64,
    pub last_applied: u64,
}

impl MetadataRecord {
    fn encode(&self, buf: &mut [u8; METADATA_SIZE]) {
        buf.fill(0);
        buf[0..4].copy_from_slice(&METADATA_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&METADATA_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.term.to_le_bytes());
        buf[16..32].copy_from_slice(self.voted_for.as_bytes());
        buf[32..40].copy_from_slice(&self.last_committed.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_applied.to_le_bytes());
        let crc = checksum(&buf[..48]);
        buf[48..52].copy_from_slice(&crc.to_le_bytes());
    }

    fn decode(buf: &[u8; METADATA_SIZE]) -> WalResult<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().map_err(|_| WalError::integrity("metadata record too short"))?);
        if magic != METADATA_MAGIC {
            return Err(WalError::integrity(format!(
                "metadata magic {magic:#010x} does not match {METADATA_MAGIC:#010x}"
            )));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().map_err(|_| WalError::integrity("metadata record too short"))?);
        if version != METADATA_VERSION {
            return Err(WalError::integrity(format!(
                "metadata version {version} unsupported (expected {METADATA_VERSION})"
            )));
        }
        let stored_crc = u32::from_le_bytes(buf[48..52].try_into().map_err(|_| WalError::integrity("metadata record too short"))?);
        let computed = checksum(&buf[..48]);
        if stored_crc != computed {
            return Err(WalError::integrity(format!(
                "metadata checksum {stored_crc:#010x} does not match {computed:#010x}"
            )));
        }
        let mut voted_for = [0u8; 16];
        voted_for.copy_from_slice(&buf[16..32]);
        Ok(Self {
            term: u64::from_le_bytes(buf[8..16].try_into().map_err(|_| WalError::integrity("metadata record too short"))?),
            voted_for: NodeId::new(voted_for),
            last_committed: u64::from_le_bytes(buf[32..40].try_into().map_err(|_| WalError::integrity("metadata record too short"))?),
            last_applied: u64::from_le_bytes(buf[40..48].try_into().map_err(|_| WalError::integrity("metadata record too short"))?),
        })
    }
}

/// Loads and atomically replaces the metadata record.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    current: MetadataRecord,
}

impl MetadataStore {
    /// Reads the record at the layout's metadata path. A missing file
    /// yields the zero record for a fresh log; a present but corrupt
    /// record refuses to initialize.
    pub fn load_or_init(layout: &Layout) -> WalResult<Self> {
        let path = layout.metadata_path();
        let current = match std::fs::File::open(&path) {
            Ok(mut file) => {
                let mut buf = [0u8; METADATA_SIZE];
                file.read_exact(&mut buf)
                    .map_err(|err| WalError::io_at(&path, 0, err))?;
                MetadataRecord::decode(&buf)?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MetadataRecord::default(),
            Err(err) => return Err(WalError::io_at(&path, 0, err)),
        };
        Ok(Self { path, current })
    }

    #[inline]
    pub fn record(&self) -> MetadataRecord {
        self.current
    }

    /// Replaces the on-disk record. The write-ahead ordering contract
    /// requires callers to flush the entries a new committed watermark
    /// references before calling this.
    pub fn store(&mut self, record: MetadataRecord) -> WalResult<()> {
        let mut buf = [0u8; METADATA_SIZE];
        record.encode(&mut buf);
        fs::replace_file(&self.path, &buf)?;
        self.current = record;
        Ok(())
    }
}
