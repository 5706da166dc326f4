//! Durable write-ahead log engine backing keel's raft consensus.
//!
//! The log stores an ordered sequence of term-stamped entries,
//! addressed by monotonically increasing 64-bit indices, on top of a
//! paged byte address space. It serves concurrent readers while a
//! single appender extends the tail, feeds committed entries to an
//! external state machine exactly once and in order, persists the
//! raft voter state, and compacts the applied prefix.
//!
//! ## Architecture Overview
//!
//! - **Page store**: fixed-size pages under `pages/`, either
//!   memory-mapped ([`MemoryMode::SharedMemory`]) or private
//!   anonymous buffers with explicit writeback
//!   ([`MemoryMode::PrivateMemory`]).
//! - **Address space**: logical 64-bit offsets split into
//!   `(page, offset)` pairs; range reads iterate page-sized chunks.
//! - **Entry index**: dense fixed-width records mapping an entry
//!   index to its address, length, term, timestamp and flags.
//! - **Metadata**: one checksummed record holding term, voted-for and
//!   the committed/applied watermarks, replaced atomically.
//! - **Lock manager**: weak/strong read, write, compaction and
//!   exclusive modes plus a read barrier, FIFO-fair and cancellable.
//! - **Apply loop**: a background task draining committed entries
//!   into the [`StateMachine`].
//!
//! ## Example
//!
//! ```no_run
//! use keel_wal::{Wal, WalConfig};
//!
//! # async fn demo() -> keel_wal::WalResult<()> {
//! let wal = Wal::open(WalConfig {
//!     root_dir: "/var/lib/keel/wal".into(),
//!     ..WalConfig::default()
//! })?;
//!
//! let index = wal.append(7, b"SET X=0").await?;
//! wal.commit(index).await?;
//! let batch = wal.read(index, index).await?;
//! assert_eq!(batch.entries[0].payload, b"SET X=0");
//! wal.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Durability contract
//!
//! Entries referenced by a committed watermark are flushed before the
//! watermark itself persists (write-ahead ordering: payload, index,
//! metadata, each synced in turn). Any I/O failure on that durable
//! path poisons the log; a poisoned log rejects everything except
//! [`Wal::close`].

pub mod addr;
pub mod config;
pub mod error;
pub mod fs;
pub mod index;
pub mod lock;
pub mod meta;
pub mod page;

mod apply;
mod wal;

pub use addr::{AddressSpace, ChunkCursor, MemoryChunk};
pub use apply::{AppliedEntry, StateMachine};
pub use config::{FlushInterval, MemoryMode, NodeId, PageId, WalConfig};
pub use error::{WalError, WalResult};
pub use index::{FLAG_SNAPSHOT, IndexRecord};
pub use lock::{AcquireOptions, LockGuard, LockManager, LockMode};
pub use meta::MetadataRecord;
pub use page::{Page, PageStore, slots::SlotPool};
pub use wal::{
    AppendEntry, AppendOptions, Entry, EntryContext, ReadBatch, ReadMode, Wal, WalMetricsSnapshot,
    WalStats,
};
