//! Paged storage over the log's byte address space.
//!
//! Two interchangeable stores back the pages: [`mmap::MappedStore`]
//! maps each page file read/write and lets `msync` provide
//! durability; [`heap::PrivateStore`] keeps pages in private anonymous
//! buffers and writes dirty ranges out explicitly. Callers receive
//! non-owning [`Page`] handles keyed by [`PageId`]; a handle stays
//! valid while its `Arc` is held, and the lock manager keeps
//! destructive operations away from live readers.

pub mod heap;
pub mod mmap;
pub mod slots;

use std::collections::BTreeMap;
use std::fs::File;
use std::ops::Range;
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::{MemoryMode, PageId, WalConfig};
use crate::error::{WalError, WalResult};
use crate::fs::Layout;

use heap::{AlignedBuf, PrivateStore};
use mmap::MappedStore;

pub(crate) enum Backing {
    Mapped {
        mmap: Mutex<memmap2::MmapMut>,
        file: File,
    },
    Private {
        buf: AlignedBuf,
        file: Mutex<Option<File>>,
    },
}

/// Non-owning view of one fixed-size page.
///
/// The memory behind a handle stays valid until the last `Arc` clone
/// drops. Mutation is only legal for the append tail under the write
/// lock; the handle does not enforce that discipline itself.
pub struct Page {
    id: PageId,
    len: usize,
    data: *mut u8,
    writable: AtomicBool,
    path: PathBuf,
    backing: Backing,
}

unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub(crate) fn new(
        id: PageId,
        len: usize,
        data: *mut u8,
        path: PathBuf,
        backing: Backing,
    ) -> Self {
        Self {
            id,
            len,
            data,
            writable: AtomicBool::new(true),
            path,
            backing,
        }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_range(&self, range: &Range<usize>) -> WalResult<()> {
        if range.start > range.end || range.end > self.len {
            return Err(WalError::internal(format!(
                "range {}..{} exceeds page {} of {} bytes",
                range.start, range.end, self.id, self.len
            )));
        }
        Ok(())
    }

    pub fn read_slice(&self, range: Range<usize>) -> WalResult<&[u8]> {
        self.check_range(&range)?;
        unsafe { Ok(slice::from_raw_parts(self.data.add(range.start), range.len())) }
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> WalResult<()> {
        self.check_range(&(offset..offset + bytes.len()))?;
        if !self.writable.load(Ordering::Acquire) {
            return Err(WalError::invalid_state("attempted to write a retired page"));
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn zero_range(&self, range: Range<usize>) -> WalResult<()> {
        self.check_range(&range)?;
        if !self.writable.load(Ordering::Acquire) {
            return Err(WalError::invalid_state("attempted to write a retired page"));
        }
        unsafe {
            ptr::write_bytes(self.data.add(range.start), 0, range.len());
        }
        Ok(())
    }

    /// Makes the closed byte range durable for this page.
    pub fn flush_range(&self, range: Range<usize>) -> WalResult<()> {
        self.check_range(&range)?;
        if range.is_empty() {
            return Ok(());
        }
        match &self.backing {
            Backing::Mapped { mmap, file } => {
                {
                    let guard = mmap.lock();
                    guard
                        .flush_range(range.start, range.len())
                        .map_err(|err| WalError::io_at(&self.path, range.start as u64, err))?;
                }
                sync_data(file, &self.path)
            }
            Backing::Private { file, .. } => {
                use std::os::unix::fs::FileExt;

                let bytes = self.read_slice(range.clone())?;
                let mut guard = file.lock();
                if guard.is_none() {
                    *guard = Some(crate::fs::preallocate_file(&self.path, self.len as u64)?);
                }
                let handle = guard
                    .as_ref()
                    .ok_or_else(|| WalError::internal("page backing file vanished"))?;
                handle
                    .write_at(bytes, range.start as u64)
                    .map_err(|err| WalError::io_at(&self.path, range.start as u64, err))?;
                sync_data(handle, &self.path)
            }
        }
    }

    fn retire(&self) {
        self.writable.store(false, Ordering::Release);
    }
}

fn sync_data(file: &File, path: &std::path::Path) -> WalResult<()> {
    match file.sync_data() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::Unsupported => {
            file.sync_all().map_err(|err| WalError::io_at(path, 0, err))
        }
        Err(err) => Err(WalError::io_at(path, 0, err)),
    }
}

/// Shared id-to-handle table used by both store variants.
pub(crate) struct PageTable {
    pages: RwLock<BTreeMap<PageId, Arc<Page>>>,
}

impl PageTable {
    fn new() -> Self {
        Self {
            pages: RwLock::new(BTreeMap::new()),
        }
    }

    fn get(&self, id: PageId) -> Option<Arc<Page>> {
        self.pages.read().get(&id).cloned()
    }

    /// Inserts `page` unless a concurrent caller won the race, in
    /// which case the already-registered handle is returned.
    fn insert_or_existing(&self, page: Arc<Page>) -> Arc<Page> {
        let mut guard = self.pages.write();
        guard.entry(page.id()).or_insert(page).clone()
    }

    fn remove_where(&self, mut keep: impl FnMut(PageId) -> bool) -> Vec<Arc<Page>> {
        let mut guard = self.pages.write();
        let dropped: Vec<PageId> = guard.keys().copied().filter(|id| !keep(*id)).collect();
        dropped
            .into_iter()
            .filter_map(|id| guard.remove(&id))
            .collect()
    }

    fn len(&self) -> usize {
        self.pages.read().len()
    }

    fn highest(&self) -> Option<PageId> {
        self.pages.read().keys().next_back().copied()
    }
}

/// Byte-addressable page provider over one of the two store variants.
pub enum PageStore {
    Mapped(MappedStore),
    Private(PrivateStore),
}

impl PageStore {
    /// Opens the store selected by `config.memory` over `layout`.
    pub fn open(layout: Layout, config: &WalConfig) -> WalResult<Self> {
        let page_size = config.chunk_size as usize;
        match config.memory {
            MemoryMode::SharedMemory => Ok(Self::Mapped(MappedStore::open(layout, page_size)?)),
            MemoryMode::PrivateMemory => Ok(Self::Private(PrivateStore::open(layout, page_size)?)),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        match self {
            Self::Mapped(store) => store.page_size(),
            Self::Private(store) => store.page_size(),
        }
    }

    /// Returns the page, creating it on first touch. Idempotent;
    /// concurrent callers observe the same handle.
    pub fn get_or_add(&self, id: PageId) -> WalResult<Arc<Page>> {
        match self {
            Self::Mapped(store) => store.get_or_add(id),
            Self::Private(store) => store.get_or_add(id),
        }
    }

    /// Returns the page if it exists in memory or on disk.
    pub fn try_get(&self, id: PageId) -> WalResult<Option<Arc<Page>>> {
        match self {
            Self::Mapped(store) => store.try_get(id),
            Self::Private(store) => store.try_get(id),
        }
    }

    /// Removes on-disk and in-memory pages with index < `upper`.
    /// Callers must hold compaction rights.
    pub fn delete_pages_below(&self, upper: PageId) -> WalResult<usize> {
        match self {
            Self::Mapped(store) => store.delete_pages(move |id| id >= upper),
            Self::Private(store) => store.delete_pages(move |id| id >= upper),
        }
    }

    /// Removes pages with index > `floor`. Callers must hold the
    /// exclusive lock; this backs suffix drops that give space back.
    pub fn delete_pages_above(&self, floor: PageId) -> WalResult<usize> {
        match self {
            Self::Mapped(store) => store.delete_pages(move |id| id <= floor),
            Self::Private(store) => store.delete_pages(move |id| id <= floor),
        }
    }

    /// Makes the byte range `[start, end)` of the logical address
    /// space durable.
    pub fn flush_bytes(&self, start: u64, end: u64) -> WalResult<()> {
        if end <= start {
            return Ok(());
        }
        let page_size = self.page_size() as u64;
        let first = (start / page_size) as u32;
        let last = ((end - 1) / page_size) as u32;
        for raw in first..=last {
            let page_start = raw as u64 * page_size;
            let lo = start.max(page_start) - page_start;
            let hi = end.min(page_start + page_size) - page_start;
            let page = self.try_get(PageId::new(raw))?.ok_or_else(|| {
                WalError::internal(format!("flush touched unallocated page {raw}"))
            })?;
            page.flush_range(lo as usize..hi as usize)?;
        }
        Ok(())
    }

    pub fn page_count(&self) -> usize {
        match self {
            Self::Mapped(store) => store.table().len(),
            Self::Private(store) => store.table().len(),
        }
    }

    /// Highest page id present in memory or on disk.
    pub fn highest_page(&self) -> WalResult<Option<PageId>> {
        match self {
            Self::Mapped(store) => store.highest_page(),
            Self::Private(store) => store.highest_page(),
        }
    }
}
