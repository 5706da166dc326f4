use std::alloc::{self, Layout as AllocLayout};
use std::fs::OpenOptions;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{PageId, os_page_size};
use crate::error::{WalError, WalResult};
use crate::fs::Layout;

use super::slots::{MAX_SLOTS, SlotPool};
use super::{Backing, Page, PageTable};

/// Page-aligned anonymous allocation backing one private page.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: AllocLayout,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn alloc(size: usize, align: usize) -> WalResult<Self> {
        let layout = AllocLayout::from_size_align(size, align)
            .map_err(|err| WalError::invalid_config(format!("page layout: {err}")))?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| WalError::internal(format!("allocation of {size} bytes failed")))?;
        Ok(Self { ptr, layout })
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn zero(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.layout.size());
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

/// Reads the kernel's transparent-huge-page PMD size, if the platform
/// exposes one.
#[cfg(target_os = "linux")]
fn hpage_pmd_size() -> Option<u64> {
    std::fs::read_to_string("/sys/kernel/mm/transparent_hugepage/hpage_pmd_size")
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|size| size.is_power_of_two())
}

#[cfg(not(target_os = "linux"))]
fn hpage_pmd_size() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn advise_huge(buf: &AlignedBuf, size: usize) {
    let rc = unsafe {
        libc::madvise(
            buf.as_mut_ptr() as *mut libc::c_void,
            size,
            libc::MADV_HUGEPAGE,
        )
    };
    if rc != 0 {
        tracing::debug!(
            errno = std::io::Error::last_os_error().raw_os_error(),
            "madvise(MADV_HUGEPAGE) refused"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_huge(_buf: &AlignedBuf, _size: usize) {}

/// Bounded cache of retired page buffers, slots rented from a
/// [`SlotPool`] word.
struct BufferCache {
    pool: SlotPool,
    slots: Mutex<Vec<Option<AlignedBuf>>>,
}

impl BufferCache {
    fn new(capacity: u8) -> Self {
        let capacity = capacity.min(MAX_SLOTS);
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        Self {
            pool: SlotPool::new(capacity),
            slots: Mutex::new(slots),
        }
    }

    /// Stashes `buf` for reuse; drops it when every slot is occupied.
    fn put(&self, buf: AlignedBuf) {
        if let Some(slot) = self.pool.try_take() {
            self.slots.lock()[slot as usize] = Some(buf);
        }
    }

    /// Takes any cached buffer, zeroed and ready for reuse.
    fn take(&self) -> Option<AlignedBuf> {
        let mut guard = self.slots.lock();
        for (slot, entry) in guard.iter_mut().enumerate() {
            if let Some(mut buf) = entry.take() {
                self.pool.release(slot as u8);
                buf.zero();
                return Some(buf);
            }
        }
        None
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }
}

/// Page store over private anonymous memory.
///
/// Buffers are page-aligned; when the kernel's PMD size divides the
/// configured page size, fresh buffers are advised as transparent
/// huge pages. Flush writes the dirty sub-range to the page file and
/// fdatasyncs it.
pub struct PrivateStore {
    layout: Layout,
    page_size: usize,
    align: usize,
    huge: bool,
    table: PageTable,
    cache: BufferCache,
}

impl PrivateStore {
    pub fn open(layout: Layout, page_size: usize) -> WalResult<Self> {
        let os_align = os_page_size() as usize;
        let (align, huge) = match hpage_pmd_size() {
            Some(pmd) if page_size as u64 % pmd == 0 => (pmd as usize, true),
            _ => (os_align, false),
        };
        Ok(Self {
            layout,
            page_size,
            align,
            huge,
            table: PageTable::new(),
            cache: BufferCache::new(MAX_SLOTS),
        })
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(super) fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn highest_page(&self) -> WalResult<Option<PageId>> {
        let resident = self.table.highest();
        let on_disk = self.layout.scan_pages()?.into_iter().max();
        Ok(resident.max(on_disk))
    }

    fn fresh_buffer(&self) -> WalResult<AlignedBuf> {
        if let Some(buf) = self.cache.take() {
            return Ok(buf);
        }
        let buf = AlignedBuf::alloc(self.page_size, self.align)?;
        if self.huge {
            advise_huge(&buf, self.page_size);
        }
        Ok(buf)
    }

    /// Builds a page around a fresh buffer, hydrating it from the
    /// backing file when one exists.
    fn materialize(&self, id: PageId, create: bool) -> WalResult<Option<Arc<Page>>> {
        use std::os::unix::fs::FileExt;

        let path = self.layout.page_path(id);
        let existing = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Some(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(WalError::io_at(&path, 0, err)),
        };
        if existing.is_none() && !create {
            return Ok(None);
        }

        let buf = self.fresh_buffer()?;
        if let Some(file) = existing.as_ref() {
            let slice =
                unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr(), self.page_size) };
            file.read_exact_at(slice, 0)
                .map_err(|err| WalError::io_at(&path, 0, err))?;
        }

        let data = buf.as_mut_ptr();
        let page = Page::new(
            id,
            self.page_size,
            data,
            path,
            Backing::Private {
                buf,
                file: Mutex::new(existing),
            },
        );
        Ok(Some(Arc::new(page)))
    }

    pub fn get_or_add(&self, id: PageId) -> WalResult<Arc<Page>> {
        if let Some(page) = self.table.get(id) {
            return Ok(page);
        }
        let page = self
            .materialize(id, true)?
            .ok_or_else(|| WalError::internal(format!("page {id} vanished during create")))?;
        Ok(self.table.insert_or_existing(page))
    }

    pub fn try_get(&self, id: PageId) -> WalResult<Option<Arc<Page>>> {
        if let Some(page) = self.table.get(id) {
            return Ok(Some(page));
        }
        match self.materialize(id, false)? {
            Some(page) => Ok(Some(self.table.insert_or_existing(page))),
            None => Ok(None),
        }
    }

    pub fn delete_pages(&self, keep: impl Fn(PageId) -> bool) -> WalResult<usize> {
        for page in self.table.remove_where(&keep) {
            page.retire();
            // Last-handle buffers go back to the slot cache; anything a
            // reader still holds is freed when the reader drops it.
            if let Ok(page) = Arc::try_unwrap(page) {
                if let Backing::Private { buf, .. } = page.backing {
                    self.cache.put(buf);
                }
            }
        }
        let mut count = 0usize;
        for id in self.layout.scan_pages()? {
            if keep(id) {
                continue;
            }
            let path = self.layout.page_path(id);
            match std::fs::remove_file(&path) {
                Ok(()) => count += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(WalError::io_at(&path, 0, err)),
            }
        }
        let _ = crate::fs::sync_dir(self.layout.pages_dir());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalConfig;
    use tempfile::TempDir;

    fn store() -> (TempDir, PrivateStore) {
        let tmp = TempDir::new().expect("tempdir");
        let cfg = WalConfig {
            root_dir: tmp.path().join("wal"),
            ..WalConfig::default()
        }
        .normalized();
        let layout = Layout::new(&cfg);
        layout.ensure().expect("ensure");
        let store = PrivateStore::open(layout, cfg.chunk_size as usize).expect("open");
        (tmp, store)
    }

    #[test]
    fn flush_hydrate_round_trip() {
        let (_tmp, store) = store();
        let page = store.get_or_add(PageId::new(3)).expect("page");
        page.write_bytes(17, b"private bytes").expect("write");
        page.flush_range(17..17 + 13).expect("flush");

        // Drop residency and reload from the backing file.
        drop(page);
        let dropped = store.table().remove_where(|_| false);
        drop(dropped);
        let reloaded = store.try_get(PageId::new(3)).expect("reload").expect("some");
        assert_eq!(reloaded.read_slice(17..17 + 13).expect("read"), b"private bytes");
    }

    #[test]
    fn retired_buffers_are_reused() {
        let (_tmp, store) = store();
        store.get_or_add(PageId::new(0)).expect("page");
        store.delete_pages(|_| false).expect("delete");
        assert_eq!(store.cache.cached(), 1);
        store.get_or_add(PageId::new(1)).expect("page");
        assert_eq!(store.cache.cached(), 0);
    }

    #[test]
    fn buffer_cache_bounds_capacity() {
        let cache = BufferCache::new(2);
        for _ in 0..3 {
            cache.put(AlignedBuf::alloc(4096, 4096).expect("alloc"));
        }
        assert_eq!(cache.cached(), 2);
        assert!(cache.take().is_some());
        assert!(cache.take().is_some());
        assert!(cache.take().is_none());
    }

    #[test]
    fn reused_buffer_is_zeroed() {
        let cache = BufferCache::new(1);
        let buf = AlignedBuf::alloc(64, 64).expect("alloc");
        unsafe { *buf.as_mut_ptr() = 0xAB };
        cache.put(buf);
        let buf = cache.take().expect("cached");
        assert_eq!(unsafe { *buf.as_mut_ptr() }, 0);
    }
}
