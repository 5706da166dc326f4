use std::fs::OpenOptions;
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::config::PageId;
use crate::error::{WalError, WalResult};
use crate::fs::{self, Layout};

use super::{Backing, Page, PageTable};

/// Page store that maps each page file read/write.
///
/// Writes land directly in the mapping; the OS may write dirty pages
/// back under memory pressure, and flush uses `msync` on the touched
/// range followed by `fdatasync` on the page file.
pub struct MappedStore {
    layout: Layout,
    page_size: usize,
    table: PageTable,
}

impl MappedStore {
    pub fn open(layout: Layout, page_size: usize) -> WalResult<Self> {
        Ok(Self {
            layout,
            page_size,
            table: PageTable::new(),
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

    fn map_page(&self, id: PageId, create: bool) -> WalResult<Option<Arc<Page>>> {
        let path = self.layout.page_path(id);
        let file = if create {
            fs::preallocate_file(&path, self.page_size as u64)?
        } else {
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(WalError::io_at(&path, 0, err)),
            }
        };

        let mut mmap =
            unsafe { MmapMut::map_mut(&file).map_err(|err| WalError::io_at(&path, 0, err))? };
        if mmap.len() != self.page_size {
            return Err(WalError::integrity(format!(
                "page {} is {} bytes, expected {}",
                path.display(),
                mmap.len(),
                self.page_size
            )));
        }
        let data = mmap.as_mut_ptr();
        let page = Page::new(
            id,
            self.page_size,
            data,
            path,
            Backing::Mapped {
                mmap: Mutex::new(mmap),
                file,
            },
        );
        Ok(Some(Arc::new(page)))
    }

    pub fn get_or_add(&self, id: PageId) -> WalResult<Arc<Page>> {
        if let Some(page) = self.table.get(id) {
            return Ok(page);
        }
        let page = match self.map_page(id, false)? {
            Some(existing) => existing,
            None => self
                .map_page(id, true)?
                .ok_or_else(|| WalError::internal(format!("page {id} vanished during create")))?,
        };
        Ok(self.table.insert_or_existing(page))
    }

    pub fn try_get(&self, id: PageId) -> WalResult<Option<Arc<Page>>> {
        if let Some(page) = self.table.get(id) {
            return Ok(Some(page));
        }
        match self.map_page(id, false)? {
            Some(page) => Ok(Some(self.table.insert_or_existing(page))),
            None => Ok(None),
        }
    }

    pub fn delete_pages(&self, keep: impl Fn(PageId) -> bool) -> WalResult<usize> {
        for page in self.table.remove_where(&keep) {
            page.retire();
        }
        // Files may exist for pages never touched this run; sweep the
        // directory rather than only the resident set.
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
        let _ = fs::sync_dir(self.layout.pages_dir());
        Ok(count)
    }
}
