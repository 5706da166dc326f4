//! Logical address space over the page store.
//!
//! A 64-bit address names a byte in the concatenation of all pages:
//! `page = address >> log2(page_size)`, `offset = address & (page_size
//! - 1)`. Range reads surface as a one-pass sequence of per-page
//! [`MemoryChunk`] views.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::PageId;
use crate::error::{WalError, WalResult};
use crate::page::{Page, PageStore};

/// Address-to-page arithmetic plus contiguous read/write helpers.
pub struct AddressSpace {
    store: Arc<PageStore>,
    shift: u32,
    mask: u64,
    /// Hot tail page of the current append; spares the write path a
    /// table lookup per chunk.
    tail: ArcSwapOption<Page>,
}

impl AddressSpace {
    pub fn new(store: Arc<PageStore>) -> Self {
        let page_size = store.page_size() as u64;
        debug_assert!(page_size.is_power_of_two());
        Self {
            store,
            shift: page_size.trailing_zeros(),
            mask: page_size - 1,
            tail: ArcSwapOption::const_empty(),
        }
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        1u64 << self.shift
    }

    #[inline]
    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    /// Splits a logical address into its page id and in-page offset.
    pub fn split(&self, address: u64) -> WalResult<(PageId, usize)> {
        let raw_page = address >> self.shift;
        if raw_page > u32::MAX as u64 {
            return Err(WalError::internal(format!(
                "address {address} exceeds the addressable page range"
            )));
        }
        Ok((PageId::new(raw_page as u32), (address & self.mask) as usize))
    }

    #[inline]
    pub fn page_of(&self, address: u64) -> PageId {
        PageId::new((address >> self.shift) as u32)
    }

    /// One-pass cursor over `[address, address + len)`.
    pub fn chunks(&self, address: u64, len: u64) -> ChunkCursor<'_> {
        ChunkCursor {
            space: self,
            address,
            remaining: len,
        }
    }

    /// Copies `buf.len()` bytes starting at `address`.
    pub fn read_into(&self, address: u64, buf: &mut [u8]) -> WalResult<()> {
        let mut cursor = self.chunks(address, buf.len() as u64);
        let mut filled = 0usize;
        while let Some(chunk) = cursor.next_chunk()? {
            let bytes = chunk.bytes()?;
            buf[filled..filled + bytes.len()].copy_from_slice(bytes);
            filled += bytes.len();
        }
        debug_assert_eq!(filled, buf.len());
        Ok(())
    }

    pub fn read_vec(&self, address: u64, len: usize) -> WalResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(address, &mut buf)?;
        Ok(buf)
    }

    /// Writes `bytes` starting at `address`, allocating pages on first
    /// touch. Only the appender may call this, under the write lock.
    pub fn write(&self, address: u64, bytes: &[u8]) -> WalResult<()> {
        let mut addr = address;
        let mut rest = bytes;
        while !rest.is_empty() {
            let (page_id, offset) = self.split(addr)?;
            let step = rest
                .len()
                .min(self.page_size() as usize - offset);
            let page = self.tail_page(page_id)?;
            page.write_bytes(offset, &rest[..step])?;
            addr += step as u64;
            rest = &rest[step..];
        }
        Ok(())
    }

    fn tail_page(&self, page_id: PageId) -> WalResult<Arc<Page>> {
        if let Some(cached) = self.tail.load_full() {
            if cached.id() == page_id {
                return Ok(cached);
            }
        }
        let page = self.store.get_or_add(page_id)?;
        self.tail.store(Some(Arc::clone(&page)));
        Ok(page)
    }

    /// Forgets the cached tail page. Truncation and page deletion
    /// call this so a stale handle cannot be written again.
    pub fn reset_tail(&self) {
        self.tail.store(None);
    }
}

/// View of the part of a range that lands in one page.
pub struct MemoryChunk {
    page: Arc<Page>,
    offset: usize,
    len: usize,
}

impl MemoryChunk {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// The chunk's bytes, borrowed from the page for as long as the
    /// chunk is held.
    pub fn bytes(&self) -> WalResult<&[u8]> {
        self.page.read_slice(self.offset..self.offset + self.len)
    }
}

/// Non-restartable cursor stepping a range one page at a time.
///
/// Each step advances by `min(remaining, page_size - offset_in_page)`.
/// Consumers materialize or process chunks in one pass; there is no
/// way to rewind.
pub struct ChunkCursor<'a> {
    space: &'a AddressSpace,
    address: u64,
    remaining: u64,
}

impl ChunkCursor<'_> {
    pub fn next_chunk(&mut self) -> WalResult<Option<MemoryChunk>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let (page_id, offset) = self.space.split(self.address)?;
        let step = self
            .remaining
            .min(self.space.page_size() - offset as u64) as usize;
        let page = self.space.store.try_get(page_id)?.ok_or_else(|| {
            WalError::internal(format!(
                "read of unallocated address {} (page {page_id})",
                self.address
            ))
        })?;
        self.address += step as u64;
        self.remaining -= step as u64;
        Ok(Some(MemoryChunk {
            page,
            offset,
            len: step,
        }))
    }
}

impl Iterator for ChunkCursor<'_> {
    type Item = WalResult<MemoryChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
