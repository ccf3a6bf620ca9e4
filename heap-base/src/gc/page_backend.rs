use std::sync::Arc;

use crate::error::HeapError;
use crate::gc::chunk::{CHUNK_HEADER_SIZE, CHUNK_SIZE};
use crate::gc::platform::{PageAllocator, Platform};
use crate::gc::Address;
use crate::mem;
use crate::os::MemoryPermissions;

/// Hands out chunk-aligned memory and keeps released normal chunks around
/// with their memory decommitted.
pub struct PageBackend {
    platform: Arc<dyn Platform>,
    pool: Vec<Address>,
    committed_bytes: usize,
    max_heap_size: Option<usize>,
}

impl PageBackend {
    pub fn new(platform: Arc<dyn Platform>, max_heap_size: Option<usize>) -> PageBackend {
        PageBackend {
            platform,
            pool: Vec::new(),
            committed_bytes: 0,
            max_heap_size,
        }
    }

    pub fn page_allocator(&self) -> &dyn PageAllocator {
        self.platform.page_allocator()
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    pub fn pooled_bytes(&self) -> usize {
        self.pool.len() * CHUNK_SIZE
    }

    pub fn max_heap_size(&self) -> Option<usize> {
        self.max_heap_size
    }

    fn ensure_capacity(&self, size: usize) -> Result<(), HeapError> {
        if let Some(limit) = self.max_heap_size {
            if self.committed_bytes + size > limit {
                return Err(HeapError::HeapLimitExceeded {
                    limit,
                    requested: size,
                });
            }
        }

        Ok(())
    }

    /// Returns the base of a committed chunk of `CHUNK_SIZE` bytes. The
    /// header is writable, executable chunks have an executable object area.
    pub fn allocate_normal_chunk(&mut self, executable: bool) -> Result<Address, HeapError> {
        self.ensure_capacity(CHUNK_SIZE)?;

        let pooled = if executable { None } else { self.pool.pop() };

        let base = match pooled {
            Some(base) => base,
            None => self.page_allocator().allocate_page(CHUNK_SIZE, CHUNK_SIZE)?,
        };

        if let Err(err) = self.commit(base, CHUNK_SIZE, executable) {
            self.page_allocator().release_page(base, CHUNK_SIZE);
            return Err(err);
        }

        self.committed_bytes += CHUNK_SIZE;
        Ok(base)
    }

    /// Returns base and total size of a chunk holding one object of
    /// `object_size` bytes.
    pub fn allocate_large_chunk(
        &mut self,
        object_size: usize,
        executable: bool,
    ) -> Result<(Address, usize), HeapError> {
        let size = CHUNK_HEADER_SIZE
            .checked_add(object_size)
            .and_then(mem::checked_os_page_align_up)
            .ok_or(HeapError::OutOfMemory {
                requested: object_size,
                context: "large chunk",
            })?;
        self.ensure_capacity(size)?;

        let base = self.page_allocator().allocate_page(size, CHUNK_SIZE)?;

        if let Err(err) = self.commit(base, size, executable) {
            self.page_allocator().release_page(base, size);
            return Err(err);
        }

        self.committed_bytes += size;
        Ok((base, size))
    }

    fn commit(&self, base: Address, size: usize, executable: bool) -> Result<(), HeapError> {
        let allocator = self.page_allocator();

        let committed = if executable {
            allocator.commit_page(base, CHUNK_HEADER_SIZE, MemoryPermissions::ReadWrite)
                && allocator.commit_page(
                    base.offset(CHUNK_HEADER_SIZE),
                    size - CHUNK_HEADER_SIZE,
                    MemoryPermissions::ReadWriteExecute,
                )
        } else {
            allocator.commit_page(base, size, MemoryPermissions::ReadWrite)
        };

        if committed {
            Ok(())
        } else {
            Err(HeapError::PageAllocationFailed { size })
        }
    }

    /// Write-protects the header of an executable chunk after it was
    /// initialized.
    pub fn protect_chunk_header(&self, base: Address) -> bool {
        self.page_allocator()
            .set_permissions(base, CHUNK_HEADER_SIZE, MemoryPermissions::Read)
    }

    pub fn free_normal_chunk(&mut self, base: Address, executable: bool) {
        debug_assert!(self.committed_bytes >= CHUNK_SIZE);
        self.committed_bytes -= CHUNK_SIZE;

        if executable || !self.page_allocator().decommit_page(base, CHUNK_SIZE) {
            self.page_allocator().release_page(base, CHUNK_SIZE);
        } else {
            self.pool.push(base);
        }
    }

    pub fn free_large_chunk(&mut self, base: Address, size: usize) {
        debug_assert!(self.committed_bytes >= size);
        self.committed_bytes -= size;
        self.page_allocator().release_page(base, size);
    }

    /// Unmaps all pooled chunks.
    pub fn release_pool(&mut self) {
        for base in std::mem::take(&mut self.pool) {
            self.platform.page_allocator().release_page(base, CHUNK_SIZE);
        }
    }
}

impl Drop for PageBackend {
    fn drop(&mut self) {
        self.release_pool();
    }
}
