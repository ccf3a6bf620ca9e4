use std::sync::Arc;

use crate::error::HeapError;
use crate::gc::Address;
use crate::mem;
use crate::os::{self, MemoryPermissions};

/// Source of page-granular memory for the heap.
pub trait PageAllocator: Send + Sync {
    /// Reserves `size` bytes aligned to `alignment`; the memory is inaccessible
    /// until committed.
    fn allocate_page(&self, size: usize, alignment: usize) -> Result<Address, HeapError>;

    fn commit_page(&self, start: Address, size: usize, permissions: MemoryPermissions) -> bool;

    /// Returns the physical memory but keeps the reservation.
    fn decommit_page(&self, start: Address, size: usize) -> bool;

    fn release_page(&self, start: Address, size: usize);

    fn set_permissions(&self, start: Address, size: usize, permissions: MemoryPermissions)
        -> bool;

    fn commit_page_size(&self) -> usize {
        mem::os_page_size()
    }
}

pub struct OsPageAllocator;

impl PageAllocator for OsPageAllocator {
    fn allocate_page(&self, size: usize, alignment: usize) -> Result<Address, HeapError> {
        os::reserve_align(size, alignment)
    }

    fn commit_page(&self, start: Address, size: usize, permissions: MemoryPermissions) -> bool {
        os::commit_at(start, size, permissions)
    }

    fn decommit_page(&self, start: Address, size: usize) -> bool {
        os::discard(start, size)
    }

    fn release_page(&self, start: Address, size: usize) {
        os::free(start, size);
    }

    fn set_permissions(
        &self,
        start: Address,
        size: usize,
        permissions: MemoryPermissions,
    ) -> bool {
        os::protect(start, size, permissions)
    }
}

/// Services the embedder provides to the heap.
pub trait Platform: Send + Sync {
    fn page_allocator(&self) -> &dyn PageAllocator;

    fn worker_threads(&self) -> usize {
        num_cpus::get()
    }
}

pub struct DefaultPlatform {
    page_allocator: OsPageAllocator,
}

impl DefaultPlatform {
    pub fn new() -> Arc<DefaultPlatform> {
        Arc::new(DefaultPlatform {
            page_allocator: OsPageAllocator,
        })
    }
}

impl Platform for DefaultPlatform {
    fn page_allocator(&self) -> &dyn PageAllocator {
        &self.page_allocator
    }
}
