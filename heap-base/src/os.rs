//! Thin wrappers around the mmap family.

use std::ptr;

use crate::error::HeapError;
use crate::gc::Address;
use crate::mem;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryPermissions {
    None,
    Read,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl MemoryPermissions {
    fn protection(self) -> libc::c_int {
        match self {
            MemoryPermissions::None => libc::PROT_NONE,
            MemoryPermissions::Read => libc::PROT_READ,
            MemoryPermissions::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            MemoryPermissions::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            MemoryPermissions::ReadWriteExecute => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
        }
    }
}

fn reserve(size: usize) -> Result<Address, HeapError> {
    debug_assert!(mem::is_os_page_aligned(size));

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
            -1,
            0,
        ) as *mut libc::c_void
    };

    if ptr == libc::MAP_FAILED {
        return Err(HeapError::PageAllocationFailed { size });
    }

    Ok(Address::from_ptr(ptr))
}

/// Reserves `size` bytes aligned to `align`. The surplus of the larger
/// unaligned reservation is unmapped again.
pub fn reserve_align(size: usize, align: usize) -> Result<Address, HeapError> {
    debug_assert!(mem::is_os_page_aligned(size));
    debug_assert!(mem::is_os_page_aligned(align));

    let page_size = mem::os_page_size();
    let align = if align == 0 { page_size } else { align };
    let unaligned_size = size + align - page_size;

    let unaligned_start = reserve(unaligned_size)?;
    let aligned_start: Address = mem::align_usize_up(unaligned_start.to_usize(), align).into();

    let gap_start = aligned_start.offset_from(unaligned_start);
    let gap_end = unaligned_size - size - gap_start;

    if gap_start > 0 {
        free(unaligned_start, gap_start);
    }

    if gap_end > 0 {
        free(aligned_start.offset(size), gap_end);
    }

    Ok(aligned_start)
}

pub fn free(start: Address, size: usize) {
    debug_assert!(mem::is_os_page_aligned(start.to_usize()));
    debug_assert!(mem::is_os_page_aligned(size));

    let result = unsafe { libc::munmap(start.to_mut_ptr(), size) };

    if result != 0 {
        panic!("munmap() failed");
    }
}

pub fn commit_at(start: Address, size: usize, permissions: MemoryPermissions) -> bool {
    debug_assert!(mem::is_os_page_aligned(start.to_usize()));
    debug_assert!(mem::is_os_page_aligned(size));

    let val = unsafe {
        libc::mmap(
            start.to_mut_ptr(),
            size,
            permissions.protection(),
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    val != libc::MAP_FAILED
}

/// Returns the memory to the OS while keeping the reservation.
pub fn discard(start: Address, size: usize) -> bool {
    debug_assert!(mem::is_os_page_aligned(start.to_usize()));
    debug_assert!(mem::is_os_page_aligned(size));

    let res = unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) };

    if res != 0 {
        return false;
    }

    protect(start, size, MemoryPermissions::None)
}

pub fn protect(start: Address, size: usize, permissions: MemoryPermissions) -> bool {
    debug_assert!(mem::is_os_page_aligned(start.to_usize()));
    debug_assert!(mem::is_os_page_aligned(size));

    let res = unsafe { libc::mprotect(start.to_mut_ptr(), size, permissions.protection()) };
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_align_is_aligned() {
        let align = 256 * 1024;
        let size = 2 * align;
        let start = reserve_align(size, align).expect("reservation failed");
        assert!(mem::is_aligned(start.to_usize(), align));
        assert!(commit_at(start, size, MemoryPermissions::ReadWrite));

        unsafe {
            *start.to_mut_ptr::<usize>() = 17;
            *start.offset(size - 8).to_mut_ptr::<usize>() = 42;
            assert_eq!(*start.to_ptr::<usize>(), 17);
        }

        assert!(discard(start, size));
        free(start, size);
    }

    #[test]
    fn protect_toggles() {
        let size = mem::os_page_size();
        let start = reserve_align(size, 0).expect("reservation failed");
        assert!(commit_at(start, size, MemoryPermissions::Read));
        assert!(protect(start, size, MemoryPermissions::ReadWrite));

        unsafe {
            *start.to_mut_ptr::<usize>() = 1;
        }

        assert!(protect(start, size, MemoryPermissions::Read));
        free(start, size);
    }
}
