use std::mem::size_of;
use std::sync::OnceLock;

use crate::gc::Address;

/// return pointer width: either 4 or 8
/// (although only 64bit architectures are supported right now)
#[inline(always)]
pub const fn ptr_width_usize() -> usize {
    size_of::<*const u8>()
}

/// returns true if given value is a multiple of a page size.
pub fn is_os_page_aligned(val: usize) -> bool {
    let align = os_page_size_bits();

    // we can use shifts here since we know that
    // page size is power of 2
    val == ((val >> align) << align)
}

/// round the given value up to the nearest multiple of a page
pub fn os_page_align_up(val: usize) -> usize {
    let align = os_page_size_bits();

    // we know that page size is power of 2, hence
    // we can use shifts instead of expensive division
    ((val + (1 << align) - 1) >> align) << align
}

/// Like `os_page_align_up`, but `None` when the result does not fit.
pub fn checked_os_page_align_up(val: usize) -> Option<usize> {
    let align = os_page_size_bits();
    let rounded = val.checked_add((1 << align) - 1)?;
    Some((rounded >> align) << align)
}

pub fn os_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(determine_page_size)
}

fn os_page_size_bits() -> usize {
    os_page_size().trailing_zeros() as usize
}

#[cfg(target_family = "unix")]
fn determine_page_size() -> usize {
    let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if val <= 0 {
        panic!("could not determine page size.");
    }

    val as usize
}

/// rounds the given value `val` up to the nearest multiple
/// of `align`
pub fn align(value: u32, align: u32) -> u32 {
    if align == 0 {
        return value;
    }

    ((value + align - 1) / align) * align
}

/// rounds the given value `val` up to the nearest multiple
/// of `align`.
pub fn align_usize_up(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    ((value + align - 1) / align) * align
}

pub fn checked_align_usize_up(value: usize, align: usize) -> Option<usize> {
    if align == 0 {
        return Some(value);
    }

    Some((value.checked_add(align - 1)? / align) * align)
}

pub fn align_usize_down(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    value - value % align
}

pub fn is_aligned(value: usize, align: usize) -> bool {
    align_usize_down(value, align) == value
}

/// fills `size` bytes starting at `start` with `value`.
pub fn fill_bytes(start: Address, size: usize, value: u8) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), value, size);
    }
}

/// copies `size` bytes from `src` to `dest`, regions must not overlap.
pub fn copy_bytes(src: Address, dest: Address, size: usize) {
    unsafe {
        std::ptr::copy_nonoverlapping(src.to_ptr::<u8>(), dest.to_mut_ptr::<u8>(), size);
    }
}
