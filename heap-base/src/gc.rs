use std::cmp::{Ord, Ordering, PartialOrd};
use std::fmt;

use crate::gc::object::{
    FreeSpace, Header, Obj, FILLER_TYPE, FREE_SPACE_MIN_SIZE, FREE_SPACE_TYPE,
};
use crate::mem;

pub mod allocator;
pub mod barrier;
pub mod body;
pub mod chunk;
pub mod compact;
pub mod factory;
pub mod freelist;
pub mod heap_base;
pub mod marking;
pub mod object;
pub mod oom;
pub mod page_backend;
pub mod platform;
pub mod pmarking;
pub mod prefinalizer;
pub mod remembered_set;
pub mod root;
pub mod space;
pub mod stats;
pub mod sweep;
pub mod visitor;
pub mod worklist;

pub const K: usize = 1024;
pub const M: usize = K * K;
pub const G: usize = K * M;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Address(usize);

impl Address {
    #[inline(always)]
    pub fn from(val: usize) -> Address {
        Address(val)
    }

    #[inline(always)]
    pub fn offset_from(self, base: Address) -> usize {
        debug_assert!(self >= base);

        self.to_usize() - base.to_usize()
    }

    #[inline(always)]
    pub fn offset(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }

    #[inline(always)]
    pub fn to_obj(self) -> &'static Obj {
        unsafe { &*self.to_mut_ptr::<Obj>() }
    }

    #[inline(always)]
    pub fn to_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub fn to_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(&self) -> *mut T {
        self.0 as *const T as *mut T
    }

    #[inline(always)]
    pub fn null() -> Address {
        Address(0)
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_non_null(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.to_usize())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Address) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Address) -> Ordering {
        self.to_usize().cmp(&other.to_usize())
    }
}

impl From<usize> for Address {
    fn from(val: usize) -> Address {
        Address(val)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: Address,
    pub end: Address,
}

impl Region {
    pub fn new(start: Address, end: Address) -> Region {
        debug_assert!(start <= end);

        Region { start, end }
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end.to_usize() - self.start.to_usize()
    }

    #[inline(always)]
    pub fn empty(&self) -> bool {
        self.start == self.end
    }

    /// `other` may end exactly at the end of this region.
    #[inline(always)]
    pub fn fully_contains(&self, other: &Region) -> bool {
        self.contains(other.start) && other.end <= self.end
    }
}

pub struct FormattedSize {
    size: usize,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let size = self.size;

        if size < K {
            write!(f, "{}B", size)
        } else if size < M {
            write!(f, "{:.1}K", size as f64 / K as f64)
        } else if size < G {
            write!(f, "{:.1}M", size as f64 / M as f64)
        } else {
            write!(f, "{:.1}G", size as f64 / G as f64)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollectionType {
    Major,
    Minor,
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CollectionType::Major => f.write_str("Major"),
            CollectionType::Minor => f.write_str("Minor"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcReason {
    AllocationTrigger,
    AllocationFailure,
    ForceCollect,
    ForceMinorCollect,
    Stress,
    Testing,
    Terminate,
}

impl GcReason {
    fn message(&self) -> &'static str {
        match self {
            GcReason::AllocationTrigger => "allocation trigger",
            GcReason::AllocationFailure => "alloc failure",
            GcReason::ForceCollect => "force collect",
            GcReason::ForceMinorCollect => "force minor collect",
            GcReason::Stress => "stress",
            GcReason::Testing => "testing",
            GcReason::Terminate => "terminate",
        }
    }
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Makes the region iterable by covering it with a filler or a free space
/// object.
pub fn fill_region(start: Address, end: Address) {
    if start == end {
        return;
    }

    let size = end.offset_from(start);
    debug_assert!(mem::is_aligned(size, mem::ptr_width_usize()));

    if size < FREE_SPACE_MIN_SIZE {
        debug_assert_eq!(size, Header::size());
        start.to_obj().header().setup(&FILLER_TYPE, false);
    } else {
        start.to_obj().header().setup(&FREE_SPACE_TYPE, false);
        FreeSpace::set_size(start, size);
    }
}
