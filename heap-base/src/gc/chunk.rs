use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use memoffset::offset_of;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{fatal, FatalError};
use crate::gc::platform::PageAllocator;
use crate::gc::{Address, Region, K};
use crate::os::MemoryPermissions;

pub const CHUNK_SIZE_BITS: usize = 18;
pub const CHUNK_SIZE: usize = 1 << CHUNK_SIZE_BITS;
pub const CHUNK_ALIGNMENT_MASK: usize = CHUNK_SIZE - 1;

/// The chunk header occupies its own pages so that it can be protected
/// independently from the object area.
pub const CHUNK_HEADER_SIZE: usize = 16 * K;
pub const CHUNK_AREA_SIZE: usize = CHUNK_SIZE - CHUNK_HEADER_SIZE;

/// Objects of at least this size get a chunk of their own.
pub const LARGE_OBJECT_SIZE: usize = 64 * K;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ChunkFlags: usize {
        const IS_EXECUTABLE = 1 << 0;
        const POINTERS_TO_HERE_ARE_INTERESTING = 1 << 1;
        const POINTERS_FROM_HERE_ARE_INTERESTING = 1 << 2;
        const FROM_PAGE = 1 << 3;
        const TO_PAGE = 1 << 4;
        const INCREMENTAL_MARKING = 1 << 5;
        const READ_ONLY_HEAP = 1 << 6;
        const CONTAINS_ONLY_OLD = 1 << 7;
        const IS_MAJOR_GC_IN_PROGRESS = 1 << 8;
        const BLACK_ALLOCATED = 1 << 9;
        const LARGE_PAGE = 1 << 10;
        const EVACUATION_CANDIDATE = 1 << 11;
        const NEVER_EVACUATE = 1 << 12;
        const COMPACTION_WAS_ABORTED = 1 << 13;
        const PINNED = 1 << 14;
        const IS_QUARANTINED = 1 << 15;
        const IS_TRUSTED = 1 << 16;
        const IN_WRITABLE_SHARED_SPACE = 1 << 17;
        const NEVER_ALLOCATE_ON_PAGE = 1 << 18;
    }
}

impl ChunkFlags {
    pub const IN_YOUNG_GENERATION: ChunkFlags = ChunkFlags::FROM_PAGE.union(ChunkFlags::TO_PAGE);

    pub const SKIP_EVACUATION_SLOTS_RECORDING: ChunkFlags =
        ChunkFlags::EVACUATION_CANDIDATE.union(ChunkFlags::IN_YOUNG_GENERATION);

    /// Flags owned by the generation and marking-mode policy. Every policy
    /// update writes all of them.
    pub const POLICY: ChunkFlags = ChunkFlags::POINTERS_TO_HERE_ARE_INTERESTING
        .union(ChunkFlags::POINTERS_FROM_HERE_ARE_INTERESTING)
        .union(ChunkFlags::INCREMENTAL_MARKING)
        .union(ChunkFlags::IS_MAJOR_GC_IN_PROGRESS)
        .union(ChunkFlags::CONTAINS_ONLY_OLD);

    /// Written only by the heap thread, never observed by helper threads
    /// while they can change.
    pub const HEAP_THREAD_ONLY: ChunkFlags = ChunkFlags::LARGE_PAGE
        .union(ChunkFlags::IS_EXECUTABLE)
        .union(ChunkFlags::IS_TRUSTED)
        .union(ChunkFlags::READ_ONLY_HEAP)
        .union(ChunkFlags::IN_YOUNG_GENERATION)
        .union(ChunkFlags::NEVER_EVACUATE)
        .union(ChunkFlags::IN_WRITABLE_SHARED_SPACE)
        .union(ChunkFlags::NEVER_ALLOCATE_ON_PAGE);

    /// Valid for a single collection cycle, reset when the chunk is swept.
    pub const PER_CYCLE: ChunkFlags = ChunkFlags::BLACK_ALLOCATED
        .union(ChunkFlags::COMPACTION_WAS_ABORTED)
        .union(ChunkFlags::PINNED);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MarkingMode {
    NoMarking,
    MinorMarking,
    MajorMarking,
}

impl MarkingMode {
    pub fn is_marking(self) -> bool {
        self != MarkingMode::NoMarking
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StickyBits {
    Disabled,
    Enabled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AllocationSpace {
    ReadOnly,
    New,
    Old,
    Code,
    Shared,
    Trusted,
    NewLarge,
    Large,
    CodeLarge,
    SharedLarge,
}

impl AllocationSpace {
    pub const ALL: [AllocationSpace; 10] = [
        AllocationSpace::ReadOnly,
        AllocationSpace::New,
        AllocationSpace::Old,
        AllocationSpace::Code,
        AllocationSpace::Shared,
        AllocationSpace::Trusted,
        AllocationSpace::NewLarge,
        AllocationSpace::Large,
        AllocationSpace::CodeLarge,
        AllocationSpace::SharedLarge,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AllocationSpace::ReadOnly => "read_only_space",
            AllocationSpace::New => "new_space",
            AllocationSpace::Old => "old_space",
            AllocationSpace::Code => "code_space",
            AllocationSpace::Shared => "shared_space",
            AllocationSpace::Trusted => "trusted_space",
            AllocationSpace::NewLarge => "new_large_object_space",
            AllocationSpace::Large => "large_object_space",
            AllocationSpace::CodeLarge => "code_large_object_space",
            AllocationSpace::SharedLarge => "shared_large_object_space",
        }
    }

    pub fn is_shared(self) -> bool {
        matches!(self, AllocationSpace::Shared | AllocationSpace::SharedLarge)
    }

    pub fn is_executable(self) -> bool {
        matches!(self, AllocationSpace::Code | AllocationSpace::CodeLarge)
    }

    pub fn is_large(self) -> bool {
        matches!(
            self,
            AllocationSpace::NewLarge
                | AllocationSpace::Large
                | AllocationSpace::CodeLarge
                | AllocationSpace::SharedLarge
        )
    }

    pub fn is_young(self) -> bool {
        matches!(self, AllocationSpace::New | AllocationSpace::NewLarge)
    }

    /// Space receiving objects of at least LARGE_OBJECT_SIZE bytes requested
    /// for this space.
    pub fn large_space(self, young: bool) -> AllocationSpace {
        match self {
            AllocationSpace::Code | AllocationSpace::CodeLarge => AllocationSpace::CodeLarge,
            AllocationSpace::Shared | AllocationSpace::SharedLarge => {
                AllocationSpace::SharedLarge
            }
            AllocationSpace::New | AllocationSpace::NewLarge => AllocationSpace::NewLarge,
            _ if young => AllocationSpace::NewLarge,
            _ => AllocationSpace::Large,
        }
    }
}

impl fmt::Display for AllocationSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index of a chunk's metadata in the raw heap's arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(u32);

impl ChunkId {
    pub fn from(index: usize) -> ChunkId {
        ChunkId(index as u32)
    }

    pub fn to_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageFlagUpdate {
    pub set: ChunkFlags,
    pub clear: ChunkFlags,
}

impl PageFlagUpdate {
    fn from_set(set: ChunkFlags) -> PageFlagUpdate {
        PageFlagUpdate {
            set,
            clear: ChunkFlags::POLICY.difference(set),
        }
    }
}

/// Header at the aligned base of every chunk.
#[repr(C)]
pub struct MemoryChunk {
    flags: AtomicUsize,
    metadata: AtomicU32,
    space: AtomicU8,
    size: usize,
}

impl MemoryChunk {
    /// Writes a fresh header. The header page must be writable.
    pub fn initialize(
        base: Address,
        metadata: ChunkId,
        space: AllocationSpace,
        size: usize,
        flags: ChunkFlags,
    ) -> &'static MemoryChunk {
        debug_assert_eq!(base.to_usize() & CHUNK_ALIGNMENT_MASK, 0);
        debug_assert!(size >= CHUNK_HEADER_SIZE);

        unsafe {
            std::ptr::write(
                base.to_mut_ptr::<MemoryChunk>(),
                MemoryChunk {
                    flags: AtomicUsize::new(flags.bits()),
                    metadata: AtomicU32::new(metadata.0),
                    space: AtomicU8::new(space.into()),
                    size,
                },
            );

            &*base.to_ptr::<MemoryChunk>()
        }
    }

    #[inline(always)]
    pub fn from_address(addr: Address) -> &'static MemoryChunk {
        let base = addr.to_usize() & !CHUNK_ALIGNMENT_MASK;
        unsafe { &*(base as *const MemoryChunk) }
    }

    /// Offset of the flag word, used by code emitting inline barrier checks.
    pub fn flags_offset() -> usize {
        offset_of!(MemoryChunk, flags)
    }

    pub fn address(&self) -> Address {
        Address::from_ptr(self as *const MemoryChunk)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn area_start(&self) -> Address {
        self.address().offset(CHUNK_HEADER_SIZE)
    }

    pub fn area_end(&self) -> Address {
        self.address().offset(self.size)
    }

    pub fn area(&self) -> Region {
        Region::new(self.area_start(), self.area_end())
    }

    pub fn metadata_id(&self) -> ChunkId {
        ChunkId(self.metadata.load(Ordering::Relaxed))
    }

    pub fn space(&self) -> AllocationSpace {
        match AllocationSpace::try_from(self.space.load(Ordering::Relaxed)) {
            Ok(space) => space,
            Err(_) => fatal(FatalError::ObjectOutsideHeap {
                object: self.address(),
            }),
        }
    }

    /// Moves a chunk to another space. Heap thread only, the chunk must be
    /// writable.
    pub fn set_space(&self, space: AllocationSpace) {
        self.space.store(space.into(), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_flag_set(&self, flag: ChunkFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Mutates a flag of a non-executable chunk.
    pub fn set_flag(&self, flag: ChunkFlags) {
        debug_assert!(!self.is_executable());
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: ChunkFlags) {
        debug_assert!(!self.is_executable());
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Like `set_flag` but also works for executable chunks, whose header
    /// is write protected outside of a `ChunkWriteScope`.
    pub fn set_flag_slow(&self, flag: ChunkFlags, page_allocator: &dyn PageAllocator) {
        self.update_flags(
            PageFlagUpdate {
                set: flag,
                clear: ChunkFlags::empty(),
            },
            page_allocator,
        );
    }

    pub fn clear_flag_slow(&self, flag: ChunkFlags, page_allocator: &dyn PageAllocator) {
        self.update_flags(
            PageFlagUpdate {
                set: ChunkFlags::empty(),
                clear: flag,
            },
            page_allocator,
        );
    }

    /// Applies `set` and `clear` in a single atomic update.
    pub fn update_flags(&self, update: PageFlagUpdate, page_allocator: &dyn PageAllocator) {
        if self.is_executable() {
            let _scope = ChunkWriteScope::new(self, page_allocator);
            self.apply(update);
        } else {
            self.apply(update);
        }
    }

    fn apply(&self, update: PageFlagUpdate) {
        let set = update.set.bits();
        let clear = update.clear.bits();

        let _ = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some((old & !clear) | set)
            });
    }

    pub fn old_generation_page_flags(
        marking_mode: MarkingMode,
        space: AllocationSpace,
        sticky_bits: StickyBits,
    ) -> PageFlagUpdate {
        let mut set = ChunkFlags::empty();

        // With sticky mark bits young objects live in old space chunks.
        if sticky_bits == StickyBits::Disabled || space != AllocationSpace::Old {
            set |= ChunkFlags::CONTAINS_ONLY_OLD;
        }

        if marking_mode == MarkingMode::MajorMarking {
            set |= ChunkFlags::POINTERS_TO_HERE_ARE_INTERESTING
                | ChunkFlags::POINTERS_FROM_HERE_ARE_INTERESTING
                | ChunkFlags::INCREMENTAL_MARKING
                | ChunkFlags::IS_MAJOR_GC_IN_PROGRESS;
        } else if space.is_shared() {
            set |= ChunkFlags::POINTERS_TO_HERE_ARE_INTERESTING;
        } else {
            set |= ChunkFlags::POINTERS_FROM_HERE_ARE_INTERESTING;

            if marking_mode == MarkingMode::MinorMarking {
                set |= ChunkFlags::INCREMENTAL_MARKING;
            }
        }

        PageFlagUpdate::from_set(set)
    }

    pub fn young_generation_page_flags(marking_mode: MarkingMode) -> PageFlagUpdate {
        let mut set = ChunkFlags::POINTERS_TO_HERE_ARE_INTERESTING;

        if marking_mode.is_marking() {
            set |= ChunkFlags::POINTERS_FROM_HERE_ARE_INTERESTING | ChunkFlags::INCREMENTAL_MARKING;
        }

        if marking_mode == MarkingMode::MajorMarking {
            set |= ChunkFlags::IS_MAJOR_GC_IN_PROGRESS;
        }

        PageFlagUpdate::from_set(set)
    }

    pub fn set_old_generation_page_flags(
        &self,
        marking_mode: MarkingMode,
        space: AllocationSpace,
        sticky_bits: StickyBits,
        page_allocator: &dyn PageAllocator,
    ) {
        let update = MemoryChunk::old_generation_page_flags(marking_mode, space, sticky_bits);
        self.update_flags(update, page_allocator);
    }

    pub fn set_young_generation_page_flags(
        &self,
        marking_mode: MarkingMode,
        page_allocator: &dyn PageAllocator,
    ) {
        let update = MemoryChunk::young_generation_page_flags(marking_mode);
        self.update_flags(update, page_allocator);
    }

    pub fn is_evacuation_candidate(&self) -> bool {
        let flags = self.flags();

        if cfg!(debug_assertions)
            && flags.contains(ChunkFlags::NEVER_EVACUATE)
            && flags.contains(ChunkFlags::EVACUATION_CANDIDATE)
        {
            fatal(FatalError::NeverEvacuateCandidate {
                chunk: self.address(),
            });
        }

        flags.contains(ChunkFlags::EVACUATION_CANDIDATE)
    }

    pub fn should_skip_evacuation_slot_recording(&self) -> bool {
        let flags = self.flags();
        flags.intersects(ChunkFlags::SKIP_EVACUATION_SLOTS_RECORDING)
            && !flags.contains(ChunkFlags::COMPACTION_WAS_ABORTED)
    }

    pub fn can_allocate(&self) -> bool {
        !self.is_evacuation_candidate() && !self.is_flag_set(ChunkFlags::NEVER_ALLOCATE_ON_PAGE)
    }

    pub fn never_evacuate(&self) -> bool {
        self.is_flag_set(ChunkFlags::NEVER_EVACUATE)
    }

    pub fn in_young_generation(&self) -> bool {
        self.flags().intersects(ChunkFlags::IN_YOUNG_GENERATION)
    }

    pub fn is_large_page(&self) -> bool {
        self.is_flag_set(ChunkFlags::LARGE_PAGE)
    }

    pub fn is_executable(&self) -> bool {
        self.is_flag_set(ChunkFlags::IS_EXECUTABLE)
    }

    pub fn is_trusted(&self) -> bool {
        self.is_flag_set(ChunkFlags::IS_TRUSTED)
    }

    pub fn is_read_only(&self) -> bool {
        self.is_flag_set(ChunkFlags::READ_ONLY_HEAP)
    }

    pub fn is_pinned(&self) -> bool {
        self.is_flag_set(ChunkFlags::PINNED)
    }

    pub fn is_quarantined(&self) -> bool {
        self.is_flag_set(ChunkFlags::IS_QUARANTINED)
    }

    pub fn is_marking(&self) -> bool {
        self.is_flag_set(ChunkFlags::INCREMENTAL_MARKING)
    }

    pub fn is_major_gc_in_progress(&self) -> bool {
        self.is_flag_set(ChunkFlags::IS_MAJOR_GC_IN_PROGRESS)
    }

    pub fn is_black_allocated(&self) -> bool {
        self.is_flag_set(ChunkFlags::BLACK_ALLOCATED)
    }

    pub fn contains_only_old(&self) -> bool {
        self.is_flag_set(ChunkFlags::CONTAINS_ONLY_OLD)
    }

    pub fn compaction_was_aborted(&self) -> bool {
        self.is_flag_set(ChunkFlags::COMPACTION_WAS_ABORTED)
    }

    pub fn in_writable_shared_space(&self) -> bool {
        self.is_flag_set(ChunkFlags::IN_WRITABLE_SHARED_SPACE)
    }

    pub fn pointers_to_here_are_interesting(&self) -> bool {
        self.is_flag_set(ChunkFlags::POINTERS_TO_HERE_ARE_INTERESTING)
    }

    pub fn pointers_from_here_are_interesting(&self) -> bool {
        self.is_flag_set(ChunkFlags::POINTERS_FROM_HERE_ARE_INTERESTING)
    }
}

/// Makes the header of an executable chunk writable until dropped.
pub struct ChunkWriteScope<'a> {
    base: Address,
    page_allocator: &'a dyn PageAllocator,
}

impl<'a> ChunkWriteScope<'a> {
    pub fn new(chunk: &MemoryChunk, page_allocator: &'a dyn PageAllocator) -> ChunkWriteScope<'a> {
        let base = chunk.address();

        if !page_allocator.set_permissions(base, CHUNK_HEADER_SIZE, MemoryPermissions::ReadWrite) {
            fatal(FatalError::ChunkProtectionFailed { chunk: base });
        }

        ChunkWriteScope {
            base,
            page_allocator,
        }
    }
}

impl<'a> Drop for ChunkWriteScope<'a> {
    fn drop(&mut self) {
        if !self
            .page_allocator
            .set_permissions(self.base, CHUNK_HEADER_SIZE, MemoryPermissions::Read)
        {
            fatal(FatalError::ChunkProtectionFailed { chunk: self.base });
        }
    }
}
