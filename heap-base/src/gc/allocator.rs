use crate::error::{fatal, FatalError, HeapError};
use crate::gc::chunk::{
    AllocationSpace, ChunkFlags, ChunkId, MarkingMode, MemoryChunk, StickyBits, CHUNK_SIZE,
    LARGE_OBJECT_SIZE,
};
use crate::gc::freelist::FreeList;
use crate::gc::object::{TypeDescriptor, WORD_SIZE};
use crate::gc::page_backend::PageBackend;
use crate::gc::space::{RawHeap, SpaceId};
use crate::gc::{fill_region, Address, Region};
use crate::mem;

/// Largest object size the allocator accepts. Bigger requests fail with
/// `HeapError::OutOfMemory` before any size arithmetic.
pub const MAX_OBJECT_SIZE: usize = isize::MAX as usize / 2;

pub fn check_object_size(size: usize) -> Result<(), HeapError> {
    if size > MAX_OBJECT_SIZE {
        return Err(HeapError::OutOfMemory {
            requested: size,
            context: "object exceeds maximum size",
        });
    }

    Ok(())
}

/// Heap state that decides how new chunks and objects are set up.
#[derive(Copy, Clone, Debug)]
pub struct AllocationContext {
    pub marking_mode: MarkingMode,
    pub sticky_bits: StickyBits,
    pub black_allocation: bool,
}

impl Default for AllocationContext {
    fn default() -> AllocationContext {
        AllocationContext {
            marking_mode: MarkingMode::NoMarking,
            sticky_bits: StickyBits::Disabled,
            black_allocation: false,
        }
    }
}

#[derive(Copy, Clone)]
struct LinearAllocationBuffer {
    top: Address,
    limit: Address,
}

impl LinearAllocationBuffer {
    fn empty() -> LinearAllocationBuffer {
        LinearAllocationBuffer {
            top: Address::null(),
            limit: Address::null(),
        }
    }

    fn bump(&mut self, size: usize) -> Option<Address> {
        if self.top.is_null() {
            return None;
        }

        let next = self.top.offset(size);

        if next <= self.limit {
            let object = self.top;
            self.top = next;
            Some(object)
        } else {
            None
        }
    }
}

pub struct ObjectAllocator {
    labs: Vec<LinearAllocationBuffer>,
    free_lists: Vec<FreeList>,
    allocated_bytes: usize,
}

impl ObjectAllocator {
    pub fn new(space_count: usize) -> ObjectAllocator {
        ObjectAllocator {
            labs: vec![LinearAllocationBuffer::empty(); space_count],
            free_lists: (0..space_count).map(|_| FreeList::new()).collect(),
            allocated_bytes: 0,
        }
    }

    /// Bytes allocated by the mutator since the last collection.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn reset_allocated_bytes(&mut self) {
        self.allocated_bytes = 0;
    }

    pub fn free_list(&self, space: SpaceId) -> &FreeList {
        &self.free_lists[space.to_usize()]
    }

    pub fn free_bytes(&self) -> usize {
        self.free_lists.iter().map(|list| list.free_bytes()).sum()
    }

    pub fn add_free_region(&mut self, space: SpaceId, region: Region) {
        self.free_lists[space.to_usize()].add(region);
    }

    pub fn remove_chunk_from_free_lists(&mut self, space: SpaceId, area: Region) {
        self.free_lists[space.to_usize()].remove_chunk(area);
    }

    pub fn linear_allocation_buffer(&self, space: SpaceId) -> Region {
        let lab = &self.labs[space.to_usize()];
        Region::new(lab.top, lab.limit)
    }

    /// Covers the unused rest of every buffer with free space, making the
    /// heap iterable.
    pub fn reset_linear_allocation_buffers(&mut self) {
        for lab in &mut self.labs {
            fill_region(lab.top, lab.limit);
            *lab = LinearAllocationBuffer::empty();
        }
    }

    pub fn allocate(
        &mut self,
        raw_heap: &mut RawHeap,
        page_backend: &mut PageBackend,
        space: SpaceId,
        descriptor: &'static TypeDescriptor,
        size: usize,
        ctx: &AllocationContext,
    ) -> Result<Address, HeapError> {
        check_object_size(size)?;
        let size = mem::align_usize_up(size, WORD_SIZE);
        let object = self.allocate_raw(raw_heap, page_backend, space, size, ctx)?;
        object.to_obj().header().setup(descriptor, ctx.black_allocation);
        self.allocated_bytes += size;
        Ok(object)
    }

    /// Reserves `size` bytes without initializing a header. Used directly
    /// by evacuation, which copies the header.
    pub fn allocate_raw(
        &mut self,
        raw_heap: &mut RawHeap,
        page_backend: &mut PageBackend,
        space: SpaceId,
        size: usize,
        ctx: &AllocationContext,
    ) -> Result<Address, HeapError> {
        debug_assert!(mem::is_aligned(size, WORD_SIZE));

        let object = if size >= LARGE_OBJECT_SIZE {
            self.allocate_large(raw_heap, page_backend, space, size, ctx)?
        } else {
            self.allocate_normal(raw_heap, page_backend, space, size, ctx)?
        };

        let chunk = MemoryChunk::from_address(object);
        raw_heap
            .metadata_mut(chunk.metadata_id())
            .record_object_start(object);

        Ok(object)
    }

    fn allocate_normal(
        &mut self,
        raw_heap: &mut RawHeap,
        page_backend: &mut PageBackend,
        space: SpaceId,
        size: usize,
        ctx: &AllocationContext,
    ) -> Result<Address, HeapError> {
        if let Some(object) = self.labs[space.to_usize()].bump(size) {
            return Ok(object);
        }

        self.refill(raw_heap, page_backend, space, size, ctx)?;

        match self.labs[space.to_usize()].bump(size) {
            Some(object) => Ok(object),
            None => Err(HeapError::OutOfMemory {
                requested: size,
                context: "linear allocation buffer",
            }),
        }
    }

    fn refill(
        &mut self,
        raw_heap: &mut RawHeap,
        page_backend: &mut PageBackend,
        space: SpaceId,
        size: usize,
        ctx: &AllocationContext,
    ) -> Result<(), HeapError> {
        let lab = &mut self.labs[space.to_usize()];
        fill_region(lab.top, lab.limit);
        *lab = LinearAllocationBuffer::empty();

        while let Some(region) = self.free_lists[space.to_usize()].allocate(size) {
            // entries on evacuation candidates are dropped
            if MemoryChunk::from_address(region.start).can_allocate() {
                self.labs[space.to_usize()] = LinearAllocationBuffer {
                    top: region.start,
                    limit: region.end,
                };
                return Ok(());
            }
        }

        let kind = raw_heap.space(space).kind();
        let base = page_backend.allocate_normal_chunk(kind.is_executable())?;
        let id = add_chunk(raw_heap, page_backend, space, base, CHUNK_SIZE, ctx);

        let area = raw_heap.metadata(id).area();
        fill_region(area.start, area.end);
        self.labs[space.to_usize()] = LinearAllocationBuffer {
            top: area.start,
            limit: area.end,
        };

        Ok(())
    }

    fn allocate_large(
        &mut self,
        raw_heap: &mut RawHeap,
        page_backend: &mut PageBackend,
        space: SpaceId,
        size: usize,
        ctx: &AllocationContext,
    ) -> Result<Address, HeapError> {
        let kind = raw_heap.space(space).kind();
        let young = ctx.sticky_bits == StickyBits::Enabled && kind == AllocationSpace::Old;
        let large_space = RawHeap::space_id(kind.large_space(young));
        let executable = kind.is_executable();

        let (base, chunk_size) = page_backend.allocate_large_chunk(size, executable)?;
        let id = add_chunk(raw_heap, page_backend, large_space, base, chunk_size, ctx);

        let area = raw_heap.metadata(id).area();
        fill_region(area.start.offset(size), area.end);
        Ok(area.start)
    }
}

/// Flags a chunk of `kind` carries for its whole lifetime.
pub fn static_chunk_flags(kind: AllocationSpace) -> ChunkFlags {
    let mut flags = ChunkFlags::empty();

    match kind {
        AllocationSpace::ReadOnly => {
            flags |= ChunkFlags::READ_ONLY_HEAP | ChunkFlags::NEVER_EVACUATE;
        }
        AllocationSpace::Code | AllocationSpace::CodeLarge => {
            flags |= ChunkFlags::IS_EXECUTABLE;
        }
        AllocationSpace::Trusted => {
            flags |= ChunkFlags::IS_TRUSTED;
        }
        AllocationSpace::Shared | AllocationSpace::SharedLarge => {
            flags |= ChunkFlags::IN_WRITABLE_SHARED_SPACE;
        }
        AllocationSpace::New | AllocationSpace::NewLarge => {
            flags |= ChunkFlags::TO_PAGE;
        }
        AllocationSpace::Old | AllocationSpace::Large => {}
    }

    if kind.is_large() {
        flags |= ChunkFlags::LARGE_PAGE;
    }

    flags
}

/// Registers a fresh chunk with the flags of its space and the current
/// marking mode. Executable chunks get their header write protected.
pub fn add_chunk(
    raw_heap: &mut RawHeap,
    page_backend: &mut PageBackend,
    space: SpaceId,
    base: Address,
    size: usize,
    ctx: &AllocationContext,
) -> ChunkId {
    let kind = raw_heap.space(space).kind();
    let mut flags = static_chunk_flags(kind);

    if ctx.black_allocation {
        flags |= ChunkFlags::BLACK_ALLOCATED;
    }

    let update = if kind.is_young() {
        MemoryChunk::young_generation_page_flags(ctx.marking_mode)
    } else {
        MemoryChunk::old_generation_page_flags(ctx.marking_mode, kind, ctx.sticky_bits)
    };

    flags = flags.difference(update.clear).union(update.set);
    let id = raw_heap.add_chunk(space, base, size, flags);

    if kind.is_executable() && !page_backend.protect_chunk_header(base) {
        fatal(FatalError::ChunkProtectionFailed { chunk: base });
    }

    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::chunk::CHUNK_AREA_SIZE;
    use crate::gc::object::{FixedArray, FIXED_ARRAY_TYPE, SEQ_STRING_TYPE};
    use crate::gc::platform::DefaultPlatform;
    use crate::gc::K;

    struct TestHeap {
        raw_heap: RawHeap,
        backend: PageBackend,
        allocator: ObjectAllocator,
    }

    impl TestHeap {
        fn new(max_heap_size: Option<usize>) -> TestHeap {
            let raw_heap = RawHeap::new(&[]);
            let allocator = ObjectAllocator::new(raw_heap.space_count());

            TestHeap {
                raw_heap,
                backend: PageBackend::new(DefaultPlatform::new(), max_heap_size),
                allocator,
            }
        }

        fn allocate(
            &mut self,
            kind: AllocationSpace,
            size: usize,
            ctx: &AllocationContext,
        ) -> Result<Address, HeapError> {
            self.allocator.allocate(
                &mut self.raw_heap,
                &mut self.backend,
                RawHeap::space_id(kind),
                &FIXED_ARRAY_TYPE,
                size,
                ctx,
            )
        }
    }

    impl Drop for TestHeap {
        fn drop(&mut self) {
            self.allocator.reset_linear_allocation_buffers();
            self.raw_heap.release_all(&mut self.backend);
        }
    }

    #[test]
    fn bump_allocation_is_contiguous() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();

        let first = heap
            .allocate(AllocationSpace::Old, FixedArray::size_for(2), &ctx)
            .expect("alloc");
        FixedArray::initialize(first, 2);
        let second = heap
            .allocate(AllocationSpace::Old, FixedArray::size_for(1) - 4, &ctx)
            .expect("alloc");
        FixedArray::initialize(second, 1);
        assert_eq!(second, first.offset(32));
        assert_eq!(heap.allocator.allocated_bytes(), 56);

        let chunk = MemoryChunk::from_address(first);
        assert_eq!(chunk.area_start(), first);
        assert_eq!(chunk.space(), AllocationSpace::Old);
        assert!(chunk.contains_only_old());
        assert!(chunk.pointers_from_here_are_interesting());
        assert!(!first.to_obj().header().is_marked());

        let metadata = heap.raw_heap.metadata(chunk.metadata_id());
        assert_eq!(metadata.find_object_start(second.offset(16)), Some(second));
        assert_eq!(metadata.find_object_start(first.offset(24)), Some(first));
    }

    #[test]
    fn allocation_opens_new_chunks() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();
        let size = 32 * K;

        let objects: Vec<Address> = (0..CHUNK_AREA_SIZE / size + 1)
            .map(|_| heap.allocate(AllocationSpace::Old, size, &ctx).expect("alloc"))
            .collect();

        let old = RawHeap::space_id(AllocationSpace::Old);
        assert_eq!(heap.raw_heap.space(old).chunks().len(), 2);
        let last = objects[objects.len() - 1];
        assert_ne!(
            MemoryChunk::from_address(last).address(),
            MemoryChunk::from_address(objects[0]).address()
        );
    }

    #[test]
    fn chunks_carry_the_static_flags_of_their_space() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();
        let size = FixedArray::size_for(1);

        let trusted = heap
            .allocate(AllocationSpace::Trusted, size, &ctx)
            .expect("alloc");
        let shared = heap
            .allocate(AllocationSpace::Shared, size, &ctx)
            .expect("alloc");
        let old = heap.allocate(AllocationSpace::Old, size, &ctx).expect("alloc");

        for object in [trusted, shared, old] {
            FixedArray::initialize(object, 1);
            assert!(!MemoryChunk::from_address(object).is_quarantined());
        }

        assert!(MemoryChunk::from_address(trusted).is_trusted());
        assert!(!MemoryChunk::from_address(trusted).in_writable_shared_space());
        assert!(MemoryChunk::from_address(shared).in_writable_shared_space());
        assert!(!MemoryChunk::from_address(old).is_trusted());
        assert!(!MemoryChunk::from_address(old).in_writable_shared_space());
    }

    #[test]
    fn large_objects_get_their_own_chunk() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();

        let object = heap
            .allocate(AllocationSpace::Old, LARGE_OBJECT_SIZE + 8, &ctx)
            .expect("alloc");
        let chunk = MemoryChunk::from_address(object);

        assert!(chunk.is_large_page());
        assert_eq!(chunk.space(), AllocationSpace::Large);
        assert_eq!(chunk.area_start(), object);
        assert!(!chunk.in_young_generation());

        let sticky = AllocationContext {
            sticky_bits: StickyBits::Enabled,
            ..AllocationContext::default()
        };
        let young = heap
            .allocate(AllocationSpace::Old, LARGE_OBJECT_SIZE, &sticky)
            .expect("alloc");
        let chunk = MemoryChunk::from_address(young);
        assert_eq!(chunk.space(), AllocationSpace::NewLarge);
        assert!(chunk.in_young_generation());
        assert!(chunk.pointers_to_here_are_interesting());
    }

    #[test]
    fn black_allocation_marks_objects_and_chunks() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext {
            marking_mode: MarkingMode::MajorMarking,
            sticky_bits: StickyBits::Disabled,
            black_allocation: true,
        };

        let object = heap.allocate(AllocationSpace::Old, 64, &ctx).expect("alloc");
        let chunk = MemoryChunk::from_address(object);

        assert!(object.to_obj().header().is_marked());
        assert!(chunk.is_black_allocated());
        assert!(chunk.is_marking());
        assert!(chunk.is_major_gc_in_progress());
    }

    #[test]
    fn code_chunks_are_protected() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();

        let object = heap.allocate(AllocationSpace::Code, 48, &ctx).expect("alloc");
        let chunk = MemoryChunk::from_address(object);
        assert!(chunk.is_executable());

        let page_allocator = heap.backend.page_allocator();
        chunk.set_old_generation_page_flags(
            MarkingMode::MajorMarking,
            AllocationSpace::Code,
            StickyBits::Disabled,
            page_allocator,
        );
        assert!(chunk.is_major_gc_in_progress());
    }

    #[test]
    fn free_list_entries_on_candidates_are_skipped() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();
        let old = RawHeap::space_id(AllocationSpace::Old);

        let object = heap.allocate(AllocationSpace::Old, 64, &ctx).expect("alloc");
        heap.allocator.reset_linear_allocation_buffers();

        let chunk = MemoryChunk::from_address(object);
        let area = chunk.area();
        heap.allocator
            .add_free_region(old, Region::new(object.offset(64), area.end));
        chunk.set_flag(ChunkFlags::EVACUATION_CANDIDATE);

        let next = heap.allocate(AllocationSpace::Old, 64, &ctx).expect("alloc");
        assert_ne!(
            MemoryChunk::from_address(next).address(),
            chunk.address()
        );
        chunk.clear_flag(ChunkFlags::EVACUATION_CANDIDATE);
    }

    #[test]
    fn free_list_regions_are_reused() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();
        let old = RawHeap::space_id(AllocationSpace::Old);

        let object = heap.allocate(AllocationSpace::Old, 64, &ctx).expect("alloc");
        heap.allocator.reset_linear_allocation_buffers();
        heap.allocator
            .add_free_region(old, Region::new(object, object.offset(64)));

        let reused = heap.allocate(AllocationSpace::Old, 64, &ctx).expect("alloc");
        assert_eq!(reused, object);
    }

    #[test]
    fn heap_limit_surfaces_as_error() {
        let mut heap = TestHeap::new(Some(CHUNK_SIZE));
        let ctx = AllocationContext::default();

        heap.allocate(AllocationSpace::Old, 64, &ctx).expect("alloc");
        let result = heap.allocate(AllocationSpace::Old, LARGE_OBJECT_SIZE, &ctx);
        assert!(matches!(result, Err(HeapError::HeapLimitExceeded { .. })));
    }

    #[test]
    fn headers_are_initialized() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();
        let object = heap
            .allocator
            .allocate(
                &mut heap.raw_heap,
                &mut heap.backend,
                RawHeap::space_id(AllocationSpace::Old),
                &SEQ_STRING_TYPE,
                20,
                &ctx,
            )
            .expect("alloc");

        assert_eq!(object.to_obj().descriptor().name, "SeqString");
        assert_eq!(heap.allocator.allocated_bytes(), 24);
        assert_eq!(FixedArray::size_for(1), 24);
    }

    #[test]
    fn oversized_requests_fail_without_chunks() {
        let mut heap = TestHeap::new(None);
        let ctx = AllocationContext::default();

        for size in [usize::MAX & !(WORD_SIZE - 1), MAX_OBJECT_SIZE + 1] {
            match heap.allocate(AllocationSpace::Old, size, &ctx) {
                Err(HeapError::OutOfMemory { requested, .. }) => assert_eq!(requested, size),
                _ => panic!("allocation of {} bytes must fail", size),
            }
        }

        assert_eq!(heap.allocator.allocated_bytes(), 0);
        assert_eq!(heap.backend.committed_bytes(), 0);
    }
}
