use crate::gc::allocator::{AllocationContext, ObjectAllocator};
use crate::gc::chunk::{ChunkFlags, ChunkId, MemoryChunk};
use crate::gc::page_backend::PageBackend;
use crate::gc::root::Slot;
use crate::gc::space::{release_chunk_memory, walk_objects, RawHeap};
use crate::gc::visitor::{HeapVisitor, ObjectVisitor};
use crate::gc::Address;
use crate::mem;

/// Address of the copy for evacuated objects, the object itself otherwise.
#[inline(always)]
pub fn forwarded(object: Address) -> Address {
    if object.is_null() {
        return object;
    }

    object
        .to_obj()
        .header()
        .forwarding_address()
        .unwrap_or(object)
}

pub fn forward_reference(slot: Slot) {
    let object = slot.get();
    let target = forwarded(object);

    if target != object {
        slot.set(target);
    }
}

struct UpdatingVisitor;

impl ObjectVisitor for UpdatingVisitor {
    fn visit_pointer(&mut self, _host: Address, slot: Slot) {
        forward_reference(slot);
    }
}

impl HeapVisitor for UpdatingVisitor {
    const USE_PRECOMPUTED_OBJECT_SIZE: bool = true;
    const SHOULD_VISIT_MAP_POINTER: bool = false;
}

#[derive(Default, Debug)]
pub struct CompactionResult {
    pub moved_objects: usize,
    pub moved_bytes: usize,
    pub aborted_chunks: usize,
}

/// Evacuates sparse chunks of compactable spaces during major collections.
pub struct Compactor {
    enabled: bool,
    candidates: Vec<ChunkId>,
    moved: Vec<Address>,
}

impl Compactor {
    pub fn new(enabled: bool) -> Compactor {
        Compactor {
            enabled,
            candidates: Vec::new(),
            moved: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn candidates(&self) -> &[ChunkId] {
        &self.candidates
    }

    /// Flags chunks whose live bytes from the last sweep are below half of
    /// the area. Allocation buffers must be retired before.
    pub fn select_evacuation_candidates(
        &mut self,
        raw_heap: &RawHeap,
        allocator: &mut ObjectAllocator,
    ) -> usize {
        debug_assert!(self.candidates.is_empty());

        if !self.enabled {
            return 0;
        }

        for space in raw_heap.spaces() {
            if !space.is_compactable() || space.kind().is_large() {
                continue;
            }

            for &id in space.chunks() {
                let metadata = raw_heap.metadata(id);
                let chunk = metadata.chunk();

                if chunk.is_executable() || chunk.never_evacuate() || chunk.is_pinned() {
                    continue;
                }

                let sparse = match metadata.live_bytes() {
                    Some(live_bytes) => live_bytes < metadata.area().size() / 2,
                    None => false,
                };

                if sparse {
                    chunk.set_flag(ChunkFlags::EVACUATION_CANDIDATE);
                    allocator.remove_chunk_from_free_lists(space.id(), metadata.area());
                    self.candidates.push(id);
                }
            }
        }

        log::debug!(
            "GC: {} evacuation candidates selected",
            self.candidates.len()
        );

        self.candidates.len()
    }

    /// A conservative root points into `chunk`: its objects stay where they
    /// are for this cycle.
    pub fn cancel_for_pinned(&mut self, chunk: &MemoryChunk) {
        chunk.set_flag(ChunkFlags::PINNED | ChunkFlags::COMPACTION_WAS_ABORTED);

        if chunk.is_evacuation_candidate() {
            chunk.clear_flag(ChunkFlags::EVACUATION_CANDIDATE);
            let id = chunk.metadata_id();
            self.candidates.retain(|&candidate| candidate != id);
        }
    }

    /// Copies every marked object off the candidates and installs
    /// forwarding pointers. `on_move` runs once per moved object. A failed
    /// allocation leaves the rest of the chunk in place.
    pub fn compact<F>(
        &mut self,
        raw_heap: &mut RawHeap,
        page_backend: &mut PageBackend,
        allocator: &mut ObjectAllocator,
        ctx: &AllocationContext,
        mut on_move: F,
    ) -> CompactionResult
    where
        F: FnMut(Address, Address, usize),
    {
        let mut result = CompactionResult::default();

        for id in self.candidates.clone() {
            let (area, space, chunk) = {
                let metadata = raw_heap.metadata(id);
                (metadata.area(), metadata.space(), metadata.chunk())
            };

            walk_objects(area, |object, descriptor, size| {
                let header = object.to_obj().header();

                if descriptor.tag.is_filler_or_free_space()
                    || header.is_forwarded()
                    || !header.is_marked()
                    || chunk.compaction_was_aborted()
                {
                    return;
                }

                let target = match allocator.allocate_raw(raw_heap, page_backend, space, size, ctx)
                {
                    Ok(target) => target,
                    Err(err) => {
                        log::debug!("GC: evacuation of {} aborted: {}", chunk.address(), err);
                        chunk.set_flag(ChunkFlags::COMPACTION_WAS_ABORTED);
                        return;
                    }
                };

                debug_assert!(!MemoryChunk::from_address(target).is_evacuation_candidate());

                mem::copy_bytes(object, target, size);

                header.install_forwarding_address(target);
                on_move(object, target, size);

                self.moved.push(target);
                result.moved_objects += 1;
                result.moved_bytes += size;
            });

            if chunk.compaction_was_aborted() {
                result.aborted_chunks += 1;
            }
        }

        allocator.reset_linear_allocation_buffers();
        result
    }

    /// Redirects references to evacuated objects in `recorded_slots`, the
    /// moved objects and every live object on chunks that never recorded
    /// slots (aborted candidates and young chunks). Roots are updated by
    /// the caller with `forward_reference`.
    pub fn update_references(&mut self, raw_heap: &RawHeap, recorded_slots: &[Slot]) {
        for &slot in recorded_slots {
            forward_reference(slot);
        }

        let mut visitor = UpdatingVisitor;

        for object in self.moved.drain(..) {
            let obj = object.to_obj();
            visitor.visit_with_known_size(obj.descriptor(), object, obj.size());
        }

        for id in raw_heap.chunk_ids() {
            let metadata = raw_heap.metadata(id);
            let chunk = metadata.chunk();

            if !chunk.compaction_was_aborted() && !chunk.in_young_generation() {
                continue;
            }

            walk_objects(metadata.area(), |object, descriptor, size| {
                let header = object.to_obj().header();

                if descriptor.tag.is_filler_or_free_space()
                    || header.is_forwarded()
                    || !header.is_marked()
                {
                    return;
                }

                visitor.visit_with_known_size(descriptor, object, size);
            });
        }
    }

    /// Releases fully evacuated candidates and turns aborted ones back into
    /// regular chunks. Returns the number of released chunks.
    pub fn release_evacuated_chunks(
        &mut self,
        raw_heap: &mut RawHeap,
        page_backend: &mut PageBackend,
    ) -> usize {
        let mut released = 0;

        for id in std::mem::take(&mut self.candidates) {
            let chunk = raw_heap.metadata(id).chunk();

            if chunk.compaction_was_aborted() {
                chunk.clear_flag(ChunkFlags::EVACUATION_CANDIDATE);
                continue;
            }

            let metadata = raw_heap.remove_chunk(id);
            release_chunk_memory(&metadata, page_backend);
            released += 1;
        }

        released
    }
}
