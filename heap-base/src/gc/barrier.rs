//! Write barrier executed for every reference store into a heap object.

use crate::gc::chunk::{ChunkFlags, MemoryChunk};
use crate::gc::marking::Marker;
use crate::gc::remembered_set::OldToNewRememberedSet;
use crate::gc::root::Slot;
use crate::gc::Address;

/// True for objects a minor collection would trace: objects on young pages
/// and unmarked objects on chunks that may hold young objects.
#[inline(always)]
pub fn is_young(object: Address) -> bool {
    let flags = MemoryChunk::from_address(object).flags();

    if flags.intersects(ChunkFlags::IN_YOUNG_GENERATION) {
        return true;
    }

    !flags.contains(ChunkFlags::CONTAINS_ONLY_OLD) && !object.to_obj().header().is_marked()
}

/// Stores are done by the caller. `marker` is the active marker, if any.
#[inline(always)]
pub fn write_barrier(
    host: Address,
    slot: Slot,
    value: Address,
    marker: Option<&Marker>,
    remembered_set: &OldToNewRememberedSet,
) {
    if value.is_null() {
        return;
    }

    let host_flags = MemoryChunk::from_address(host).flags();
    let value_flags = MemoryChunk::from_address(value).flags();

    if host_flags.contains(ChunkFlags::INCREMENTAL_MARKING) {
        if let Some(marker) = marker {
            marking_barrier(host_flags, value_flags, slot, value, marker);
        }
    }

    if host_flags.contains(ChunkFlags::POINTERS_FROM_HERE_ARE_INTERESTING)
        && possibly_young(value_flags)
    {
        generational_barrier(host, slot, value, remembered_set);
    }
}

#[inline(always)]
fn possibly_young(value_flags: ChunkFlags) -> bool {
    value_flags.intersects(ChunkFlags::IN_YOUNG_GENERATION)
        || !value_flags.contains(ChunkFlags::CONTAINS_ONLY_OLD)
}

#[inline(always)]
fn marking_barrier(
    host_flags: ChunkFlags,
    value_flags: ChunkFlags,
    slot: Slot,
    value: Address,
    marker: &Marker,
) {
    marker.mark_from_barrier(value);

    if value_flags.contains(ChunkFlags::EVACUATION_CANDIDATE)
        && !(host_flags.intersects(ChunkFlags::SKIP_EVACUATION_SLOTS_RECORDING)
            && !host_flags.contains(ChunkFlags::COMPACTION_WAS_ABORTED))
    {
        marker.record_slot_from_barrier(slot);
    }
}

#[inline(always)]
fn generational_barrier(
    host: Address,
    slot: Slot,
    value: Address,
    remembered_set: &OldToNewRememberedSet,
) {
    if is_young(value) && !is_young(host) {
        remembered_set.insert(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::MarkingType;
    use crate::gc::allocator::{AllocationContext, ObjectAllocator};
    use crate::gc::chunk::{AllocationSpace, MarkingMode, StickyBits};
    use crate::gc::marking::MarkingConfig;
    use crate::gc::object::{FixedArray, FIXED_ARRAY_TYPE};
    use crate::gc::page_backend::PageBackend;
    use crate::gc::platform::DefaultPlatform;
    use crate::gc::root::StackState;
    use crate::gc::space::RawHeap;
    use crate::gc::CollectionType;

    struct TestHeap {
        raw_heap: RawHeap,
        backend: PageBackend,
        allocator: ObjectAllocator,
    }

    impl TestHeap {
        fn new() -> TestHeap {
            let raw_heap = RawHeap::new(&[]);
            let allocator = ObjectAllocator::new(raw_heap.space_count());

            TestHeap {
                raw_heap,
                backend: PageBackend::new(DefaultPlatform::new(), None),
                allocator,
            }
        }

        fn array(&mut self, kind: AllocationSpace, ctx: &AllocationContext) -> Address {
            let object = self
                .allocator
                .allocate(
                    &mut self.raw_heap,
                    &mut self.backend,
                    RawHeap::space_id(kind),
                    &FIXED_ARRAY_TYPE,
                    FixedArray::size_for(1),
                    ctx,
                )
                .expect("alloc");
            FixedArray::initialize(object, 1);
            object
        }
    }

    impl Drop for TestHeap {
        fn drop(&mut self) {
            self.allocator.reset_linear_allocation_buffers();
            self.raw_heap.release_all(&mut self.backend);
        }
    }

    fn store(host: Address, value: Address, marker: Option<&Marker>, remset: &OldToNewRememberedSet) {
        let slot = FixedArray::element_slot(host, 0);
        slot.set(value);
        write_barrier(host, slot, value, marker, remset);
    }

    #[test]
    fn old_to_young_stores_are_remembered() {
        let mut heap = TestHeap::new();
        let remset = OldToNewRememberedSet::new();
        let sticky = AllocationContext {
            sticky_bits: StickyBits::Enabled,
            ..AllocationContext::default()
        };

        let host = heap.array(AllocationSpace::Old, &sticky);
        let young = heap.array(AllocationSpace::Old, &sticky);

        // young host
        store(host, young, None, &remset);
        assert!(remset.is_empty());

        host.to_obj().header().mark();
        store(host, young, None, &remset);
        assert!(remset.contains(FixedArray::element_slot(host, 0)));

        remset.clear();
        young.to_obj().header().mark();
        store(host, young, None, &remset);
        assert!(remset.is_empty());
    }

    #[test]
    fn stores_into_only_old_chunks_are_filtered() {
        let mut heap = TestHeap::new();
        let remset = OldToNewRememberedSet::new();
        let ctx = AllocationContext::default();

        let host = heap.array(AllocationSpace::Old, &ctx);
        let value = heap.array(AllocationSpace::Old, &ctx);
        store(host, value, None, &remset);
        assert!(remset.is_empty());

        let young = heap.array(AllocationSpace::New, &ctx);
        assert!(is_young(young));
        store(host, young, None, &remset);
        assert_eq!(remset.len(), 1);
    }

    #[test]
    fn marking_barrier_marks_values() {
        let mut heap = TestHeap::new();
        let remset = OldToNewRememberedSet::new();
        let marking = AllocationContext {
            marking_mode: MarkingMode::MajorMarking,
            ..AllocationContext::default()
        };

        let host = heap.array(AllocationSpace::Old, &marking);
        let value = heap.array(AllocationSpace::Old, &AllocationContext::default());
        assert!(MemoryChunk::from_address(host).is_marking());

        let marker = Marker::new(MarkingConfig {
            collection_type: CollectionType::Major,
            stack_state: StackState::NoHeapPointers,
            marking_type: MarkingType::Incremental,
        });

        assert!(!value.to_obj().header().is_marked());
        store(host, value, Some(&marker), &remset);
        assert!(value.to_obj().header().is_marked());
    }
}
