use parking_lot::Mutex;
use scoped_threadpool::Pool;

use crate::error::{fatal, FatalError};
use crate::flags::MarkingType;
use crate::gc::chunk::MemoryChunk;
use crate::gc::object::{ConsString, ThinString, TypeTag};
use crate::gc::pmarking;
use crate::gc::root::{Slot, StackState};
use crate::gc::space::{walk_objects, RawHeap};
use crate::gc::visitor::{HeapVisitor, ObjectVisitor};
use crate::gc::worklist::MarkingWorklist;
use crate::gc::{Address, CollectionType};

#[derive(Copy, Clone, Debug)]
pub struct MarkingConfig {
    pub collection_type: CollectionType,
    pub stack_state: StackState,
    pub marking_type: MarkingType,
}

impl MarkingConfig {
    pub fn is_minor(&self) -> bool {
        self.collection_type == CollectionType::Minor
    }
}

/// Objects a collection of this type traces. Minor collections skip
/// everything on chunks that only hold old objects.
#[inline(always)]
pub fn is_traced(config: &MarkingConfig, object: Address) -> bool {
    if object.is_null() {
        return false;
    }

    let chunk = MemoryChunk::from_address(object);

    if chunk.is_read_only() {
        return false;
    }

    !(config.is_minor() && chunk.contains_only_old() && !chunk.in_young_generation())
}

/// Liveness after marking. Objects a collection does not trace stay alive.
pub fn is_live(config: &MarkingConfig, object: Address) -> bool {
    if !is_traced(config, object) {
        return true;
    }

    object.to_obj().header().is_marked()
}

/// Receives the results of visiting an object.
pub trait MarkingSink {
    fn config(&self) -> &MarkingConfig;

    fn push(&mut self, object: Address);

    fn record_weak_slot(&mut self, slot: Slot);

    /// Slot pointing into an evacuation candidate.
    fn record_slot(&mut self, slot: Slot);
}

pub struct MarkingVisitor<'a, S: MarkingSink> {
    sink: &'a mut S,
}

impl<'a, S: MarkingSink> MarkingVisitor<'a, S> {
    pub fn new(sink: &'a mut S) -> MarkingVisitor<'a, S> {
        MarkingVisitor { sink }
    }

    fn mark(&mut self, object: Address) {
        if is_traced(self.sink.config(), object) && object.to_obj().header().try_mark() {
            self.sink.push(object);
        }
    }

    fn record_slot_if_needed(&mut self, host: Address, slot: Slot, value: Address) {
        let target = MemoryChunk::from_address(value);

        if target.is_evacuation_candidate()
            && !MemoryChunk::from_address(host).should_skip_evacuation_slot_recording()
        {
            self.sink.record_slot(slot);
        }
    }
}

/// Replaces thin strings by their actual string and flat cons strings by
/// their first part.
fn shortcut(slot: Slot, value: Address) -> Address {
    let replacement = match value.to_obj().descriptor().tag {
        TypeTag::ThinString => ThinString::actual(value),
        TypeTag::ConsString if ConsString::is_flat(value) => ConsString::first(value),
        _ => return value,
    };

    if replacement.is_null() {
        return value;
    }

    slot.set(replacement);
    replacement
}

impl<'a, S: MarkingSink> ObjectVisitor for MarkingVisitor<'a, S> {
    fn visit_pointer(&mut self, host: Address, slot: Slot) {
        let value = slot.get();

        if value.is_null() {
            return;
        }

        let value = shortcut(slot, value);
        self.record_slot_if_needed(host, slot, value);
        self.mark(value);
    }

    fn visit_weak_pointer(&mut self, host: Address, slot: Slot) {
        let value = slot.get();

        if !is_traced(self.sink.config(), value) {
            return;
        }

        self.sink.record_weak_slot(slot);
        self.record_slot_if_needed(host, slot, value);
    }
}

impl<'a, S: MarkingSink> HeapVisitor for MarkingVisitor<'a, S> {
    const CAN_ENCOUNTER_FILLER_OR_FREE_SPACE: bool = false;
    const SHOULD_VISIT_MAP_POINTER: bool = false;
}

/// The single active marker of a heap. Owns the worklists of one marking
/// cycle.
pub struct Marker {
    config: MarkingConfig,
    worklist: MarkingWorklist,
    barrier_worklist: Mutex<Vec<Address>>,
    weak_slots: Vec<Slot>,
    recorded_slots: Mutex<Vec<Slot>>,
    marked_bytes: usize,
    started: bool,
    in_atomic_pause: bool,
}

impl MarkingSink for Marker {
    fn config(&self) -> &MarkingConfig {
        &self.config
    }

    fn push(&mut self, object: Address) {
        self.worklist.push(object);
    }

    fn record_weak_slot(&mut self, slot: Slot) {
        self.weak_slots.push(slot);
    }

    fn record_slot(&mut self, slot: Slot) {
        self.recorded_slots.get_mut().push(slot);
    }
}

impl Marker {
    pub fn new(config: MarkingConfig) -> Marker {
        Marker {
            config,
            worklist: MarkingWorklist::new(),
            barrier_worklist: Mutex::new(Vec::new()),
            weak_slots: Vec::new(),
            recorded_slots: Mutex::new(Vec::new()),
            marked_bytes: 0,
            started: false,
            in_atomic_pause: false,
        }
    }

    pub fn config(&self) -> &MarkingConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn in_atomic_pause(&self) -> bool {
        self.in_atomic_pause
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    pub fn start_marking(&mut self) {
        debug_assert!(!self.started);
        self.started = true;

        log::debug!(
            "GC: start {} {} marking",
            self.config.marking_type,
            self.config.collection_type
        );
    }

    pub fn mark_root(&mut self, object: Address) {
        if is_traced(&self.config, object) && object.to_obj().header().try_mark() {
            self.worklist.push(object);
        }
    }

    /// Remembered slots are strong roots of minor collections, whether the
    /// slot is weak or not.
    pub fn mark_remembered_slot(&mut self, slot: Slot) {
        let value = slot.get();
        self.mark_root(value);
    }

    /// Marking part of the write barrier, called by the mutator between
    /// marking steps.
    pub fn mark_from_barrier(&self, value: Address) {
        if is_traced(&self.config, value) && value.to_obj().header().try_mark() {
            self.barrier_worklist.lock().push(value);
        }
    }

    pub fn record_slot_from_barrier(&self, slot: Slot) {
        self.recorded_slots.lock().push(slot);
    }

    fn drain_barrier_worklist(&mut self) {
        let objects = std::mem::take(self.barrier_worklist.get_mut());

        for object in objects {
            self.worklist.push(object);
        }
    }

    fn process_object(&mut self, object: Address) -> usize {
        let size = MarkingVisitor::new(self).visit(object);
        self.marked_bytes += size;
        size
    }

    /// Traces at least `budget` bytes unless the worklist runs empty first.
    /// Returns true when no work is left.
    pub fn advance_marking(&mut self, budget: usize) -> bool {
        self.drain_barrier_worklist();
        let mut traced = 0;

        while traced < budget {
            match self.worklist.pop() {
                Some(object) => traced += self.process_object(object),
                None => break,
            }
        }

        self.worklist.is_empty() && self.barrier_worklist.get_mut().is_empty()
    }

    pub fn enter_atomic_pause(&mut self, stack_state: StackState) {
        self.in_atomic_pause = true;
        self.config.stack_state = stack_state;
        self.config.marking_type = MarkingType::Atomic;
    }

    /// Drains all remaining work. With more than one worker the rest of the
    /// graph is traced in parallel on `pool`.
    pub fn finish_marking(&mut self, pool: Option<&mut Pool>) {
        debug_assert!(self.in_atomic_pause);
        self.drain_barrier_worklist();

        match pool {
            Some(pool) if pool.thread_count() > 1 && !self.worklist.is_empty() => {
                let initial = self.worklist.drain();
                let result = pmarking::mark_parallel(pool, &self.config, initial);

                self.marked_bytes += result.marked_bytes;
                self.weak_slots.extend(result.weak_slots);
                self.recorded_slots.get_mut().extend(result.recorded_slots);
            }

            _ => {
                while let Some(object) = self.worklist.pop() {
                    self.process_object(object);
                }
            }
        }

        debug_assert!(self.worklist.is_empty());
    }

    pub fn is_live(&self, object: Address) -> bool {
        is_live(&self.config, object)
    }

    /// Clears weak slots whose target died. Returns the number of cleared
    /// slots.
    pub fn process_weakness(&mut self) -> usize {
        let mut cleared = 0;

        for slot in std::mem::take(&mut self.weak_slots) {
            let value = slot.get();

            if value.is_non_null() && !is_live(&self.config, value) {
                slot.set(Address::null());
                cleared += 1;
            }
        }

        cleared
    }

    pub fn take_recorded_slots(&mut self) -> Vec<Slot> {
        std::mem::take(self.recorded_slots.get_mut())
    }

    /// Checks that marked objects only reference live objects.
    pub fn verify(&self, raw_heap: &RawHeap) {
        let mut visitor = VerifyingVisitor {
            config: &self.config,
        };

        for id in raw_heap.chunk_ids() {
            let metadata = raw_heap.metadata(id);

            if metadata.chunk().is_read_only() {
                continue;
            }

            walk_objects(metadata.area(), |object, descriptor, size| {
                if object.to_obj().header().is_marked() {
                    visitor.visit_with_known_size(descriptor, object, size);
                }
            });
        }
    }
}

struct VerifyingVisitor<'a> {
    config: &'a MarkingConfig,
}

impl<'a> ObjectVisitor for VerifyingVisitor<'a> {
    fn visit_pointer(&mut self, host: Address, slot: Slot) {
        let target = slot.get();

        if target.is_non_null() && !is_live(self.config, target) {
            fatal(FatalError::MarkingVerificationFailed { host, target });
        }
    }

    fn visit_weak_pointer(&mut self, _host: Address, _slot: Slot) {}
}

impl<'a> HeapVisitor for VerifyingVisitor<'a> {
    const USE_PRECOMPUTED_OBJECT_SIZE: bool = true;
    const SHOULD_VISIT_MAP_POINTER: bool = false;
}
