use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use scoped_threadpool::Pool;

use crate::error::{fatal, FatalError, HeapError};
use crate::flags::{HeapFlags, MarkingType, SweepingType};
use crate::gc::allocator::{check_object_size, AllocationContext, ObjectAllocator};
use crate::gc::barrier;
use crate::gc::chunk::{ChunkFlags, MarkingMode, CHUNK_SIZE};
use crate::gc::compact::{forwarded, Compactor};
use crate::gc::marking::{is_live, Marker, MarkingConfig};
use crate::gc::object::TypeDescriptor;
use crate::gc::oom::{OutOfMemoryCallback, OutOfMemoryHandler};
use crate::gc::page_backend::PageBackend;
use crate::gc::platform::Platform;
use crate::gc::prefinalizer::PreFinalizerHandler;
use crate::gc::remembered_set::OldToNewRememberedSet;
use crate::gc::root::{
    CrossThreadPersistent, CrossThreadPersistentRegion, Persistent, PersistentRegion, Slot, Stack,
    StackState, StackSupport,
};
use crate::gc::space::{walk_objects, CustomSpaceConfig, RawHeap, SpaceId};
use crate::gc::stats::{
    collect_heap_statistics, DetailLevel, GcPhase, HeapStatistics, StatsCollector,
};
use crate::gc::sweep::{finalize_sweep, SweepItem, Sweeper};
use crate::gc::{formatted_size, Address, CollectionType, GcReason};
use crate::timer::Timer;

pub use crate::gc::chunk::StickyBits;

/// Minor collections run between two major collections when the heap is
/// generational.
const MINOR_COLLECTIONS_PER_MAJOR: usize = 4;

/// Upper bound of collections during termination.
const MAX_TERMINATION_COLLECTIONS: usize = 20;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapState {
    Idle,
    ScopedSuppressed,
    IncrementalMarking,
    AtomicPause,
}

#[derive(Copy, Clone, Debug)]
pub struct GcConfig {
    pub collection_type: CollectionType,
    pub stack_state: StackState,
    pub reason: GcReason,
}

impl GcConfig {
    pub fn major() -> GcConfig {
        GcConfig {
            collection_type: CollectionType::Major,
            stack_state: StackState::NoHeapPointers,
            reason: GcReason::ForceCollect,
        }
    }

    pub fn minor() -> GcConfig {
        GcConfig {
            collection_type: CollectionType::Minor,
            stack_state: StackState::NoHeapPointers,
            reason: GcReason::ForceMinorCollect,
        }
    }

    pub fn with_stack_state(self, stack_state: StackState) -> GcConfig {
        GcConfig {
            stack_state,
            ..self
        }
    }

    pub fn with_reason(self, reason: GcReason) -> GcConfig {
        GcConfig { reason, ..self }
    }
}

/// Notified for every object compaction moves, during the atomic pause.
/// Listeners may be shared with other threads.
pub trait MoveListener: Send + Sync {
    fn on_move(&self, from: Address, to: Address, size: usize);
}

fn notify_move_listeners(
    listeners: &[Arc<dyn MoveListener>],
    from: Address,
    to: Address,
    size: usize,
) {
    for listener in listeners {
        listener.on_move(from, to, size);
    }
}

fn leave_scope(counter: &AtomicUsize, underflow: FatalError) {
    if counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
            value.checked_sub(1)
        })
        .is_err()
    {
        fatal(underflow);
    }
}

/// Collections requested while a `NoGcScope` is alive are skipped.
pub struct NoGcScope {
    counter: Arc<AtomicUsize>,
}

impl Drop for NoGcScope {
    fn drop(&mut self) {
        leave_scope(&self.counter, FatalError::NoGcScopeUnderflow);
    }
}

/// Collections requested while a `DisallowGcScope` is alive are fatal.
pub struct DisallowGcScope {
    counter: Arc<AtomicUsize>,
}

impl Drop for DisallowGcScope {
    fn drop(&mut self) {
        leave_scope(&self.counter, FatalError::DisallowGcScopeUnderflow);
    }
}

/// Owns every part of a garbage collected heap and drives collections.
/// Bound to the thread that created it.
pub struct HeapBase {
    heap_thread: ThreadId,
    flags: HeapFlags,
    platform: Arc<dyn Platform>,

    raw_heap: RawHeap,
    page_backend: PageBackend,
    oom_handler: OutOfMemoryHandler,
    stats_collector: StatsCollector,
    stack: Stack,
    prefinalizer_handler: PreFinalizerHandler,

    marker: Option<Box<Marker>>,
    compactor: Compactor,
    object_allocator: ObjectAllocator,
    sweeper: Sweeper,
    marking_pool: Option<Pool>,

    strong_persistents: PersistentRegion,
    weak_persistents: PersistentRegion,
    strong_cross_thread_persistents: CrossThreadPersistentRegion,
    weak_cross_thread_persistents: CrossThreadPersistentRegion,
    remembered_set: OldToNewRememberedSet,
    move_listeners: Vec<Arc<dyn MoveListener>>,

    no_gc_scope: Arc<AtomicUsize>,
    disallow_gc_scope: Arc<AtomicUsize>,

    stack_support: StackSupport,
    marking_support: MarkingType,
    sweeping_support: SweepingType,
    sticky_bits: StickyBits,

    marking_mode: MarkingMode,
    in_atomic_pause: bool,
    stack_state_of_prev_gc: StackState,
    minor_collections_since_major: usize,
    terminated: bool,
}

impl HeapBase {
    pub fn new(flags: HeapFlags, platform: Arc<dyn Platform>) -> Result<HeapBase, HeapError> {
        HeapBase::with_custom_spaces(flags, platform, &[])
    }

    pub fn with_custom_spaces(
        flags: HeapFlags,
        platform: Arc<dyn Platform>,
        custom_spaces: &[CustomSpaceConfig],
    ) -> Result<HeapBase, HeapError> {
        if let Some(max_heap_size) = flags.max_heap_size() {
            if max_heap_size < CHUNK_SIZE {
                return Err(HeapError::InvalidConfiguration(format!(
                    "max heap size {} is smaller than a chunk",
                    formatted_size(max_heap_size)
                )));
            }
        }

        if flags.gc_trigger_size() == 0 {
            return Err(HeapError::InvalidConfiguration(
                "gc trigger size must not be zero".into(),
            ));
        }

        let workers = flags.gc_workers(platform.worker_threads());
        let marking_pool = if workers > 1 {
            Some(Pool::new(workers as u32))
        } else {
            None
        };

        let raw_heap = RawHeap::new(custom_spaces);
        let object_allocator = ObjectAllocator::new(raw_heap.space_count());
        let page_backend = PageBackend::new(platform.clone(), flags.max_heap_size());

        let stack_support = if flags.conservative_stack {
            StackSupport::SupportsConservativeStackScan
        } else {
            StackSupport::NoConservativeStackScan
        };

        let sticky_bits = if flags.generational {
            StickyBits::Enabled
        } else {
            StickyBits::Disabled
        };

        log::debug!(
            "GC: heap with {} marking, {} sweeping, {} workers, generational={}, compaction={}",
            flags.marking,
            flags.sweeping,
            workers,
            flags.generational,
            flags.compaction
        );

        Ok(HeapBase {
            heap_thread: thread::current().id(),
            platform,

            raw_heap,
            page_backend,
            oom_handler: OutOfMemoryHandler::new(),
            stats_collector: StatsCollector::new(&flags),
            stack: Stack::new(),
            prefinalizer_handler: PreFinalizerHandler::new(),

            marker: None,
            compactor: Compactor::new(flags.compaction),
            object_allocator,
            sweeper: Sweeper::new(workers),
            marking_pool,

            strong_persistents: PersistentRegion::new(),
            weak_persistents: PersistentRegion::new(),
            strong_cross_thread_persistents: CrossThreadPersistentRegion::new(),
            weak_cross_thread_persistents: CrossThreadPersistentRegion::new(),
            remembered_set: OldToNewRememberedSet::new(),
            move_listeners: Vec::new(),

            no_gc_scope: Arc::new(AtomicUsize::new(0)),
            disallow_gc_scope: Arc::new(AtomicUsize::new(0)),

            stack_support,
            marking_support: flags.marking,
            sweeping_support: flags.sweeping,
            sticky_bits,

            marking_mode: MarkingMode::NoMarking,
            in_atomic_pause: false,
            stack_state_of_prev_gc: StackState::NoHeapPointers,
            minor_collections_since_major: 0,
            terminated: false,

            flags,
        })
    }

    pub fn flags(&self) -> &HeapFlags {
        &self.flags
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn raw_heap(&self) -> &RawHeap {
        &self.raw_heap
    }

    pub fn page_backend(&self) -> &PageBackend {
        &self.page_backend
    }

    pub fn object_allocator(&mut self) -> &mut ObjectAllocator {
        &mut self.object_allocator
    }

    pub fn sweeper(&mut self) -> &mut Sweeper {
        &mut self.sweeper
    }

    pub fn compactor(&mut self) -> &mut Compactor {
        &mut self.compactor
    }

    pub fn stats_collector(&self) -> &StatsCollector {
        &self.stats_collector
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn prefinalizer_handler(&self) -> &PreFinalizerHandler {
        &self.prefinalizer_handler
    }

    pub fn remembered_set(&self) -> &OldToNewRememberedSet {
        &self.remembered_set
    }

    pub fn marker(&self) -> Option<&Marker> {
        self.marker.as_deref()
    }

    pub fn get_marker_ref_for_testing(&mut self) -> &mut Option<Box<Marker>> {
        &mut self.marker
    }

    pub fn stack_support(&self) -> StackSupport {
        self.stack_support
    }

    pub fn marking_support(&self) -> MarkingType {
        self.marking_support
    }

    pub fn sweeping_support(&self) -> SweepingType {
        self.sweeping_support
    }

    pub fn sticky_bits(&self) -> StickyBits {
        self.sticky_bits
    }

    pub fn marking_mode(&self) -> MarkingMode {
        self.marking_mode
    }

    pub fn stack_state_of_prev_gc(&self) -> StackState {
        self.stack_state_of_prev_gc
    }

    pub fn custom_space(&self, index: usize) -> Option<SpaceId> {
        self.raw_heap.custom_space_id(index)
    }

    /// Committed memory of all chunks.
    pub fn memory_size(&self) -> usize {
        self.page_backend.committed_bytes()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn current_thread_is_heap_thread(&self) -> bool {
        thread::current().id() == self.heap_thread
    }

    fn check_heap_thread(&self) {
        if !self.current_thread_is_heap_thread() {
            fatal(FatalError::NotOnHeapThread);
        }
    }

    pub fn enter_no_gc_scope(&self) -> NoGcScope {
        self.no_gc_scope.fetch_add(1, Ordering::SeqCst);

        NoGcScope {
            counter: self.no_gc_scope.clone(),
        }
    }

    pub fn enter_disallow_gc_scope(&self) -> DisallowGcScope {
        self.disallow_gc_scope.fetch_add(1, Ordering::SeqCst);

        DisallowGcScope {
            counter: self.disallow_gc_scope.clone(),
        }
    }

    /// Leaves a scope entered without a guard. Leaving more scopes than
    /// were entered is fatal.
    pub(crate) fn leave_no_gc_scope(&self) {
        leave_scope(&self.no_gc_scope, FatalError::NoGcScopeUnderflow);
    }

    pub(crate) fn leave_disallow_gc_scope(&self) {
        leave_scope(
            &self.disallow_gc_scope,
            FatalError::DisallowGcScopeUnderflow,
        );
    }

    pub fn in_no_gc_scope(&self) -> bool {
        self.no_gc_scope.load(Ordering::SeqCst) > 0
    }

    pub fn is_gc_forbidden(&self) -> bool {
        self.disallow_gc_scope.load(Ordering::SeqCst) > 0
    }

    pub fn is_gc_allowed(&self) -> bool {
        !self.is_gc_forbidden() && !self.sweeper.is_sweeping_on_mutator_thread()
    }

    pub fn in_atomic_pause(&self) -> bool {
        self.in_atomic_pause
    }

    pub fn set_in_atomic_pause_for_testing(&mut self, value: bool) {
        self.in_atomic_pause = value;
    }

    pub fn state(&self) -> HeapState {
        if self.in_atomic_pause {
            HeapState::AtomicPause
        } else if self.marker.is_some() {
            HeapState::IncrementalMarking
        } else if self.in_no_gc_scope() || self.is_gc_forbidden() {
            HeapState::ScopedSuppressed
        } else {
            HeapState::Idle
        }
    }

    pub fn register_move_listener(&mut self, listener: Arc<dyn MoveListener>) {
        self.move_listeners.push(listener);
    }

    pub fn unregister_move_listener(&mut self, listener: &Arc<dyn MoveListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.move_listeners
            .retain(|registered| Arc::as_ptr(registered) as *const () != target);
    }

    pub fn call_move_listeners(&self, from: Address, to: Address, size: usize) {
        notify_move_listeners(&self.move_listeners, from, to, size);
    }

    pub fn persistent(&self, value: Address) -> Persistent {
        self.strong_persistents.allocate(value)
    }

    pub fn weak_persistent(&self, value: Address) -> Persistent {
        self.weak_persistents.allocate(value)
    }

    pub fn cross_thread_persistent(&self, value: Address) -> CrossThreadPersistent {
        self.strong_cross_thread_persistents.allocate(value)
    }

    pub fn weak_cross_thread_persistent(&self, value: Address) -> CrossThreadPersistent {
        self.weak_cross_thread_persistents.allocate(value)
    }

    /// Registers `callback` to run once `object` is found dead, before its
    /// memory is reclaimed. Callbacks must not access the heap.
    pub fn register_prefinalizer<F>(&mut self, object: Address, callback: F)
    where
        F: FnMut(Address) + 'static,
    {
        self.prefinalizer_handler.register(object, Box::new(callback));
    }

    pub fn set_oom_callback(&mut self, callback: OutOfMemoryCallback) {
        self.oom_handler.set_callback(callback);
    }

    pub fn collect_statistics(&self, level: DetailLevel) -> HeapStatistics {
        collect_heap_statistics(
            level,
            !self.sweeper.in_progress(),
            &self.raw_heap,
            &self.object_allocator,
            &self.page_backend,
        )
    }

    /// Write barrier for a store the caller already performed.
    #[inline(always)]
    pub fn write_barrier(&self, host: Address, slot: Slot, value: Address) {
        barrier::write_barrier(
            host,
            slot,
            value,
            self.marker.as_deref(),
            &self.remembered_set,
        );
    }

    /// Stores `value` at `offset` of `host` and runs the write barrier.
    pub fn store(&self, host: Address, offset: usize, value: Address) {
        let slot = host.to_obj().slot(offset);
        slot.set(value);
        self.write_barrier(host, slot, value);
    }

    fn default_stack_state(&self) -> StackState {
        match self.stack_support {
            StackSupport::SupportsConservativeStackScan => StackState::MayContainHeapPointers,
            StackSupport::NoConservativeStackScan => StackState::NoHeapPointers,
        }
    }

    fn allocation_context(&self) -> AllocationContext {
        AllocationContext {
            marking_mode: self.marking_mode,
            sticky_bits: self.sticky_bits,
            black_allocation: self.marker.is_some(),
        }
    }

    fn can_collect_on_allocation(&self) -> bool {
        self.is_gc_allowed() && !self.in_no_gc_scope() && !self.in_atomic_pause
    }

    /// Allocates an object of `size` bytes in `space`. Returns the error of
    /// the final attempt when the allocation fails even after finishing
    /// sweeping and a full collection.
    pub fn try_allocate(
        &mut self,
        space: SpaceId,
        descriptor: &'static TypeDescriptor,
        size: usize,
    ) -> Result<Address, HeapError> {
        self.check_heap_thread();
        check_object_size(size)?;
        self.collect_before_allocation();

        let ctx = self.allocation_context();
        let err = match self.object_allocator.allocate(
            &mut self.raw_heap,
            &mut self.page_backend,
            space,
            descriptor,
            size,
            &ctx,
        ) {
            Ok(object) => return Ok(object),
            Err(err) => err,
        };

        if !self.can_collect_on_allocation() {
            return Err(err);
        }

        log::debug!("GC: allocation of {} failed: {}", formatted_size(size), err);

        if self.sweeper.in_progress() {
            self.finish_sweeping();
            let ctx = self.allocation_context();

            if let Ok(object) = self.object_allocator.allocate(
                &mut self.raw_heap,
                &mut self.page_backend,
                space,
                descriptor,
                size,
                &ctx,
            ) {
                return Ok(object);
            }
        }

        let config = GcConfig::major()
            .with_reason(GcReason::AllocationFailure)
            .with_stack_state(self.default_stack_state());
        self.collect_garbage(config);

        let ctx = self.allocation_context();
        self.object_allocator.allocate(
            &mut self.raw_heap,
            &mut self.page_backend,
            space,
            descriptor,
            size,
            &ctx,
        )
    }

    /// Hands `err` to the embedder's callback and aborts.
    pub(crate) fn out_of_memory(&self, err: &HeapError) -> ! {
        self.oom_handler.handle(err)
    }

    /// Like `try_allocate`, but running out of memory is fatal.
    pub fn allocate_in_space(
        &mut self,
        space: SpaceId,
        descriptor: &'static TypeDescriptor,
        size: usize,
    ) -> Address {
        match self.try_allocate(space, descriptor, size) {
            Ok(object) => object,
            Err(err) => self.out_of_memory(&err),
        }
    }

    fn collect_before_allocation(&mut self) {
        if !self.can_collect_on_allocation() {
            return;
        }

        if self.flags.gc_stress && self.marker.is_none() {
            let config = GcConfig::major()
                .with_reason(GcReason::Stress)
                .with_stack_state(self.default_stack_state());
            self.collect_garbage(config);
            return;
        }

        if let Some(marker) = self.marker.as_deref_mut() {
            let done = marker.advance_marking(self.flags.incremental_step_size());

            if done {
                let stack_state = self.default_stack_state();
                self.finalize_garbage_collection(stack_state);
            }

            return;
        }

        if self.object_allocator.allocated_bytes() < self.flags.gc_trigger_size() {
            return;
        }

        let collection_type = if self.sticky_bits == StickyBits::Enabled
            && self.minor_collections_since_major < MINOR_COLLECTIONS_PER_MAJOR
        {
            CollectionType::Minor
        } else {
            CollectionType::Major
        };

        let config = GcConfig {
            collection_type,
            stack_state: self.default_stack_state(),
            reason: GcReason::AllocationTrigger,
        };

        match self.marking_support {
            MarkingType::Incremental => {
                self.start_incremental_garbage_collection(config);
            }

            MarkingType::Atomic => {
                self.collect_garbage(config);
            }
        }
    }

    fn resolve_collection_type(&self, collection_type: CollectionType) -> CollectionType {
        if collection_type == CollectionType::Minor && self.sticky_bits == StickyBits::Disabled {
            CollectionType::Major
        } else {
            collection_type
        }
    }

    /// Runs a full collection cycle, or finishes the running incremental
    /// one. Returns false when the collection was skipped because of a
    /// `NoGcScope`.
    pub fn collect_garbage(&mut self, config: GcConfig) -> bool {
        self.check_heap_thread();

        if self.is_gc_forbidden() {
            fatal(FatalError::CollectionWhileForbidden);
        }

        if self.sweeper.is_sweeping_on_mutator_thread() {
            fatal(FatalError::CollectionWhileSweeping);
        }

        if self.in_no_gc_scope() {
            log::debug!("GC: {} collection skipped in no-gc scope", config.reason);
            return false;
        }

        if self.marker.is_some() {
            self.finalize_garbage_collection(config.stack_state);
            return true;
        }

        let config = GcConfig {
            collection_type: self.resolve_collection_type(config.collection_type),
            ..config
        };

        self.finish_sweeping();
        self.start_garbage_collection(config, MarkingType::Atomic);
        self.finalize_garbage_collection(config.stack_state);
        true
    }

    /// Starts an incremental marking cycle. The cycle is finished by
    /// allocation, `collect_garbage` or
    /// `finalize_incremental_garbage_collection_for_testing`.
    pub fn start_incremental_garbage_collection(&mut self, config: GcConfig) -> bool {
        self.check_heap_thread();

        if self.marking_support != MarkingType::Incremental {
            fatal(FatalError::IncrementalMarkingUnsupported);
        }

        if self.is_gc_forbidden() {
            fatal(FatalError::CollectionWhileForbidden);
        }

        if self.marker.is_some() {
            fatal(FatalError::MarkerAlreadyActive);
        }

        if self.in_no_gc_scope() {
            return false;
        }

        let config = GcConfig {
            collection_type: self.resolve_collection_type(config.collection_type),
            ..config
        };

        self.finish_sweeping();
        self.start_garbage_collection(config, MarkingType::Incremental);
        true
    }

    /// Marks at least `budget` bytes. Returns true when marking has no
    /// work left.
    pub fn perform_incremental_marking_step(&mut self, budget: usize) -> bool {
        self.check_heap_thread();

        match self.marker.as_deref_mut() {
            Some(marker) => marker.advance_marking(budget),
            None => fatal(FatalError::NoActiveMarker),
        }
    }

    pub fn finalize_incremental_garbage_collection_for_testing(&mut self, stack_state: StackState) {
        self.check_heap_thread();

        if self.is_gc_forbidden() {
            fatal(FatalError::CollectionWhileForbidden);
        }

        if self.marker.is_none() {
            fatal(FatalError::NoActiveMarker);
        }

        self.finalize_garbage_collection(stack_state);
    }

    fn start_garbage_collection(&mut self, config: GcConfig, marking_type: MarkingType) {
        let _disallow = self.enter_disallow_gc_scope();
        let collection_type = config.collection_type;

        self.stats_collector.notify_collection_started(
            collection_type,
            config.reason,
            self.page_backend.committed_bytes(),
        );

        self.object_allocator.reset_linear_allocation_buffers();

        if collection_type == CollectionType::Major {
            if self.sticky_bits == StickyBits::Enabled {
                self.unmark_all();
            }

            if self.compactor.is_enabled() {
                self.compactor
                    .select_evacuation_candidates(&self.raw_heap, &mut self.object_allocator);
            }
        }

        self.marking_mode = match collection_type {
            CollectionType::Major => MarkingMode::MajorMarking,
            CollectionType::Minor => MarkingMode::MinorMarking,
        };
        self.set_marking_mode_flags(self.marking_mode);

        let mut marker = Box::new(Marker::new(MarkingConfig {
            collection_type,
            stack_state: config.stack_state,
            marking_type,
        }));
        marker.start_marking();
        self.mark_roots(&mut marker);
        self.marker = Some(marker);
    }

    /// Sticky mark bits survive collections, a major collection starts
    /// from a clean slate.
    fn unmark_all(&mut self) {
        for id in self.raw_heap.chunk_ids() {
            let metadata = self.raw_heap.metadata(id);

            if metadata.chunk().is_read_only() {
                continue;
            }

            walk_objects(metadata.area(), |object, descriptor, _| {
                let header = object.to_obj().header();

                if !descriptor.tag.is_filler_or_free_space() && !header.is_forwarded() {
                    header.clear_mark();
                }
            });
        }
    }

    fn set_marking_mode_flags(&self, marking_mode: MarkingMode) {
        let page_allocator = self.page_backend.page_allocator();

        for id in self.raw_heap.chunk_ids() {
            let metadata = self.raw_heap.metadata(id);
            let chunk = metadata.chunk();
            let kind = metadata.kind();

            if kind.is_young() {
                chunk.set_young_generation_page_flags(marking_mode, page_allocator);
            } else {
                chunk.set_old_generation_page_flags(
                    marking_mode,
                    kind,
                    self.sticky_bits,
                    page_allocator,
                );
            }
        }
    }

    fn mark_roots(&self, marker: &mut Marker) {
        self.strong_persistents
            .iterate(|value| marker.mark_root(*value));
        self.strong_cross_thread_persistents
            .iterate(|value| marker.mark_root(*value));

        if marker.config().is_minor() {
            for slot in self.remembered_set.slots() {
                marker.mark_remembered_slot(slot);
            }
        }
    }

    /// Treats every registered stack word that points into an object as a
    /// root. Such objects must not move, their chunks are pinned.
    fn mark_conservative_stack(&mut self, marker: &mut Marker, stack_state: StackState) {
        if self.stack_support != StackSupport::SupportsConservativeStackScan
            || stack_state == StackState::NoHeapPointers
        {
            return;
        }

        let page_allocator = self.page_backend.page_allocator();

        for word in self.stack.words() {
            let addr = Address::from(word);

            let id = match self.raw_heap.chunk_for_address(addr) {
                Some(id) => id,
                None => continue,
            };

            let metadata = self.raw_heap.metadata(id);

            let object = match metadata.find_object_start(addr) {
                Some(object) => object,
                None => continue,
            };

            let chunk = metadata.chunk();

            if chunk.is_evacuation_candidate() {
                self.compactor.cancel_for_pinned(chunk);
            } else if !chunk.is_pinned() {
                chunk.set_flag_slow(ChunkFlags::PINNED, page_allocator);
            }

            marker.mark_root(object);
        }
    }

    fn finalize_garbage_collection(&mut self, stack_state: StackState) {
        let _disallow = self.enter_disallow_gc_scope();

        let mut marker = match self.marker.take() {
            Some(marker) => marker,
            None => fatal(FatalError::NoActiveMarker),
        };

        let config = *marker.config();
        let collection_type = config.collection_type;
        let phase_timing = self.stats_collector.phase_timing();

        self.in_atomic_pause = true;
        self.stack_state_of_prev_gc = stack_state;
        marker.enter_atomic_pause(stack_state);
        self.object_allocator.reset_linear_allocation_buffers();

        let (duration, ()) = Timer::ms(phase_timing, || {
            self.mark_roots(&mut marker);
            self.mark_conservative_stack(&mut marker, stack_state);
            marker.finish_marking(self.marking_pool.as_mut());
        });
        self.stats_collector
            .record_phase(GcPhase::Marking, duration);
        self.stats_collector
            .notify_marking_completed(marker.marked_bytes());

        if self.flags.gc_verify && collection_type == CollectionType::Major {
            marker.verify(&self.raw_heap);
        }

        let (duration, ()) = Timer::ms(phase_timing, || {
            let cleared = marker.process_weakness();
            let mut cleared_persistents = 0;

            let mut clear_dead = |value: &mut Address| {
                if !marker.is_live(*value) {
                    *value = Address::null();
                    cleared_persistents += 1;
                }
            };

            self.weak_persistents.iterate(&mut clear_dead);
            self.weak_cross_thread_persistents.iterate(&mut clear_dead);

            let finalized = self
                .prefinalizer_handler
                .invoke_dead(|object| is_live(&config, object));

            log::debug!(
                "GC: cleared {} weak slots and {} weak persistents, ran {} pre-finalizers",
                cleared,
                cleared_persistents,
                finalized
            );
        });
        self.stats_collector
            .record_phase(GcPhase::Weakness, duration);

        let recorded_slots = marker.take_recorded_slots();

        if collection_type == CollectionType::Major && !self.compactor.candidates().is_empty() {
            let (duration, ()) = Timer::ms(phase_timing, || self.compact(&recorded_slots));
            self.stats_collector
                .record_phase(GcPhase::Compaction, duration);
        }

        self.remembered_set.clear();
        self.marking_mode = MarkingMode::NoMarking;
        self.set_marking_mode_flags(MarkingMode::NoMarking);

        self.start_sweeping(collection_type);

        match collection_type {
            CollectionType::Major => self.minor_collections_since_major = 0,
            CollectionType::Minor => self.minor_collections_since_major += 1,
        }

        self.in_atomic_pause = false;
        drop(marker);

        if self.sweeping_support == SweepingType::Atomic {
            let (duration, ()) = Timer::ms(phase_timing, || self.finish_sweeping());
            self.stats_collector
                .record_phase(GcPhase::Sweeping, duration);
        }

        self.stats_collector
            .notify_collection_finished(self.page_backend.committed_bytes());
        self.object_allocator.reset_allocated_bytes();
    }

    /// Evacuates the selected candidates and redirects every reference to
    /// a moved object.
    fn compact(&mut self, recorded_slots: &[Slot]) {
        let ctx = AllocationContext {
            marking_mode: self.marking_mode,
            sticky_bits: self.sticky_bits,
            black_allocation: false,
        };

        let listeners = &self.move_listeners;
        let result = self.compactor.compact(
            &mut self.raw_heap,
            &mut self.page_backend,
            &mut self.object_allocator,
            &ctx,
            |from, to, size| notify_move_listeners(listeners, from, to, size),
        );

        self.compactor
            .update_references(&self.raw_heap, recorded_slots);

        let mut forward = |value: &mut Address| *value = forwarded(*value);
        self.strong_persistents.iterate(&mut forward);
        self.weak_persistents.iterate(&mut forward);
        self.strong_cross_thread_persistents.iterate(&mut forward);
        self.weak_cross_thread_persistents.iterate(&mut forward);
        self.prefinalizer_handler.update_references(forwarded);

        let released = self
            .compactor
            .release_evacuated_chunks(&mut self.raw_heap, &mut self.page_backend);

        log::debug!(
            "GC: moved {} objects ({}), released {} chunks, {} chunks aborted",
            result.moved_objects,
            formatted_size(result.moved_bytes),
            released,
            result.aborted_chunks
        );
    }

    /// Hands every chunk the collection may have freed memory on to the
    /// sweeper. Minor collections leave chunks holding only old objects
    /// alone.
    fn start_sweeping(&mut self, collection_type: CollectionType) {
        let keep_marks = self.sticky_bits == StickyBits::Enabled;
        let page_allocator = self.page_backend.page_allocator();
        let mut items = Vec::new();

        for id in self.raw_heap.chunk_ids() {
            let metadata = self.raw_heap.metadata(id);
            let chunk = metadata.chunk();

            if chunk.is_read_only() {
                continue;
            }

            if collection_type == CollectionType::Minor
                && chunk.contains_only_old()
                && !chunk.in_young_generation()
            {
                chunk.clear_flag_slow(ChunkFlags::PER_CYCLE, page_allocator);
                continue;
            }

            self.object_allocator
                .remove_chunk_from_free_lists(metadata.space(), metadata.area());
            items.push(SweepItem::new(metadata, id, keep_marks));
        }

        self.sweeper.start(items, self.sweeping_support);
    }

    /// Waits for concurrent sweepers and applies their results.
    pub fn finish_sweeping(&mut self) {
        if !self.sweeper.in_progress() {
            return;
        }

        let results = self.sweeper.finish_if_running();
        let summary = finalize_sweep(
            results,
            &mut self.raw_heap,
            &mut self.object_allocator,
            &mut self.page_backend,
            self.sticky_bits,
        );

        if self.flags.gc_dev_verbose {
            log::debug!(
                "GC: sweeping done, {} live, {} chunks released ({}), {} chunks promoted",
                formatted_size(summary.live_bytes),
                summary.released_chunks,
                formatted_size(summary.released_bytes),
                summary.promoted_chunks
            );
        }
    }

    /// Drops all persistent roots and collects until a collection frees
    /// nothing more. No collection runs afterwards.
    pub fn terminate(&mut self) {
        self.check_heap_thread();

        if self.terminated {
            return;
        }

        if self.marker.is_some() {
            let stack_state = self.default_stack_state();
            self.finalize_garbage_collection(stack_state);
        }

        self.strong_persistents.clear_all_used_nodes();
        self.weak_persistents.clear_all_used_nodes();
        self.strong_cross_thread_persistents.clear_all_used_nodes();
        self.weak_cross_thread_persistents.clear_all_used_nodes();
        self.stack.clear();

        let config = GcConfig::major().with_reason(GcReason::Terminate);
        let mut previous_memory = usize::MAX;

        for _ in 0..MAX_TERMINATION_COLLECTIONS {
            self.collect_garbage(config);
            self.finish_sweeping();

            let memory = self.page_backend.committed_bytes();

            if memory == 0 || memory >= previous_memory {
                break;
            }

            previous_memory = memory;
        }

        if self.flags.gc_stats {
            self.stats_collector.log_summary();
        }

        self.disallow_gc_scope.fetch_add(1, Ordering::SeqCst);
        self.terminated = true;
    }
}

impl Drop for HeapBase {
    fn drop(&mut self) {
        self.sweeper.finish_if_running();
        self.marker = None;
        self.object_allocator.reset_linear_allocation_buffers();
        self.raw_heap.release_all(&mut self.page_backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::chunk::{AllocationSpace, MemoryChunk};
    use crate::gc::object::{FixedArray, WORD_SIZE};
    use crate::gc::platform::DefaultPlatform;
    use crate::MemSize;
    use parking_lot::Mutex;
    use rand::Rng;
    use std::cell::{Cell, RefCell};
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn test_flags() -> HeapFlags {
        HeapFlags {
            gc_workers: 1,
            gc_verify: true,
            ..HeapFlags::default()
        }
    }

    fn heap(flags: HeapFlags) -> HeapBase {
        init_logging();
        HeapBase::new(flags, DefaultPlatform::new()).expect("heap")
    }

    fn track_finalization(heap: &mut HeapBase, object: Address) -> Rc<Cell<bool>> {
        let finalized = Rc::new(Cell::new(false));
        let inner = finalized.clone();
        heap.register_prefinalizer(object, move |_| inner.set(true));
        finalized
    }

    #[test]
    fn scope_guards_balance_in_random_order() {
        let heap = heap(test_flags());
        let mut rng = rand::thread_rng();
        let mut no_gc = Vec::new();
        let mut disallow = Vec::new();

        for _ in 0..200 {
            match rng.gen_range(0..4) {
                0 => no_gc.push(heap.enter_no_gc_scope()),
                1 => disallow.push(heap.enter_disallow_gc_scope()),
                2 => drop(no_gc.pop()),
                _ => drop(disallow.pop()),
            }

            assert_eq!(heap.in_no_gc_scope(), !no_gc.is_empty());
            assert_eq!(heap.is_gc_forbidden(), !disallow.is_empty());
        }

        no_gc.clear();
        disallow.clear();

        assert!(!heap.in_no_gc_scope());
        assert!(!heap.is_gc_forbidden());
        assert_eq!(heap.state(), HeapState::Idle);
    }

    #[test]
    #[should_panic(expected = "leaving no-gc scope with counter already zero")]
    fn leaving_no_gc_scope_too_often_is_fatal() {
        let heap = heap(test_flags());
        drop(heap.enter_no_gc_scope());
        drop(heap.enter_no_gc_scope());
        assert!(!heap.in_no_gc_scope());
        heap.leave_no_gc_scope();
    }

    #[test]
    #[should_panic(expected = "leaving disallow-gc scope with counter already zero")]
    fn leaving_disallow_scope_too_often_is_fatal() {
        let heap = heap(test_flags());
        let first = heap.enter_disallow_gc_scope();
        let second = heap.enter_disallow_gc_scope();
        drop(first);
        drop(second);
        assert!(!heap.is_gc_forbidden());
        heap.leave_disallow_gc_scope();
    }

    #[test]
    fn collection_in_no_gc_scope_is_skipped() {
        let mut heap = heap(test_flags());
        let garbage = heap.allocate_fixed_array(4);
        let finalized = track_finalization(&mut heap, garbage);

        let scope = heap.enter_no_gc_scope();
        assert_eq!(heap.state(), HeapState::ScopedSuppressed);
        assert!(!heap.collect_garbage(GcConfig::major()));
        assert!(!finalized.get());

        drop(scope);
        assert!(heap.collect_garbage(GcConfig::major()));
        assert!(finalized.get());
    }

    #[test]
    #[should_panic(expected = "collection started while garbage collection is forbidden")]
    fn collection_while_forbidden_is_fatal() {
        let mut heap = heap(test_flags());
        let _scope = heap.enter_disallow_gc_scope();
        heap.collect_garbage(GcConfig::major());
    }

    #[test]
    fn unreachable_objects_are_reclaimed() {
        let mut heap = heap(test_flags());

        let live = heap.allocate_fixed_array(2);
        let child = heap.allocate_fixed_array(1);
        heap.store(live, FixedArray::HEADER_SIZE, child);
        let root = heap.persistent(live);

        let dead = heap.allocate_fixed_array(2);
        let weak = heap.weak_persistent(dead);

        let live_finalized = track_finalization(&mut heap, live);
        let child_finalized = track_finalization(&mut heap, child);
        let dead_finalized = track_finalization(&mut heap, dead);

        assert!(heap.collect_garbage(GcConfig::major()));

        assert!(!live_finalized.get());
        assert!(!child_finalized.get());
        assert!(dead_finalized.get());
        assert!(weak.is_null());
        assert_eq!(root.get(), live);
        assert_eq!(FixedArray::get(live, 0), child);
        assert_eq!(heap.stats_collector().major_collections, 1);
    }

    #[test]
    fn releasing_all_roots_frees_all_chunks() {
        let mut heap = heap(test_flags());
        let object = heap.allocate_fixed_array(16);
        let root = heap.persistent(object);

        for _ in 0..2000 {
            heap.allocate_fixed_array(64);
        }

        assert!(heap.memory_size() > 0);
        drop(root);

        heap.collect_garbage(GcConfig::major());
        assert_eq!(heap.raw_heap().chunk_count(), 0);
    }

    #[test]
    fn cross_thread_persistents_are_roots() {
        let mut heap = heap(test_flags());

        let strong_object = heap.allocate_fixed_array(1);
        let weak_object = heap.allocate_fixed_array(1);
        let strong = heap.cross_thread_persistent(Address::null());
        let weak = heap.weak_cross_thread_persistent(weak_object);

        thread::scope(|scope| {
            scope.spawn(|| strong.set(strong_object));
        });

        let finalized = track_finalization(&mut heap, strong_object);
        heap.collect_garbage(GcConfig::major());

        assert!(!finalized.get());
        assert_eq!(strong.get(), strong_object);
        assert!(weak.get().is_null());
    }

    #[test]
    fn custom_spaces_allocate_on_their_own_chunks() {
        init_logging();
        let custom = [CustomSpaceConfig {
            name: "custom",
            compactable: true,
        }];
        let mut heap =
            HeapBase::with_custom_spaces(test_flags(), DefaultPlatform::new(), &custom)
                .expect("heap");

        let space = heap.custom_space(0).expect("custom space");
        assert!(heap.custom_space(1).is_none());

        let object = heap.allocate_in_space(
            space,
            &crate::gc::object::FIXED_ARRAY_TYPE,
            FixedArray::size_for(1),
        );
        FixedArray::initialize(object, 1);
        let _root = heap.persistent(object);

        let chunk = MemoryChunk::from_address(object);
        assert_eq!(heap.raw_heap().metadata(chunk.metadata_id()).space(), space);

        heap.collect_garbage(GcConfig::major());
        assert_eq!(FixedArray::length(object), 1);
    }

    #[test]
    fn heap_state_follows_collection_phases() {
        let mut heap = heap(HeapFlags {
            marking: MarkingType::Incremental,
            ..test_flags()
        });

        assert_eq!(heap.state(), HeapState::Idle);

        assert!(heap.start_incremental_garbage_collection(GcConfig::major()));
        assert_eq!(heap.state(), HeapState::IncrementalMarking);
        assert_eq!(heap.marking_mode(), MarkingMode::MajorMarking);
        assert!(heap
            .get_marker_ref_for_testing()
            .as_ref()
            .map_or(false, |marker| marker.is_started()));

        heap.set_in_atomic_pause_for_testing(true);
        assert_eq!(heap.state(), HeapState::AtomicPause);
        heap.set_in_atomic_pause_for_testing(false);

        heap.finalize_incremental_garbage_collection_for_testing(StackState::NoHeapPointers);
        assert_eq!(heap.state(), HeapState::Idle);
        assert!(heap.marker().is_none());
        assert_eq!(heap.marking_mode(), MarkingMode::NoMarking);
    }

    #[test]
    #[should_panic(expected = "a marker is already active")]
    fn second_incremental_cycle_is_fatal() {
        let mut heap = heap(HeapFlags {
            marking: MarkingType::Incremental,
            ..test_flags()
        });

        heap.start_incremental_garbage_collection(GcConfig::major());
        heap.start_incremental_garbage_collection(GcConfig::major());
    }

    #[test]
    fn barrier_keeps_objects_stored_during_incremental_marking() {
        let mut heap = heap(HeapFlags {
            marking: MarkingType::Incremental,
            ..test_flags()
        });

        let holder = heap.allocate_fixed_array(1);
        let _root = heap.persistent(holder);
        let hidden = heap.allocate_fixed_array(1);
        let hidden_finalized = track_finalization(&mut heap, hidden);

        heap.start_incremental_garbage_collection(GcConfig::major());
        while !heap.perform_incremental_marking_step(64) {}

        assert!(holder.to_obj().header().is_marked());
        assert!(!hidden.to_obj().header().is_marked());

        heap.store(holder, FixedArray::HEADER_SIZE, hidden);
        assert!(hidden.to_obj().header().is_marked());

        let scope = heap.enter_no_gc_scope();
        let fresh = heap.allocate_fixed_array(1);
        assert!(fresh.to_obj().header().is_marked());
        drop(scope);

        heap.finalize_incremental_garbage_collection_for_testing(StackState::NoHeapPointers);

        assert!(!hidden_finalized.get());
        assert_eq!(FixedArray::get(holder, 0), hidden);
    }

    #[test]
    fn incremental_marking_is_finished_by_allocation() {
        let mut heap = heap(HeapFlags {
            marking: MarkingType::Incremental,
            gc_trigger_size: Some(MemSize(64 * 1024)),
            incremental_step_size: Some(MemSize(4 * 1024)),
            ..test_flags()
        });

        let object = heap.allocate_fixed_array(8);
        let _root = heap.persistent(object);

        for _ in 0..20_000 {
            heap.allocate_fixed_array(8);
        }

        assert!(heap.stats_collector().major_collections > 0);
    }

    #[test]
    fn minor_collection_is_major_without_sticky_bits() {
        let mut heap = heap(test_flags());
        heap.collect_garbage(GcConfig::minor());

        assert_eq!(heap.stats_collector().major_collections, 1);
        assert_eq!(heap.stats_collector().minor_collections, 0);
    }

    #[test]
    fn minor_collection_keeps_remembered_objects() {
        let mut heap = heap(HeapFlags {
            generational: true,
            ..test_flags()
        });
        assert_eq!(heap.sticky_bits(), StickyBits::Enabled);

        let holder = heap.allocate_fixed_array(1);
        let _root = heap.persistent(holder);
        heap.collect_garbage(GcConfig::major());
        assert!(!barrier::is_young(holder));

        let young = heap.allocate_fixed_array(1);
        let garbage = heap.allocate_fixed_array(1);
        assert!(barrier::is_young(young));

        heap.store(holder, FixedArray::HEADER_SIZE, young);
        assert_eq!(heap.remembered_set().len(), 1);

        let young_finalized = track_finalization(&mut heap, young);
        let garbage_finalized = track_finalization(&mut heap, garbage);

        heap.collect_garbage(GcConfig::minor());

        assert_eq!(heap.stats_collector().minor_collections, 1);
        assert!(!young_finalized.get());
        assert!(garbage_finalized.get());
        assert!(heap.remembered_set().is_empty());
        assert!(!barrier::is_young(young));
        assert!(holder.to_obj().header().is_marked());
    }

    #[test]
    fn young_space_survivors_are_promoted() {
        let mut heap = heap(HeapFlags {
            generational: true,
            ..test_flags()
        });

        let new_space = RawHeap::space_id(AllocationSpace::New);
        let size = FixedArray::size_for(2);
        let object = heap.allocate_in_space(new_space, &crate::gc::object::FIXED_ARRAY_TYPE, size);
        FixedArray::initialize(object, 2);
        let _root = heap.persistent(object);

        assert!(MemoryChunk::from_address(object).in_young_generation());
        heap.collect_garbage(GcConfig::minor());

        let chunk = MemoryChunk::from_address(object);
        assert!(!chunk.in_young_generation());
        assert_eq!(chunk.space(), AllocationSpace::Old);
        assert!(!barrier::is_young(object));
    }

    struct RecordingListener {
        moves: Mutex<Vec<(Address, Address)>>,
        published: AtomicUsize,
    }

    impl MoveListener for RecordingListener {
        fn on_move(&self, from: Address, to: Address, _size: usize) {
            self.moves.lock().push((from, to));
            self.published.store(to.to_usize(), Ordering::Release);
        }
    }

    fn make_chunk_sparse(heap: &mut HeapBase) -> (Address, Persistent) {
        let keep = heap.allocate_fixed_array(1);
        let root = heap.persistent(keep);

        for _ in 0..200 {
            heap.allocate_fixed_array(8);
        }

        heap.collect_garbage(GcConfig::major());
        (keep, root)
    }

    #[test]
    fn compaction_moves_objects_and_notifies_listeners() {
        let mut heap = heap(HeapFlags {
            compaction: true,
            ..test_flags()
        });

        let listener = Arc::new(RecordingListener {
            moves: Mutex::new(Vec::new()),
            published: AtomicUsize::new(0),
        });
        heap.register_move_listener(listener.clone());

        let (keep, root) = make_chunk_sparse(&mut heap);
        let finalized = track_finalization(&mut heap, keep);

        let reader = listener.clone();
        let observed = thread::scope(|scope| {
            let handle = scope.spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(10);

                loop {
                    let published = reader.published.load(Ordering::Acquire);

                    if published != 0 {
                        let moves = reader.moves.lock();
                        return moves.iter().any(|&(_, to)| to.to_usize() == published);
                    }

                    if Instant::now() > deadline {
                        return false;
                    }

                    thread::yield_now();
                }
            });

            heap.collect_garbage(GcConfig::major());
            handle.join().expect("reader thread")
        });

        assert!(observed);

        let moved = root.get();
        assert_ne!(moved, keep);
        assert_eq!(*listener.moves.lock(), vec![(keep, moved)]);
        assert_eq!(FixedArray::length(moved), 1);
        assert!(!finalized.get());

        heap.collect_garbage(GcConfig::major());
        assert!(!finalized.get());
    }

    #[test]
    fn unregistered_listeners_are_not_called() {
        let mut heap = heap(HeapFlags {
            compaction: true,
            ..test_flags()
        });

        let recording = Arc::new(RecordingListener {
            moves: Mutex::new(Vec::new()),
            published: AtomicUsize::new(0),
        });
        let listener: Arc<dyn MoveListener> = recording.clone();
        heap.register_move_listener(listener.clone());

        heap.call_move_listeners(Address::from(64), Address::from(128), 16);
        assert_eq!(
            *recording.moves.lock(),
            vec![(Address::from(64), Address::from(128))]
        );
        recording.moves.lock().clear();

        heap.unregister_move_listener(&listener);
        heap.call_move_listeners(Address::from(64), Address::from(128), 16);
        assert!(recording.moves.lock().is_empty());

        let (keep, root) = make_chunk_sparse(&mut heap);
        heap.collect_garbage(GcConfig::major());

        assert_ne!(root.get(), keep);
        assert!(recording.moves.lock().is_empty());
    }

    #[test]
    fn conservative_stack_pins_objects() {
        let mut heap = heap(HeapFlags {
            compaction: true,
            conservative_stack: true,
            ..test_flags()
        });

        let keep = heap.allocate_fixed_array(2);
        let finalized = track_finalization(&mut heap, keep);
        let _scope = heap.stack().scope();
        heap.stack().push(keep.offset(FixedArray::HEADER_SIZE + WORD_SIZE).to_usize());

        for _ in 0..200 {
            heap.allocate_fixed_array(8);
        }

        let config = GcConfig::major().with_stack_state(StackState::MayContainHeapPointers);
        heap.collect_garbage(config);
        assert!(!finalized.get());
        assert_eq!(heap.stack_state_of_prev_gc(), StackState::MayContainHeapPointers);

        heap.collect_garbage(config);
        assert!(!finalized.get());
        assert!(!keep.to_obj().header().is_forwarded());
        assert_eq!(FixedArray::length(keep), 2);
        assert!(!MemoryChunk::from_address(keep).is_evacuation_candidate());
    }

    #[test]
    fn concurrent_sweeping_is_finished_on_demand() {
        let mut heap = heap(HeapFlags {
            sweeping: SweepingType::Concurrent,
            gc_workers: 2,
            ..test_flags()
        });

        let keep = heap.allocate_fixed_array(4);
        let _root = heap.persistent(keep);

        for _ in 0..5000 {
            heap.allocate_fixed_array(16);
        }

        heap.collect_garbage(GcConfig::major());
        assert!(heap.sweeper().in_progress());

        let brief = heap.collect_statistics(DetailLevel::Detailed);
        assert_eq!(brief.detail_level, DetailLevel::Brief);

        heap.finish_sweeping();
        assert!(!heap.sweeper().in_progress());

        let detailed = heap.collect_statistics(DetailLevel::Detailed);
        assert_eq!(detailed.detail_level, DetailLevel::Detailed);
        assert_eq!(FixedArray::length(keep), 4);

        let next = heap.allocate_fixed_array(4);
        assert!(next.is_non_null());
    }

    #[test]
    fn terminate_finalizes_everything() {
        let mut heap = heap(test_flags());

        let object = heap.allocate_fixed_array(1);
        let root = heap.persistent(object);
        let finalized = track_finalization(&mut heap, object);

        heap.terminate();

        assert!(finalized.get());
        assert!(root.is_null());
        assert!(heap.is_terminated());
        assert!(heap.is_gc_forbidden());
        assert_eq!(heap.raw_heap().chunk_count(), 0);
    }

    #[test]
    fn prefinalizers_run_in_reverse_registration_order() {
        let mut heap = heap(test_flags());
        let order = Rc::new(RefCell::new(Vec::new()));

        for index in 0..3 {
            let object = heap.allocate_fixed_array(1);
            let order = order.clone();
            heap.register_prefinalizer(object, move |_| order.borrow_mut().push(index));
        }

        heap.collect_garbage(GcConfig::major());
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn allocation_trigger_starts_collections() {
        let mut heap = heap(HeapFlags {
            gc_trigger_size: Some(MemSize(64 * 1024)),
            ..test_flags()
        });

        for _ in 0..10_000 {
            heap.allocate_fixed_array(8);
        }

        assert!(heap.stats_collector().major_collections > 0);
        assert!(heap.object_allocator().allocated_bytes() < 64 * 1024 + FixedArray::size_for(8));
    }

    #[test]
    fn heap_limit_is_reported() {
        let mut heap = heap(HeapFlags {
            max_heap_size: Some(MemSize(CHUNK_SIZE)),
            ..test_flags()
        });

        let space = RawHeap::space_id(AllocationSpace::Old);
        let result = heap.try_allocate(
            space,
            &crate::gc::object::FIXED_ARRAY_TYPE,
            FixedArray::size_for(CHUNK_SIZE / WORD_SIZE),
        );

        assert!(matches!(result, Err(HeapError::HeapLimitExceeded { .. })));
        assert_eq!(heap.stats_collector().major_collections, 1);
    }

    #[test]
    fn oversized_allocation_returns_error() {
        let mut heap = heap(test_flags());
        let space = RawHeap::space_id(AllocationSpace::Old);
        let size = usize::MAX & !(WORD_SIZE - 1);

        let result = heap.try_allocate(space, &crate::gc::object::FIXED_ARRAY_TYPE, size);

        assert!(matches!(
            result,
            Err(HeapError::OutOfMemory { requested, .. }) if requested == size
        ));
        assert_eq!(heap.stats_collector().major_collections, 0);
        assert_eq!(heap.object_allocator().allocated_bytes(), 0);
    }

    #[test]
    fn allocation_failure_runs_oom_callback() {
        let mut heap = heap(HeapFlags {
            max_heap_size: Some(MemSize(CHUNK_SIZE)),
            ..test_flags()
        });

        let called = Arc::new(AtomicBool::new(false));
        let inner = called.clone();
        heap.set_oom_callback(Box::new(move |_: &HeapError| {
            inner.store(true, Ordering::SeqCst)
        }));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            heap.allocate_fixed_array(CHUNK_SIZE / WORD_SIZE)
        }));

        assert!(result.is_err());
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        init_logging();
        let result = HeapBase::new(
            HeapFlags {
                max_heap_size: Some(MemSize(4096)),
                ..test_flags()
            },
            DefaultPlatform::new(),
        );

        assert!(matches!(result, Err(HeapError::InvalidConfiguration(_))));
    }

    #[test]
    fn heap_thread_is_the_creating_thread() {
        let heap = heap(test_flags());
        assert!(heap.current_thread_is_heap_thread());
    }
}
