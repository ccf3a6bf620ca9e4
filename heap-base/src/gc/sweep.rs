use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use parking_lot::{Condvar, Mutex, RwLock};
use threadpool::ThreadPool;

use crate::flags::SweepingType;
use crate::gc::allocator::ObjectAllocator;
use crate::gc::chunk::{AllocationSpace, ChunkFlags, ChunkId, MarkingMode, StickyBits};
use crate::gc::object::WORD_SIZE;
use crate::gc::page_backend::PageBackend;
use crate::gc::space::{release_chunk_memory, walk_objects, ChunkMetadata, RawHeap};
use crate::gc::{fill_region, Address, Region};

/// A chunk handed to the sweeper. Only holds addresses, so it can be swept
/// on any thread.
#[derive(Copy, Clone, Debug)]
pub struct SweepItem {
    pub chunk: ChunkId,
    pub area: Region,
    pub large: bool,
    pub keep_marks: bool,
}

impl SweepItem {
    pub fn new(metadata: &ChunkMetadata, id: ChunkId, keep_marks: bool) -> SweepItem {
        SweepItem {
            chunk: id,
            area: metadata.area(),
            large: metadata.is_large(),
            keep_marks,
        }
    }
}

pub struct SweepResult {
    pub chunk: ChunkId,
    pub live_bytes: usize,
    pub free_regions: Vec<Region>,
    pub object_starts: Option<FixedBitSet>,
}

struct SweeperShared {
    items: RwLock<Vec<SweepItem>>,
    next_item: AtomicUsize,
    results: Mutex<Vec<SweepResult>>,
    in_progress: AtomicBool,
    running_workers: Mutex<usize>,
    worker_joined: Condvar,
}

impl SweeperShared {
    fn next_item(&self) -> usize {
        self.next_item.fetch_add(1, Ordering::Relaxed)
    }

    fn sweep_items(&self) {
        let items = self.items.read();
        let mut results = Vec::new();

        while let Some(&item) = items.get(self.next_item()) {
            results.push(sweep_chunk(item));
        }

        if !results.is_empty() {
            self.results.lock().append(&mut results);
        }
    }

    fn decrement_workers(&self) {
        let mut running = self.running_workers.lock();
        assert!(*running > 0);
        *running -= 1;

        if *running == 0 {
            self.worker_joined.notify_all();
        }
    }

    fn join(&self) {
        let mut running = self.running_workers.lock();

        while *running > 0 {
            self.worker_joined.wait(&mut running);
        }
    }
}

pub struct Sweeper {
    shared: Arc<SweeperShared>,
    threadpool: Option<ThreadPool>,
    workers: usize,
    sweeping_on_mutator: bool,
}

impl Sweeper {
    pub fn new(workers: usize) -> Sweeper {
        Sweeper {
            shared: Arc::new(SweeperShared {
                items: RwLock::new(Vec::new()),
                next_item: AtomicUsize::new(0),
                results: Mutex::new(Vec::new()),
                in_progress: AtomicBool::new(false),
                running_workers: Mutex::new(0),
                worker_joined: Condvar::new(),
            }),
            threadpool: None,
            workers: workers.max(1),
            sweeping_on_mutator: false,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.shared.in_progress.load(Ordering::SeqCst)
    }

    pub fn is_sweeping_on_mutator_thread(&self) -> bool {
        self.sweeping_on_mutator
    }

    /// Starts sweeping `items`. Concurrent sweeping runs on the sweeper's
    /// thread pool, atomic sweeping is done by `finish_if_running`.
    pub fn start(&mut self, items: Vec<SweepItem>, sweeping: SweepingType) {
        debug_assert!(!self.in_progress());

        let workers = match sweeping {
            SweepingType::Atomic => 0,
            SweepingType::Concurrent => self.workers,
        };

        {
            let mut pending = self.shared.items.write();
            *pending = items;
            self.shared.next_item.store(0, Ordering::Relaxed);
            self.shared.in_progress.store(true, Ordering::SeqCst);
            *self.shared.running_workers.lock() = workers;
        }

        if workers == 0 {
            return;
        }

        let count = self.workers;
        let pool = self
            .threadpool
            .get_or_insert_with(|| ThreadPool::with_name("gc-sweeper".into(), count));

        for _ in 0..workers {
            let shared = self.shared.clone();

            pool.execute(move || {
                shared.sweep_items();
                shared.decrement_workers();
            });
        }
    }

    /// Sweeps the remaining chunks on the calling thread, waits for the
    /// workers and returns all results not handed out yet.
    pub fn finish_if_running(&mut self) -> Vec<SweepResult> {
        if !self.in_progress() {
            return Vec::new();
        }

        self.sweeping_on_mutator = true;
        self.shared.sweep_items();
        self.shared.join();
        self.sweeping_on_mutator = false;

        self.shared.items.write().clear();
        self.shared.in_progress.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.shared.results.lock())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shared.join();
    }
}

fn handle_free_region(free_regions: &mut Vec<Region>, start: Address, end: Address) {
    assert!(start <= end);

    if start == end {
        return;
    }

    free_regions.push(Region::new(start, end));
}

/// Finds live objects, clears their marks unless `keep_marks` is set and
/// covers every dead run with a single free space object.
pub fn sweep_chunk(item: SweepItem) -> SweepResult {
    if item.large {
        let object = item.area.start.to_obj();
        let header = object.header();

        let live_bytes = if header.is_marked() {
            if !item.keep_marks {
                header.clear_mark();
            }

            object.size()
        } else {
            0
        };

        return SweepResult {
            chunk: item.chunk,
            live_bytes,
            free_regions: Vec::new(),
            object_starts: None,
        };
    }

    let area = item.area;
    let mut free_start = area.start;
    let mut live_bytes = 0;
    let mut free_regions = Vec::new();
    let mut object_starts = ChunkMetadata::empty_object_starts();

    walk_objects(area, |object, descriptor, size| {
        let header = object.to_obj().header();

        if descriptor.tag.is_filler_or_free_space() || header.is_forwarded() || !header.is_marked()
        {
            return;
        }

        handle_free_region(&mut free_regions, free_start, object);

        if !item.keep_marks {
            header.clear_mark();
        }

        object_starts.insert(object.offset_from(area.start) / WORD_SIZE);
        free_start = object.offset(size);
        live_bytes += size;
    });

    handle_free_region(&mut free_regions, free_start, area.end);

    for region in &free_regions {
        fill_region(region.start, region.end);
    }

    SweepResult {
        chunk: item.chunk,
        live_bytes,
        free_regions,
        object_starts: Some(object_starts),
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub live_bytes: usize,
    pub released_chunks: usize,
    pub released_bytes: usize,
    pub promoted_chunks: usize,
}

/// Applies sweep results on the heap thread: releases empty chunks,
/// rebuilds free lists and promotes surviving young chunks.
pub fn finalize_sweep(
    results: Vec<SweepResult>,
    raw_heap: &mut RawHeap,
    allocator: &mut ObjectAllocator,
    page_backend: &mut PageBackend,
    sticky_bits: StickyBits,
) -> SweepSummary {
    let mut summary = SweepSummary::default();

    for result in results {
        let (chunk, space, area) = {
            let metadata = raw_heap.metadata(result.chunk);
            (metadata.chunk(), metadata.space(), metadata.area())
        };

        chunk.clear_flag_slow(ChunkFlags::PER_CYCLE, page_backend.page_allocator());
        allocator.remove_chunk_from_free_lists(space, area);

        if result.live_bytes == 0 {
            let metadata = raw_heap.remove_chunk(result.chunk);
            summary.released_chunks += 1;
            summary.released_bytes += metadata.size();
            release_chunk_memory(&metadata, page_backend);
            continue;
        }

        summary.live_bytes += result.live_bytes;

        let kind = raw_heap.metadata(result.chunk).kind();

        if kind.is_young() {
            let target = match kind {
                AllocationSpace::NewLarge => AllocationSpace::Large,
                _ => AllocationSpace::Old,
            };

            raw_heap.move_chunk(result.chunk, RawHeap::space_id(target));
            chunk.clear_flag(ChunkFlags::IN_YOUNG_GENERATION);
            chunk.set_old_generation_page_flags(
                MarkingMode::NoMarking,
                target,
                sticky_bits,
                page_backend.page_allocator(),
            );
            summary.promoted_chunks += 1;
        }

        let metadata = raw_heap.metadata_mut(result.chunk);
        metadata.set_live_bytes(result.live_bytes);

        if let Some(object_starts) = result.object_starts {
            metadata.replace_object_starts(object_starts);
        }

        let space = metadata.space();

        for region in result.free_regions {
            allocator.add_free_region(space, region);
        }
    }

    summary
}
