use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use crate::flags::HeapFlags;
use crate::gc::allocator::ObjectAllocator;
use crate::gc::object::TypeDescriptor;
use crate::gc::page_backend::PageBackend;
use crate::gc::root::Slot;
use crate::gc::space::{walk_objects, RawHeap};
use crate::gc::visitor::{HeapVisitor, ObjectVisitor};
use crate::gc::{formatted_size, Address, CollectionType, GcReason, Region};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DetailLevel {
    Brief,
    Detailed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectTypeStatistics {
    pub count: usize,
    pub bytes: usize,
    pub references: usize,
}

#[derive(Clone, Debug)]
pub struct SpaceStatistics {
    pub name: &'static str,
    pub chunk_count: usize,
    pub committed_size_bytes: usize,
    pub used_size_bytes: usize,
    pub free_list_bytes: usize,
    pub object_statistics: BTreeMap<&'static str, ObjectTypeStatistics>,
}

#[derive(Clone, Debug)]
pub struct HeapStatistics {
    pub detail_level: DetailLevel,
    pub committed_size_bytes: usize,
    pub resident_size_bytes: usize,
    pub used_size_bytes: usize,
    pub pooled_memory_size_bytes: usize,
    /// Empty for brief statistics.
    pub space_statistics: Vec<SpaceStatistics>,
}

/// Counts objects, bytes and outgoing references per type.
#[derive(Default)]
struct ObjectStatsVisitor {
    types: BTreeMap<&'static str, ObjectTypeStatistics>,
    current: Option<&'static str>,
}

impl ObjectStatsVisitor {
    fn record(&mut self, descriptor: &'static TypeDescriptor, object: Address, size: usize) {
        self.visit_with_known_size(descriptor, object, size);

        if let Some(entry) = self.types.get_mut(descriptor.name) {
            entry.bytes += size;
        }

        self.current = None;
    }
}

impl ObjectVisitor for ObjectStatsVisitor {
    fn visit_pointer(&mut self, _host: Address, slot: Slot) {
        if slot.get().is_null() {
            return;
        }

        if let Some(name) = self.current {
            if let Some(entry) = self.types.get_mut(name) {
                entry.references += 1;
            }
        }
    }

    fn visit_map_pointer(&mut self, _host: Address, descriptor: &'static TypeDescriptor) {
        self.types.entry(descriptor.name).or_default().count += 1;
        self.current = Some(descriptor.name);
    }
}

impl HeapVisitor for ObjectStatsVisitor {
    const USE_PRECOMPUTED_OBJECT_SIZE: bool = true;
    const CAN_ENCOUNTER_FILLER_OR_FREE_SPACE: bool = false;
}

/// Snapshot of heap memory. Detailed statistics walk every object, the
/// caller passes `iterable = false` while sweeping is in progress and gets
/// brief statistics instead.
pub fn collect_heap_statistics(
    detail_level: DetailLevel,
    iterable: bool,
    raw_heap: &RawHeap,
    allocator: &ObjectAllocator,
    page_backend: &PageBackend,
) -> HeapStatistics {
    let detail_level = if detail_level == DetailLevel::Detailed && !iterable {
        log::warn!("GC: heap is not iterable, collecting brief statistics");
        DetailLevel::Brief
    } else {
        detail_level
    };

    let mut space_statistics = Vec::new();
    let mut used_size_bytes = 0;

    for space in raw_heap.spaces() {
        let mut committed = 0;
        let mut used = 0;
        let mut visitor = ObjectStatsVisitor::default();
        let lab = allocator.linear_allocation_buffer(space.id());

        for &id in space.chunks() {
            let metadata = raw_heap.metadata(id);
            committed += metadata.size();

            if detail_level == DetailLevel::Detailed {
                for region in iterable_regions(metadata.area(), lab) {
                    walk_objects(region, |object, descriptor, size| {
                        if !descriptor.tag.is_filler_or_free_space()
                            && !object.to_obj().header().is_forwarded()
                        {
                            visitor.record(descriptor, object, size);
                            used += size;
                        }
                    });
                }
            } else {
                used += metadata.area().size();
            }
        }

        let free_list_bytes = allocator.free_list(space.id()).free_bytes();

        if detail_level == DetailLevel::Brief {
            used = used.saturating_sub(free_list_bytes + lab.size());
        }

        used_size_bytes += used;

        if detail_level == DetailLevel::Detailed {
            space_statistics.push(SpaceStatistics {
                name: space.name(),
                chunk_count: space.chunks().len(),
                committed_size_bytes: committed,
                used_size_bytes: used,
                free_list_bytes,
                object_statistics: visitor.types,
            });
        }
    }

    HeapStatistics {
        detail_level,
        committed_size_bytes: page_backend.committed_bytes(),
        resident_size_bytes: page_backend.committed_bytes(),
        used_size_bytes,
        pooled_memory_size_bytes: page_backend.pooled_bytes(),
        space_statistics,
    }
}

/// The unused part of an allocation buffer holds no valid objects and is
/// skipped without retiring the buffer.
fn iterable_regions(area: Region, lab: Region) -> Vec<Region> {
    if lab.empty() || !area.fully_contains(&lab) {
        return vec![area];
    }

    vec![
        Region::new(area.start, lab.start),
        Region::new(lab.end, area.end),
    ]
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcPhase {
    Marking,
    Weakness,
    Compaction,
    Sweeping,
}

#[derive(Clone, Debug, Default)]
pub struct CollectorPhases {
    pub marking: f32,
    pub weakness: f32,
    pub compaction: f32,
    pub sweeping: f32,
    pub total: f32,
}

struct CurrentCycle {
    collection_type: CollectionType,
    reason: GcReason,
    start: Instant,
    start_memory_size: usize,
    phases: CollectorPhases,
}

/// Collection counters, pause times and verbose output.
pub struct StatsCollector {
    gc_verbose: bool,
    gc_dev_verbose: bool,
    gc_stats: bool,

    current: Option<CurrentCycle>,

    pub major_collections: usize,
    pub minor_collections: usize,
    pub total_major_pause: f32,
    pub total_minor_pause: f32,
    pub last_marked_bytes: usize,
    pub last_freed_bytes: usize,

    major_phases: Vec<CollectorPhases>,
    minor_phases: Vec<CollectorPhases>,
}

impl StatsCollector {
    pub fn new(flags: &HeapFlags) -> StatsCollector {
        StatsCollector {
            gc_verbose: flags.gc_verbose,
            gc_dev_verbose: flags.gc_dev_verbose,
            gc_stats: flags.gc_stats,

            current: None,

            major_collections: 0,
            minor_collections: 0,
            total_major_pause: 0f32,
            total_minor_pause: 0f32,
            last_marked_bytes: 0,
            last_freed_bytes: 0,

            major_phases: Vec::new(),
            minor_phases: Vec::new(),
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.current.is_some()
    }

    pub fn phase_timing(&self) -> bool {
        self.gc_stats || self.gc_dev_verbose
    }

    pub fn notify_collection_started(
        &mut self,
        collection_type: CollectionType,
        reason: GcReason,
        memory_size: usize,
    ) {
        debug_assert!(self.current.is_none());

        self.current = Some(CurrentCycle {
            collection_type,
            reason,
            start: Instant::now(),
            start_memory_size: memory_size,
            phases: CollectorPhases::default(),
        });

        if self.gc_dev_verbose {
            log::debug!("GC: {} ({}) started", collection_type, reason);
        }
    }

    pub fn record_phase(&mut self, phase: GcPhase, duration: f32) {
        let current = match self.current.as_mut() {
            Some(current) => current,
            None => return,
        };

        match phase {
            GcPhase::Marking => current.phases.marking += duration,
            GcPhase::Weakness => current.phases.weakness += duration,
            GcPhase::Compaction => current.phases.compaction += duration,
            GcPhase::Sweeping => current.phases.sweeping += duration,
        }

        if self.gc_dev_verbose {
            log::debug!("GC: phase {:?} took {:.2} ms", phase, duration);
        }
    }

    pub fn notify_marking_completed(&mut self, marked_bytes: usize) {
        self.last_marked_bytes = marked_bytes;
    }

    pub fn notify_collection_finished(&mut self, memory_size: usize) {
        let current = match self.current.take() {
            Some(current) => current,
            None => return,
        };

        let duration = current.start.elapsed().as_secs_f32() * 1000.0f32;
        let mut phases = current.phases;
        phases.total = duration;

        self.last_freed_bytes = current.start_memory_size.saturating_sub(memory_size);

        match current.collection_type {
            CollectionType::Major => {
                self.major_collections += 1;
                self.total_major_pause += duration;

                if self.gc_stats {
                    self.major_phases.push(phases);
                }
            }

            CollectionType::Minor => {
                self.minor_collections += 1;
                self.total_minor_pause += duration;

                if self.gc_stats {
                    self.minor_phases.push(phases);
                }
            }
        }

        if self.gc_verbose {
            log::info!(
                "GC: {} ({}) {} -> {}; {:.2} ms; {} marked",
                current.collection_type,
                current.reason,
                formatted_size(current.start_memory_size),
                formatted_size(memory_size),
                duration,
                formatted_size(self.last_marked_bytes),
            );
        }
    }

    pub fn collections(&self) -> usize {
        self.major_collections + self.minor_collections
    }

    pub fn major_marking(&self) -> Numbers {
        let values: Vec<_> = self.major_phases.iter().map(|x| x.marking).collect();
        calculate_numbers(&values)
    }

    pub fn major_sweeping(&self) -> Numbers {
        let values: Vec<_> = self.major_phases.iter().map(|x| x.sweeping).collect();
        calculate_numbers(&values)
    }

    pub fn major_compaction(&self) -> Numbers {
        let values: Vec<_> = self.major_phases.iter().map(|x| x.compaction).collect();
        calculate_numbers(&values)
    }

    pub fn major_total(&self) -> Numbers {
        let values: Vec<_> = self.major_phases.iter().map(|x| x.total).collect();
        calculate_numbers(&values)
    }

    pub fn minor_marking(&self) -> Numbers {
        let values: Vec<_> = self.minor_phases.iter().map(|x| x.marking).collect();
        calculate_numbers(&values)
    }

    pub fn minor_total(&self) -> Numbers {
        let values: Vec<_> = self.minor_phases.iter().map(|x| x.total).collect();
        calculate_numbers(&values)
    }

    pub fn pauses(&self) -> AllNumbers {
        AllNumbers(
            self.major_phases
                .iter()
                .chain(self.minor_phases.iter())
                .map(|x| x.total)
                .collect(),
        )
    }

    /// Logs per-phase numbers, only collected with `gc_stats`.
    pub fn log_summary(&self) {
        if !self.gc_stats {
            return;
        }

        log::info!(
            "GC stats: {} major, {} minor collections",
            self.major_collections,
            self.minor_collections
        );
        log::info!("\tmajor marking:    {}", self.major_marking());
        log::info!("\tmajor compaction: {}", self.major_compaction());
        log::info!("\tmajor sweeping:   {}", self.major_sweeping());
        log::info!("\tmajor total:      {}", self.major_total());
        log::info!("\tminor marking:    {}", self.minor_marking());
        log::info!("\tminor total:      {}", self.minor_total());
        log::info!("\tpauses: {}", self.pauses());
    }
}

pub struct Numbers {
    pub avg: f32,
    pub sum: f32,
    pub min: f32,
    pub max: f32,
}

impl Numbers {
    fn zero() -> Numbers {
        Numbers {
            avg: 0f32,
            sum: 0f32,
            min: 0f32,
            max: 0f32,
        }
    }
}

impl fmt::Display for Numbers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "avg={:<8.1} sum={:<8.1} min={:<8.1} max={:<8.1}",
            self.avg, self.sum, self.min, self.max
        )
    }
}

fn calculate_numbers(data: &[f32]) -> Numbers {
    if data.is_empty() {
        return Numbers::zero();
    }

    let mut sum = 0f32;
    let mut xmin = data[0];
    let mut xmax = data[0];

    for el in data {
        sum += *el;
        xmin = f32::min(xmin, *el);
        xmax = f32::max(xmax, *el);
    }

    let avg = sum / (data.len() as f32);

    Numbers {
        avg,
        sum,
        min: xmin,
        max: xmax,
    }
}

pub struct AllNumbers(Vec<f32>);

impl fmt::Display for AllNumbers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for num in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{:.1}", num)?;
            first = false;
        }
        write!(f, "]")
    }
}
