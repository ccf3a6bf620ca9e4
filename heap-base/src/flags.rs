use std::fmt;
use std::ops::Deref;

use clap::Args;

use crate::gc::M;

pub const DEFAULT_GC_TRIGGER_SIZE: usize = 64 * M;
pub const DEFAULT_INCREMENTAL_STEP_SIZE: usize = 256 * 1024;
const MAX_DEFAULT_GC_WORKERS: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemSize(pub usize);

impl Deref for MemSize {
    type Target = usize;

    fn deref(&self) -> &usize {
        &self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkingType {
    Atomic,
    Incremental,
}

impl fmt::Display for MarkingType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            MarkingType::Atomic => "atomic",
            MarkingType::Incremental => "incremental",
        };

        f.write_str(text)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SweepingType {
    Atomic,
    Concurrent,
}

impl fmt::Display for SweepingType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            SweepingType::Atomic => "atomic",
            SweepingType::Concurrent => "concurrent",
        };

        f.write_str(text)
    }
}

/// Heap configuration, flattened into the embedder's command line.
#[derive(Args, Clone, Debug)]
pub struct HeapFlags {
    /// Marking support (atomic, incremental)
    #[arg(long = "gc-marking", value_parser = parse_marking_type, default_value = "atomic")]
    pub marking: MarkingType,

    /// Sweeping support (atomic, concurrent)
    #[arg(long = "gc-sweeping", value_parser = parse_sweeping_type, default_value = "atomic")]
    pub sweeping: SweepingType,

    /// Enable young generation collections with sticky mark bits
    #[arg(long)]
    pub generational: bool,

    /// Enable compaction of sparse chunks in major collections
    #[arg(long)]
    pub compaction: bool,

    /// Scan registered stack words conservatively
    #[arg(long)]
    pub conservative_stack: bool,

    /// Collect garbage at every allocation
    #[arg(long)]
    pub gc_stress: bool,

    /// Print GC statistics
    #[arg(long)]
    pub gc_stats: bool,

    /// Verbose GC
    #[arg(long)]
    pub gc_verbose: bool,

    /// Verbose GC phases
    #[arg(long)]
    pub gc_dev_verbose: bool,

    /// Verify marking before sweeping
    #[arg(long)]
    pub gc_verify: bool,

    /// Number of GC worker threads
    #[arg(long, default_value_t = 0)]
    pub gc_workers: usize,

    /// Set maximum heap size
    #[arg(long, value_parser = parse_mem_size)]
    pub max_heap_size: Option<MemSize>,

    /// Allocation volume that triggers the next collection
    #[arg(long, value_parser = parse_mem_size)]
    pub gc_trigger_size: Option<MemSize>,

    /// Bytes marked per incremental marking step
    #[arg(long, value_parser = parse_mem_size)]
    pub incremental_step_size: Option<MemSize>,
}

impl Default for HeapFlags {
    fn default() -> HeapFlags {
        HeapFlags {
            marking: MarkingType::Atomic,
            sweeping: SweepingType::Atomic,
            generational: false,
            compaction: false,
            conservative_stack: false,
            gc_stress: false,
            gc_stats: false,
            gc_verbose: false,
            gc_dev_verbose: false,
            gc_verify: false,
            gc_workers: 0,
            max_heap_size: None,
            gc_trigger_size: None,
            incremental_step_size: None,
        }
    }
}

impl HeapFlags {
    /// Worker count, `available` is what the platform offers when the flag
    /// is unset.
    pub fn gc_workers(&self, available: usize) -> usize {
        if self.gc_workers != 0 {
            self.gc_workers
        } else {
            available.clamp(1, MAX_DEFAULT_GC_WORKERS)
        }
    }

    pub fn max_heap_size(&self) -> Option<usize> {
        self.max_heap_size.map(|size| *size)
    }

    pub fn gc_trigger_size(&self) -> usize {
        self.gc_trigger_size
            .map(|size| *size)
            .unwrap_or(DEFAULT_GC_TRIGGER_SIZE)
    }

    pub fn incremental_step_size(&self) -> usize {
        self.incremental_step_size
            .map(|size| *size)
            .unwrap_or(DEFAULT_INCREMENTAL_STEP_SIZE)
    }
}

pub fn parse_marking_type(value: &str) -> Result<MarkingType, String> {
    match value {
        "atomic" => Ok(MarkingType::Atomic),
        "incremental" => Ok(MarkingType::Incremental),
        _ => Err(format!(
            "unknown marking type '{}', expected: atomic, incremental",
            value
        )),
    }
}

pub fn parse_sweeping_type(value: &str) -> Result<SweepingType, String> {
    match value {
        "atomic" => Ok(SweepingType::Atomic),
        "concurrent" => Ok(SweepingType::Concurrent),
        _ => Err(format!(
            "unknown sweeping type '{}', expected: atomic, concurrent",
            value
        )),
    }
}

pub fn parse_mem_size(value: &str) -> Result<MemSize, String> {
    let suffix = if let Some(ch) = value.chars().last() {
        match ch {
            'k' | 'K' => 1024,
            'm' | 'M' => 1024 * 1024,
            'g' | 'G' => 1024 * 1024 * 1024,
            _ => 1,
        }
    } else {
        1
    };

    let prefix = if suffix != 1 {
        let (left, _) = value.split_at(value.len() - 1);
        left
    } else {
        value
    };

    match prefix.parse::<usize>() {
        Ok(size) => Ok(MemSize(size * suffix)),
        Err(_) => Err(format!("'{}' is not a valid mem size", value)),
    }
}
