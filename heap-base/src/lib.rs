//! Heap coordination layer of a garbage collected runtime: the heap-base
//! object owning allocator, marker, sweeper and compactor, the per-chunk flag
//! model and the object visitor dispatch.

pub mod error;
pub mod flags;
pub mod gc;
pub mod mem;
pub mod os;
pub mod timer;

pub use crate::error::{FatalError, HeapError};
pub use crate::flags::{HeapFlags, MarkingType, MemSize, SweepingType};
pub use crate::gc::heap_base::{
    DisallowGcScope, GcConfig, HeapBase, HeapState, MoveListener, NoGcScope, StickyBits,
};
pub use crate::gc::{Address, Region};

#[cfg(not(target_family = "unix"))]
compile_error!("heap-base only supports unix targets");
