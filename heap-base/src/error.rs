use thiserror::Error;

use crate::gc::Address;

/// Errors that are reported to the embedder instead of aborting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory: allocation of {requested} bytes failed in {context}")]
    OutOfMemory {
        requested: usize,
        context: &'static str,
    },

    #[error("heap limit of {limit} bytes exceeded by request of {requested} bytes")]
    HeapLimitExceeded { limit: usize, requested: usize },

    #[error("page allocator could not provide {size} bytes")]
    PageAllocationFailed { size: usize },

    #[error("invalid heap configuration: {0}")]
    InvalidConfiguration(String),
}

impl HeapError {
    pub fn is_out_of_memory(&self) -> bool {
        !matches!(self, HeapError::InvalidConfiguration(_))
    }

    pub fn requested_size(&self) -> usize {
        match self {
            HeapError::OutOfMemory { requested, .. } => *requested,
            HeapError::HeapLimitExceeded { requested, .. } => *requested,
            HeapError::PageAllocationFailed { size } => *size,
            HeapError::InvalidConfiguration(_) => 0,
        }
    }
}

/// Broken heap invariants. These never propagate, see [`fatal`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    #[error("object {object} does not point to a valid type descriptor")]
    UnknownTypeDescriptor { object: Address },

    #[error("visitor cannot encounter filler or free space, found one at {object}")]
    UnexpectedFillerOrFreeSpace { object: Address },

    #[error("visitor precomputes object sizes, use visit_with_known_size for {object}")]
    WrongVisitOverload { object: Address },

    #[error("leaving no-gc scope with counter already zero")]
    NoGcScopeUnderflow,

    #[error("leaving disallow-gc scope with counter already zero")]
    DisallowGcScopeUnderflow,

    #[error("chunk {chunk} is both never-evacuate and evacuation candidate")]
    NeverEvacuateCandidate { chunk: Address },

    #[error("collection started while garbage collection is forbidden")]
    CollectionWhileForbidden,

    #[error("collection started while sweeping on the mutator thread")]
    CollectionWhileSweeping,

    #[error("a marker is already active")]
    MarkerAlreadyActive,

    #[error("no marker is active")]
    NoActiveMarker,

    #[error("heap operation called from a thread other than the heap thread")]
    NotOnHeapThread,

    #[error("incremental marking is not supported by this heap")]
    IncrementalMarkingUnsupported,

    #[error("object {object} is not inside the heap")]
    ObjectOutsideHeap { object: Address },

    #[error("marking verification failed: {host} references dead object {target}")]
    MarkingVerificationFailed { host: Address, target: Address },

    #[error("could not change protection of chunk {chunk}")]
    ChunkProtectionFailed { chunk: Address },

    #[error("out of memory while allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("type {name} cannot be used as {expected}")]
    WrongLayout {
        name: &'static str,
        expected: &'static str,
    },
}

/// Reports the broken invariant and aborts. The release profile is built with
/// `panic = "abort"`.
#[cold]
#[inline(never)]
pub fn fatal(error: FatalError) -> ! {
    log::error!("fatal heap error: {}", error);
    panic!("fatal heap error: {}", error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_error_messages() {
        let err = HeapError::HeapLimitExceeded {
            limit: 1024,
            requested: 4096,
        };
        assert_eq!(
            err.to_string(),
            "heap limit of 1024 bytes exceeded by request of 4096 bytes"
        );
        assert!(err.is_out_of_memory());
        assert!(!HeapError::InvalidConfiguration("x".into()).is_out_of_memory());
    }

    #[test]
    #[should_panic(expected = "leaving no-gc scope with counter already zero")]
    fn fatal_panics_with_invariant() {
        fatal(FatalError::NoGcScopeUnderflow);
    }

    #[test]
    fn fatal_message_names_address() {
        let error = FatalError::NeverEvacuateCandidate {
            chunk: Address::from(0x40000),
        };
        assert_eq!(
            error.to_string(),
            "chunk 0x40000 is both never-evacuate and evacuation candidate"
        );
    }
}
