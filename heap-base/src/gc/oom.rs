use crate::error::{fatal, FatalError, HeapError};

pub type OutOfMemoryCallback = Box<dyn Fn(&HeapError)>;

/// Last stop of allocations that failed even after a garbage collection.
pub struct OutOfMemoryHandler {
    callback: Option<OutOfMemoryCallback>,
}

impl OutOfMemoryHandler {
    pub fn new() -> OutOfMemoryHandler {
        OutOfMemoryHandler { callback: None }
    }

    /// The callback runs before the process is aborted, e.g. to dump heap
    /// statistics.
    pub fn set_callback(&mut self, callback: OutOfMemoryCallback) {
        self.callback = Some(callback);
    }

    pub fn handle(&self, error: &HeapError) -> ! {
        log::error!("GC: {}", error);

        if let Some(ref callback) = self.callback {
            callback(error);
        }

        fatal(FatalError::OutOfMemory {
            requested: error.requested_size(),
        })
    }
}
