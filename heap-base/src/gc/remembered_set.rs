use std::collections::HashSet;

use parking_lot::Mutex;

use crate::gc::root::Slot;
use crate::gc::Address;

/// Slots in old objects that may point to young objects. Filled by the
/// generational barrier, consumed as roots by minor collections.
pub struct OldToNewRememberedSet {
    slots: Mutex<HashSet<Address>>,
}

impl OldToNewRememberedSet {
    pub fn new() -> OldToNewRememberedSet {
        OldToNewRememberedSet {
            slots: Mutex::new(HashSet::new()),
        }
    }

    pub fn insert(&self, slot: Slot) -> bool {
        self.slots.lock().insert(slot.address())
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.slots.lock().contains(&slot.address())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Snapshot of all recorded slots in address order.
    pub fn slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Address> = self.slots.lock().iter().copied().collect();
        slots.sort();
        slots.into_iter().map(Slot::at).collect()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}
