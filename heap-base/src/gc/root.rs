use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::gc::Address;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slot(Address);

impl Slot {
    pub fn at(addr: Address) -> Slot {
        Slot(addr)
    }

    pub fn address(self) -> Address {
        self.0
    }

    pub fn get(self) -> Address {
        unsafe { *self.0.to_ptr::<Address>() }
    }

    pub fn set(self, obj: Address) {
        unsafe {
            *self.0.to_mut_ptr::<Address>() = obj;
        }
    }
}

#[derive(Default)]
struct PersistentNodes {
    nodes: Vec<Option<Address>>,
    free: Vec<usize>,
    used: usize,
}

impl PersistentNodes {
    fn allocate(&mut self, value: Address) -> usize {
        self.used += 1;

        if let Some(index) = self.free.pop() {
            self.nodes[index] = Some(value);
            index
        } else {
            self.nodes.push(Some(value));
            self.nodes.len() - 1
        }
    }

    fn free(&mut self, index: usize) {
        debug_assert!(self.nodes[index].is_some());
        self.nodes[index] = None;
        self.free.push(index);
        self.used -= 1;
    }

    fn get(&self, index: usize) -> Address {
        self.nodes[index].unwrap_or_else(Address::null)
    }

    fn set(&mut self, index: usize, value: Address) {
        debug_assert!(self.nodes[index].is_some());
        self.nodes[index] = Some(value);
    }

    fn iterate<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Address),
    {
        for node in self.nodes.iter_mut() {
            if let Some(value) = node {
                if value.is_non_null() {
                    f(value);
                }
            }
        }
    }

    fn clear_all_used_nodes(&mut self) {
        for node in self.nodes.iter_mut() {
            if let Some(value) = node {
                *value = Address::null();
            }
        }
    }
}

/// Off-heap roots owned by the heap thread.
pub struct PersistentRegion {
    nodes: Rc<RefCell<PersistentNodes>>,
}

impl PersistentRegion {
    pub fn new() -> PersistentRegion {
        PersistentRegion {
            nodes: Rc::new(RefCell::new(PersistentNodes::default())),
        }
    }

    pub fn allocate(&self, value: Address) -> Persistent {
        let index = self.nodes.borrow_mut().allocate(value);

        Persistent {
            nodes: self.nodes.clone(),
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits all non-null nodes, the callback may update the node.
    pub fn iterate<F>(&self, f: F)
    where
        F: FnMut(&mut Address),
    {
        self.nodes.borrow_mut().iterate(f);
    }

    pub fn clear_all_used_nodes(&self) {
        self.nodes.borrow_mut().clear_all_used_nodes();
    }
}

/// Handle to a node in a [`PersistentRegion`]; releases the node on drop.
pub struct Persistent {
    nodes: Rc<RefCell<PersistentNodes>>,
    index: usize,
}

impl Persistent {
    pub fn get(&self) -> Address {
        self.nodes.borrow().get(self.index)
    }

    pub fn set(&self, value: Address) {
        self.nodes.borrow_mut().set(self.index, value);
    }

    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }
}

impl Drop for Persistent {
    fn drop(&mut self) {
        self.nodes.borrow_mut().free(self.index);
    }
}

/// Roots that may be created, updated and dropped on any thread.
pub struct CrossThreadPersistentRegion {
    nodes: Arc<Mutex<PersistentNodes>>,
}

impl CrossThreadPersistentRegion {
    pub fn new() -> CrossThreadPersistentRegion {
        CrossThreadPersistentRegion {
            nodes: Arc::new(Mutex::new(PersistentNodes::default())),
        }
    }

    pub fn allocate(&self, value: Address) -> CrossThreadPersistent {
        let index = self.nodes.lock().allocate(value);

        CrossThreadPersistent {
            nodes: self.nodes.clone(),
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iterate<F>(&self, f: F)
    where
        F: FnMut(&mut Address),
    {
        self.nodes.lock().iterate(f);
    }

    pub fn clear_all_used_nodes(&self) {
        self.nodes.lock().clear_all_used_nodes();
    }
}

pub struct CrossThreadPersistent {
    nodes: Arc<Mutex<PersistentNodes>>,
    index: usize,
}

impl CrossThreadPersistent {
    pub fn get(&self) -> Address {
        self.nodes.lock().get(self.index)
    }

    pub fn set(&self, value: Address) {
        self.nodes.lock().set(self.index, value);
    }
}

impl Drop for CrossThreadPersistent {
    fn drop(&mut self) {
        self.nodes.lock().free(self.index);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackState {
    NoHeapPointers,
    MayContainHeapPointers,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackSupport {
    SupportsConservativeStackScan,
    NoConservativeStackScan,
}

/// Words the mutator keeps in native frames. They are scanned
/// conservatively: any word pointing into an object keeps it alive and pins
/// its chunk for the cycle.
pub struct Stack {
    words: Rc<RefCell<Vec<usize>>>,
}

impl Stack {
    pub fn new() -> Stack {
        Stack {
            words: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn push(&self, word: usize) {
        self.words.borrow_mut().push(word);
    }

    /// Words pushed while the scope is alive are popped when it is dropped.
    pub fn scope(&self) -> StackScope {
        StackScope {
            words: self.words.clone(),
            len: self.words.borrow().len(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn words(&self) -> Vec<usize> {
        self.words.borrow().clone()
    }

    pub fn clear(&self) {
        self.words.borrow_mut().clear();
    }
}

pub struct StackScope {
    words: Rc<RefCell<Vec<usize>>>,
    len: usize,
}

impl Drop for StackScope {
    fn drop(&mut self) {
        self.words.borrow_mut().truncate(self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_get_set() {
        let mut word = 0usize;
        let slot = Slot::at(Address::from_ptr(&mut word as *mut usize));
        slot.set(Address::from(0x1000));
        assert_eq!(slot.get(), Address::from(0x1000));
        assert_eq!(word, 0x1000);
    }

    #[test]
    fn persistent_nodes_are_reused() {
        let region = PersistentRegion::new();
        let first = region.allocate(Address::from(8));
        let second = region.allocate(Address::from(16));
        assert_eq!(region.len(), 2);
        drop(first);
        assert_eq!(region.len(), 1);

        let third = region.allocate(Address::from(24));
        assert_eq!(third.index, 0);
        assert_eq!(second.get(), Address::from(16));
        assert_eq!(third.get(), Address::from(24));
    }

    #[test]
    fn persistent_iteration_skips_null() {
        let region = PersistentRegion::new();
        let a = region.allocate(Address::from(8));
        let _b = region.allocate(Address::null());

        let mut visited = Vec::new();
        region.iterate(|value| {
            visited.push(*value);
            *value = Address::from(32);
        });

        assert_eq!(visited, vec![Address::from(8)]);
        assert_eq!(a.get(), Address::from(32));

        region.clear_all_used_nodes();
        assert!(a.is_null());
        assert_eq!(region.len(), 2);
    }

    #[test]
    fn cross_thread_persistent_from_other_thread() {
        let region = CrossThreadPersistentRegion::new();
        let handle = region.allocate(Address::from(64));

        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(handle.get(), Address::from(64));
                handle.set(Address::from(128));
                let other = region.allocate(Address::from(256));
                drop(other);
            });
        });

        assert_eq!(handle.get(), Address::from(128));
        assert_eq!(region.len(), 1);
    }

    #[test]
    fn stack_scope_pops_words() {
        let stack = Stack::new();
        stack.push(1);

        {
            let _scope = stack.scope();
            stack.push(2);
            stack.push(3);
            assert_eq!(stack.len(), 3);
        }

        assert_eq!(stack.words(), vec![1]);
    }
}
