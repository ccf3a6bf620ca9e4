use crate::gc::Address;

pub type PreFinalizer = Box<dyn FnMut(Address)>;

/// Callbacks run for dead objects in the atomic pause, while the object is
/// still readable.
pub struct PreFinalizerHandler {
    registrations: Vec<(Address, PreFinalizer)>,
    running: bool,
}

impl PreFinalizerHandler {
    pub fn new() -> PreFinalizerHandler {
        PreFinalizerHandler {
            registrations: Vec::new(),
            running: false,
        }
    }

    pub fn register(&mut self, object: Address, callback: PreFinalizer) {
        assert!(!self.running, "pre-finalizer registered while pre-finalizers run");
        self.registrations.push((object, callback));
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Runs and drops the registrations of objects `is_live` rejects, in
    /// reverse registration order. Returns the number of callbacks run.
    pub fn invoke_dead<F>(&mut self, mut is_live: F) -> usize
    where
        F: FnMut(Address) -> bool,
    {
        self.running = true;

        let mut invoked = 0;
        let mut index = self.registrations.len();

        while index > 0 {
            index -= 1;

            if is_live(self.registrations[index].0) {
                continue;
            }

            let (object, mut callback) = self.registrations.remove(index);
            callback(object);
            invoked += 1;
        }

        self.running = false;
        invoked
    }

    /// Redirects registrations of objects that were moved.
    pub fn update_references<F>(&mut self, mut forward: F)
    where
        F: FnMut(Address) -> Address,
    {
        for (object, _) in &mut self.registrations {
            *object = forward(*object);
        }
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }
}
