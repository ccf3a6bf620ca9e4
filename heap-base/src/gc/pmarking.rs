use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use scoped_threadpool::Pool;

use crate::gc::marking::{MarkingConfig, MarkingSink, MarkingVisitor};
use crate::gc::root::Slot;
use crate::gc::visitor::HeapVisitor;
use crate::gc::Address;

#[derive(Default)]
pub struct ParallelMarkingResult {
    pub marked_bytes: usize,
    pub weak_slots: Vec<Slot>,
    pub recorded_slots: Vec<Slot>,
}

/// Traces everything reachable from `initial` on all threads of `pool`.
/// Objects in `initial` must already be marked.
pub fn mark_parallel(
    pool: &mut Pool,
    config: &MarkingConfig,
    initial: Vec<Address>,
) -> ParallelMarkingResult {
    let number_workers = pool.thread_count() as usize;
    let mut workers = Vec::with_capacity(number_workers);
    let mut stealers = Vec::with_capacity(number_workers);
    let injector: Injector<Address> = Injector::new();

    for _ in 0..number_workers {
        let w = Worker::new_lifo();
        let s = w.stealer();
        workers.push(w);
        stealers.push(s);
    }

    for object in initial {
        injector.push(object);
    }

    let terminator = Terminator::new(number_workers);
    let result = Mutex::new(ParallelMarkingResult::default());

    pool.scoped(|scoped| {
        for (task_id, worker) in workers.into_iter().enumerate() {
            let injector = &injector;
            let stealers = &stealers;
            let terminator = &terminator;
            let result = &result;

            scoped.execute(move || {
                let mut task = MarkingTask {
                    task_id,
                    config,
                    local: Vec::new(),
                    worker,
                    injector,
                    stealers,
                    terminator,
                    marked_bytes: 0,
                    weak_slots: Vec::new(),
                    recorded_slots: Vec::new(),
                    pushed: 0,
                };

                task.run();

                let mut result = result.lock();
                result.marked_bytes += task.marked_bytes;
                result.weak_slots.append(&mut task.weak_slots);
                result.recorded_slots.append(&mut task.recorded_slots);
            });
        }
    });

    result.into_inner()
}

const LOCAL_MAXIMUM: usize = 64;

struct MarkingTask<'a> {
    task_id: usize,
    config: &'a MarkingConfig,
    local: Vec<Address>,
    worker: Worker<Address>,
    injector: &'a Injector<Address>,
    stealers: &'a [Stealer<Address>],
    terminator: &'a Terminator,

    marked_bytes: usize,
    weak_slots: Vec<Slot>,
    recorded_slots: Vec<Slot>,
    pushed: usize,
}

impl<'a> MarkingSink for MarkingTask<'a> {
    fn config(&self) -> &MarkingConfig {
        self.config
    }

    fn push(&mut self, object: Address) {
        if self.local.len() < LOCAL_MAXIMUM {
            self.local.push(object);
            self.share_work();
        } else {
            self.worker.push(object);
        }
    }

    fn record_weak_slot(&mut self, slot: Slot) {
        self.weak_slots.push(slot);
    }

    fn record_slot(&mut self, slot: Slot) {
        self.recorded_slots.push(slot);
    }
}

impl<'a> MarkingTask<'a> {
    fn run(&mut self) {
        loop {
            let object = if let Some(object) = self.pop() {
                object
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            let size = MarkingVisitor::new(self).visit(object);
            self.marked_bytes += size;
        }
    }

    /// Shares half of a long local list so idle workers can steal it.
    fn share_work(&mut self) {
        self.pushed += 1;

        if self.pushed > 256 {
            if self.local.len() > 4 {
                let target_len = self.local.len() / 2;

                while self.local.len() > target_len {
                    match self.local.pop() {
                        Some(object) => self.injector.push(object),
                        None => break,
                    }
                }
            }

            self.pushed = 0;
        }
    }

    fn pop(&mut self) -> Option<Address> {
        self.pop_local()
            .or_else(|| self.pop_worker())
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_local(&mut self) -> Option<Address> {
        self.local.pop()
    }

    fn pop_worker(&mut self) -> Option<Address> {
        self.worker.pop()
    }

    fn pop_global(&mut self) -> Option<Address> {
        loop {
            let result = self.injector.steal_batch_and_pop(&self.worker);

            match result {
                Steal::Empty => break,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }

        None
    }

    fn steal(&self) -> Option<Address> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = self.task_id;

            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers[stealer_id];

            loop {
                match stealer.steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(address) => return Some(address),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }
}

/// Termination protocol of the parallel phases: a worker that runs out of
/// work leaves the active count and terminates once the count reaches zero.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        self.decrease_workers();
        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::SeqCst) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            let result = self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            );

            match result {
                Ok(_) => {
                    return false;
                }

                Err(prev_nworkers) => {
                    nworkers = prev_nworkers;
                }
            }
        }
    }
}
