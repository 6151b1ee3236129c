//! Work-stealing queues shared by the scavenger and the mark phase.
//!
//! Every worker owns a bounded LIFO deque. Pushes beyond the bound spill into
//! one shared overflow injector. An idle worker drains the overflow first and
//! then steals from its peers, and the pass ends once every worker agrees
//! through the [`Terminator`].

use std::{
    hint, iter,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

const SPIN_ROUNDS: u32 = 8;
const YIELD_ROUNDS: u32 = 64;

/// Counters collected across one pass.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub pushes: AtomicUsize,
    pub overflows: AtomicUsize,
    pub steals: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub pushes: usize,
    pub overflows: usize,
    pub steals: usize,
}

pub struct TaskQueueSet<T> {
    stealers: Vec<Stealer<T>>,
    overflow: Injector<T>,
    terminator: Terminator,
    capacity: usize,
    stats: QueueStats,
}

impl<T> TaskQueueSet<T> {
    /// Creates the shared half of `workers` queues and returns the owned
    /// halves, one per worker.
    pub fn new(workers: usize, capacity: usize) -> (Self, Vec<Worker<T>>) {
        let locals: Vec<Worker<T>> = (0..workers).map(|_| Worker::new_lifo()).collect();
        let set = Self {
            stealers: locals.iter().map(Worker::stealer).collect(),
            overflow: Injector::new(),
            terminator: Terminator::new(workers),
            capacity,
            stats: QueueStats::default(),
        };
        (set, locals)
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.stealers.len()
    }

    /// Whether any queue or the overflow holds work.
    pub fn has_work(&self) -> bool {
        !self.overflow.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_work()
    }

    pub fn push_overflow(&self, item: T) {
        self.stats.overflows.fetch_add(1, Ordering::Relaxed);
        self.overflow.push(item);
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    /// Offers termination on behalf of an idle worker. `true` means every
    /// worker is idle and no work is left anywhere.
    pub fn offer_termination(&self) -> bool {
        self.terminator.offer_termination(|| self.has_work())
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            pushes: self.stats.pushes.load(Ordering::Relaxed),
            overflows: self.stats.overflows.load(Ordering::Relaxed),
            steals: self.stats.steals.load(Ordering::Relaxed),
        }
    }
}

impl<T> core::fmt::Debug for TaskQueueSet<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskQueueSet")
            .field("workers", &self.workers())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// The worker-owned end of a [`TaskQueueSet`].
pub struct LocalQueue<'a, T> {
    id: usize,
    local: Worker<T>,
    set: &'a TaskQueueSet<T>,
}

impl<'a, T> LocalQueue<'a, T> {
    pub fn new(id: usize, local: Worker<T>, set: &'a TaskQueueSet<T>) -> Self {
        Self { id, local, set }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn set(&self) -> &'a TaskQueueSet<T> {
        self.set
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.local.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    #[inline]
    pub fn push(&self, item: T) {
        self.set.stats.pushes.fetch_add(1, Ordering::Relaxed);
        if self.local.len() >= self.set.capacity {
            self.set.push_overflow(item);
        } else {
            self.local.push(item);
        }
    }

    /// Pops from this worker's own deque only.
    #[inline]
    pub fn pop_local(&self) -> Option<T> {
        self.local.pop()
    }

    /// Pops locally, then from the overflow, then from peers.
    pub fn pop(&self) -> Option<T> {
        self.local.pop().or_else(|| self.steal())
    }

    fn steal(&self) -> Option<T> {
        let stolen = iter::repeat_with(|| {
            self.set.overflow.steal_batch_and_pop(&self.local).or_else(|| {
                self.set
                    .stealers
                    .iter()
                    .enumerate()
                    .filter(|(peer, _)| *peer != self.id)
                    .map(|(_, stealer)| stealer.steal_batch_and_pop(&self.local))
                    .collect()
            })
        })
        .find(|steal| !steal.is_retry())
        .and_then(Steal::success);
        if stolen.is_some() {
            self.set.stats.steals.fetch_add(1, Ordering::Relaxed);
        }
        stolen
    }
}

/// Termination detection for a pass over a [`TaskQueueSet`].
///
/// An idle worker bumps the offer count and spins until either every worker
/// has offered (the pass is over) or work shows up somewhere, in which case
/// it withdraws its offer and goes back to stealing. Work pushed into the
/// overflow by a late peer therefore wakes idle workers up again.
#[derive(Debug)]
pub struct Terminator {
    workers: usize,
    offered: AtomicUsize,
}

impl Terminator {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            offered: AtomicUsize::new(0),
        }
    }

    pub fn offered(&self) -> usize {
        self.offered.load(Ordering::SeqCst)
    }

    pub fn offer_termination(&self, has_work: impl Fn() -> bool) -> bool {
        let previous = self.offered.fetch_add(1, Ordering::SeqCst);
        debug_assert!(previous < self.workers, "more offers than workers");

        let mut rounds = 0u32;
        loop {
            if self.offered.load(Ordering::SeqCst) == self.workers {
                return true;
            }

            if rounds < SPIN_ROUNDS {
                for _ in 0..(1u32 << rounds) {
                    hint::spin_loop();
                }
            } else if rounds < SPIN_ROUNDS + YIELD_ROUNDS {
                thread::yield_now();
            } else {
                thread::sleep(Duration::from_micros(50));
            }
            rounds = rounds.saturating_add(1);

            if has_work() {
                let mut current = self.offered.load(Ordering::SeqCst);
                loop {
                    if current == self.workers {
                        return true;
                    }
                    match self.offered.compare_exchange(
                        current,
                        current - 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => return false,
                        Err(actual) => current = actual,
                    }
                }
            }
        }
    }

    /// Prepares for another pass. Only call while no worker is offering.
    pub fn reset(&self) {
        self.offered.store(0, Ordering::SeqCst);
    }
}
