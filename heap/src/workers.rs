use crate::SenseBarrier;

/// A fixed-size gang of collector threads.
///
/// Each [`run`](WorkGang::run) spawns one scoped thread per worker and joins
/// them all before returning, so the task may borrow heap state. Workers
/// line up between sub-phases with [`sync`](WorkGang::sync).
#[derive(Debug)]
pub struct WorkGang {
    workers: usize,
    barrier: SenseBarrier,
}

impl WorkGang {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "a work gang needs at least one worker");
        Self {
            workers,
            barrier: SenseBarrier::new(),
        }
    }

    #[inline(always)]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `task(worker_id, state)` on every worker, one state per worker.
    pub fn run<S, F>(&self, states: Vec<S>, task: F)
    where
        S: Send,
        F: Fn(usize, S) + Sync,
    {
        assert_eq!(states.len(), self.workers, "one state per worker");
        if self.workers == 1 {
            for state in states {
                task(0, state);
            }
            return;
        }
        let task = &task;
        std::thread::scope(|s| {
            for (id, state) in states.into_iter().enumerate() {
                s.spawn(move || task(id, state));
            }
        });
    }

    /// Waits until every worker of the current run has arrived.
    #[inline]
    pub fn sync(&self) {
        self.barrier.wait(self.workers);
    }
}
