use parking_lot::{Condvar, Mutex};

/// A reusable synchronization barrier that puts threads to sleep
#[derive(Debug, Default)]
pub struct SenseBarrier {
    /// Protected state: (current_count, current_sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
}

impl SenseBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((0, false)),
            cvar: Condvar::new(),
        }
    }

    /// Blocks the current thread until `until` threads have called this function.
    pub fn wait(&self, until: usize) {
        let mut state = self.state.lock();
        let my_sense = state.1;
        state.0 += 1;

        if state.0 == until {
            // last one in flips the sense
            state.0 = 0;
            state.1 = !my_sense;
            self.cvar.notify_all();
        } else {
            while state.1 == my_sense {
                self.cvar.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn barrier_separates_rounds() {
        const THREADS: usize = 4;
        let barrier = SenseBarrier::new();
        let arrived = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for round in 1..=3 {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        barrier.wait(THREADS);
                        assert!(arrived.load(Ordering::SeqCst) >= round * THREADS);
                        barrier.wait(THREADS);
                    }
                });
            }
        });
        assert_eq!(arrived.load(Ordering::SeqCst), 3 * THREADS);
    }
}
