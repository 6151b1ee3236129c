use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Tracks native critical sections that touch raw object memory. No
/// collection may start while one is active.
#[derive(Debug, Default)]
pub struct GcLocker {
    active: AtomicUsize,
    needs_gc: AtomicBool,
}

impl GcLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> CriticalSection {
        self.active.fetch_add(1, Ordering::AcqRel);
        CriticalSection {
            locker: Arc::clone(self),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    /// Called by a collection before it touches the heap. Returns true when
    /// the collection must be abandoned, and remembers that one was wanted.
    pub fn check_active_before_gc(&self) -> bool {
        if self.is_active() {
            self.needs_gc.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Whether a collection was skipped because of a critical section.
    pub fn needs_gc(&self) -> bool {
        self.needs_gc.load(Ordering::Acquire)
    }

    pub(crate) fn clear_needs_gc(&self) {
        self.needs_gc.store(false, Ordering::Release);
    }
}

/// RAII guard for a critical section; leaving it re-enables collections.
#[derive(Debug)]
pub struct CriticalSection {
    locker: Arc<GcLocker>,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let previous = self.locker.active.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.locker.needs_gc() {
            log::debug!("last critical section left, a collection is pending");
        }
    }
}
