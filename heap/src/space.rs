use std::sync::atomic::{AtomicUsize, Ordering};

use object::Address;

use crate::{HeapMemory, ZAP_WORD};

/// A contiguous, bump-allocated region `[bottom, end)` with the next free
/// word at `top`.
///
/// `top` is atomic so collector threads can allocate concurrently; `bottom`
/// and `end` only change while the orchestrating thread has exclusive access
/// to the heap.
pub struct Space {
    name: &'static str,
    bottom: Address,
    end: Address,
    top: AtomicUsize,
}

impl Space {
    pub fn new(name: &'static str, bottom: Address, end: Address) -> Self {
        debug_assert!(bottom <= end);
        Self {
            name,
            bottom,
            end,
            top: AtomicUsize::new(bottom),
        }
    }

    #[inline(always)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline(always)]
    pub fn bottom(&self) -> Address {
        self.bottom
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline(always)]
    pub fn top(&self) -> Address {
        self.top.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_top(&self, top: Address) {
        debug_assert!(self.bottom <= top && top <= self.end, "{} top out of bounds", self.name);
        self.top.store(top, Ordering::Release)
    }

    pub fn set_bounds(&mut self, bottom: Address, end: Address) {
        debug_assert!(bottom <= end);
        self.bottom = bottom;
        self.end = end;
        let top = self.top().clamp(bottom, end);
        self.set_top(top);
    }

    pub fn set_end(&mut self, end: Address) {
        debug_assert!(self.top() <= end);
        self.end = end;
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.end - self.bottom
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    #[inline(always)]
    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.bottom <= addr && addr < self.end
    }

    #[inline(always)]
    pub fn is_in_used(&self, addr: Address) -> bool {
        self.bottom <= addr && addr < self.top()
    }

    /// Lock-free bump allocation.
    pub fn par_allocate(&self, words: usize) -> Option<Address> {
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if self.end - top < words {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + words,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(top),
                Err(current) => top = current,
            }
        }
    }

    /// Undoes `par_allocate` of `[obj, obj + words)` if nothing was allocated
    /// after it.
    pub fn cas_deallocate(&self, obj: Address, words: usize) -> bool {
        self.top
            .compare_exchange(obj + words, obj, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn clear(&self, mem: &HeapMemory, zap: bool) {
        if zap {
            mem.fill(self.bottom, self.used(), ZAP_WORD);
        }
        self.set_top(self.bottom);
    }

    /// Overwrites `[top, end)`.
    pub fn mangle_unused_area(&self, mem: &HeapMemory) {
        mem.fill(self.top(), self.free(), ZAP_WORD);
    }
}

impl core::fmt::Debug for Space {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} [{:#x}, {:#x}, {:#x}) used {}/{}",
            self.name,
            self.bottom,
            self.top(),
            self.end,
            self.used(),
            self.capacity()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_until_full() {
        let space = Space::new("test", 16, 32);
        assert_eq!(space.par_allocate(10), Some(16));
        assert_eq!(space.par_allocate(6), Some(26));
        assert_eq!(space.par_allocate(1), None);
        assert_eq!(space.used(), 16);
        assert_eq!(space.free(), 0);
    }

    #[test]
    fn deallocate_only_the_latest_allocation() {
        let space = Space::new("test", 0, 64);
        let a = space.par_allocate(4).unwrap();
        let b = space.par_allocate(4).unwrap();
        assert!(!space.cas_deallocate(a, 4));
        assert!(space.cas_deallocate(b, 4));
        assert_eq!(space.top(), b);
    }

    #[test]
    fn concurrent_allocations_do_not_overlap() {
        let space = Space::new("test", 0, 4096);
        let mut all: Vec<Address> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let space = &space;
                    s.spawn(move || {
                        (0..256).filter_map(|_| space.par_allocate(4)).collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        all.sort_unstable();
        assert_eq!(all.len(), 1024);
        assert!(all.windows(2).all(|w| w[1] - w[0] == 4));
    }
}
