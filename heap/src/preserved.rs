use std::sync::atomic::{AtomicUsize, Ordering};

use object::{Address, MarkWord};
use parking_lot::Mutex;

use crate::{HeapMemory, forwarding};

/// Mark words that cannot be rebuilt from the prototype, saved while the
/// full collector reuses the mark for marking and forwarding.
///
/// Entries are `(object, mark)` word pairs bump-allocated in scratch memory
/// (the unused to-space) and spill into a vector once the scratch is full.
#[derive(Debug)]
pub struct PreservedMarks {
    scratch_bottom: Address,
    scratch_end: Address,
    scratch_top: AtomicUsize,
    overflow: Mutex<Vec<(Address, MarkWord)>>,
}

impl PreservedMarks {
    /// `scratch` must be memory no live object occupies for the duration of
    /// the collection. An empty range keeps everything in the overflow.
    pub fn new(scratch: std::ops::Range<Address>) -> Self {
        Self {
            scratch_bottom: scratch.start,
            scratch_end: scratch.end,
            scratch_top: AtomicUsize::new(scratch.start),
            overflow: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, mem: &HeapMemory, obj: Address, mark: MarkWord) {
        let mut top = self.scratch_top.load(Ordering::Relaxed);
        loop {
            if self.scratch_end - top < 2 {
                self.overflow.lock().push((obj, mark));
                return;
            }
            match self.scratch_top.compare_exchange_weak(
                top,
                top + 2,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => top = current,
            }
        }
        mem.store(top, obj as u64);
        mem.store(top + 1, mark.raw());
    }

    pub fn len(&self) -> usize {
        (self.scratch_top.load(Ordering::Acquire) - self.scratch_bottom) / 2 + self.overflow.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each_entry(&self, mem: &HeapMemory, mut f: impl FnMut(Address, MarkWord) -> Address) {
        let top = self.scratch_top.load(Ordering::Acquire);
        for entry in (self.scratch_bottom..top).step_by(2) {
            let obj = mem.load(entry) as Address;
            let moved = f(obj, MarkWord::from_raw(mem.load(entry + 1)));
            mem.store(entry, moved as u64);
        }
        for (obj, mark) in self.overflow.lock().iter_mut() {
            *obj = f(*obj, *mark);
        }
    }

    /// Rewrites every saved object address to its forwarding destination.
    /// Run while marks hold forwarding pointers.
    pub fn adjust(&self, mem: &HeapMemory) {
        self.for_each_entry(mem, |obj, _| {
            forwarding::forwardee(mem, obj).unwrap_or_else(|| {
                panic!("preserved mark for {obj:#x} whose object was not forwarded")
            })
        });
    }

    /// Writes the saved marks back into the (relocated) objects.
    pub fn restore(&self, mem: &HeapMemory) {
        self.for_each_entry(mem, |obj, mark| {
            mem.set_mark(obj, mark);
            obj
        });
    }

    /// Forgets every entry. The scratch memory is free again afterwards.
    pub fn release(&self) {
        self.scratch_top.store(self.scratch_bottom, Ordering::Release);
        self.overflow.lock().clear();
    }
}
