use std::sync::atomic::{AtomicU32, Ordering};

use object::Address;

use crate::{HeapMemory, oop};

pub const BLOCK_WORDS: usize = 64;
const NO_START: u32 = u32::MAX;

/// Maps any address in the covered region to the start of the object
/// containing it.
///
/// Each block of [`BLOCK_WORDS`] words records the lowest offset at which an
/// object starts inside it. A lookup walks back to a block with a start at or
/// below the address, then forward object by object.
pub struct ObjectStartArray {
    covered_start: Address,
    covered_end: Address,
    blocks: Box<[AtomicU32]>,
}

impl ObjectStartArray {
    pub fn new(covered_start: Address, covered_end: Address) -> Self {
        let count = (covered_end - covered_start).div_ceil(BLOCK_WORDS);
        Self {
            covered_start,
            covered_end,
            blocks: (0..count).map(|_| AtomicU32::new(NO_START)).collect(),
        }
    }

    #[inline(always)]
    fn block_index(&self, addr: Address) -> usize {
        debug_assert!(
            self.covered_start <= addr && addr < self.covered_end,
            "{addr:#x} outside start array [{:#x}, {:#x})",
            self.covered_start,
            self.covered_end
        );
        (addr - self.covered_start) / BLOCK_WORDS
    }

    #[inline(always)]
    fn block_start(&self, index: usize) -> Address {
        self.covered_start + index * BLOCK_WORDS
    }

    pub fn covers(&self, addr: Address) -> bool {
        self.covered_start <= addr && addr < self.covered_end
    }

    /// Records that an object starts at `obj`. Safe to call concurrently.
    #[inline]
    pub fn allocate_block(&self, obj: Address) {
        let index = self.block_index(obj);
        let offset = (obj - self.block_start(index)) as u32;
        self.blocks[index].fetch_min(offset, Ordering::Relaxed);
    }

    /// Forgets every start in the blocks overlapping `[from, to)`.
    pub fn reset(&self, from: Address, to: Address) {
        if from >= to {
            return;
        }
        let first = self.block_index(from);
        let last = self.block_index(to - 1);
        for block in &self.blocks[first..=last] {
            block.store(NO_START, Ordering::Relaxed);
        }
    }

    /// Records every object in `[from, to)`.
    pub fn record_range(&self, mem: &HeapMemory, from: Address, to: Address) {
        oop::walk_objects(mem, from, to, |obj, _| self.allocate_block(obj));
    }

    /// The start of the object that contains `addr`.
    ///
    /// Every object between the recorded start and `addr` must be parsable.
    pub fn object_start(&self, mem: &HeapMemory, addr: Address) -> Address {
        debug_assert!(self.covers(addr), "{addr:#x} outside the start array");
        let mut index = self.block_index(addr);
        loop {
            let offset = self.blocks[index].load(Ordering::Relaxed);
            if offset != NO_START && self.block_start(index) + offset as usize <= addr {
                break;
            }
            assert!(index > 0, "no object start recorded at or below {addr:#x}");
            index -= 1;
        }
        let mut cur = self.block_start(index) + self.blocks[index].load(Ordering::Relaxed) as usize;
        loop {
            let next = cur + oop::object_size(mem, cur);
            if next > addr {
                return cur;
            }
            cur = next;
        }
    }

    /// Whether a start is recorded exactly at `obj`, or the block's lowest
    /// recorded start lies below it.
    pub fn is_block_start_consistent(&self, obj: Address) -> bool {
        let index = self.block_index(obj);
        let offset = self.blocks[index].load(Ordering::Relaxed);
        offset != NO_START && self.block_start(index) + offset as usize <= obj
    }
}

impl core::fmt::Debug for ObjectStartArray {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectStartArray")
            .field("covered_start", &self.covered_start)
            .field("covered_end", &self.covered_end)
            .finish()
    }
}
