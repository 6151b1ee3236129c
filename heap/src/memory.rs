use std::sync::atomic::{AtomicU64, Ordering};

use object::{Address, KLASS_OFFSET, MARK_OFFSET, MarkWord, Value};

/// Pattern written over unused memory when zapping is enabled.
pub const ZAP_WORD: u64 = 0xbaad_babe_baad_babe;

/// The heap's backing store: one contiguous, word-addressed reservation.
///
/// Mark words are the publication point between collector threads: the mark
/// is read with `Acquire` and installed with `Release`/`AcqRel`, every other
/// word is accessed `Relaxed` and becomes visible through the mark.
pub struct HeapMemory {
    words: Box<[AtomicU64]>,
}

impl HeapMemory {
    pub fn new(words: usize) -> Self {
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline(always)]
    pub fn load(&self, addr: Address) -> u64 {
        self.words[addr].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn store(&self, addr: Address, word: u64) {
        self.words[addr].store(word, Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn load_value(&self, addr: Address) -> Value {
        Value::from_raw(self.load(addr))
    }

    #[inline(always)]
    pub fn store_value(&self, addr: Address, value: Value) {
        self.store(addr, value.raw())
    }

    // ── header ─────────────────────────────────────────────────────

    #[inline(always)]
    pub fn mark(&self, obj: Address) -> MarkWord {
        MarkWord::from_raw(self.words[obj + MARK_OFFSET].load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_mark(&self, obj: Address, mark: MarkWord) {
        self.words[obj + MARK_OFFSET].store(mark.raw(), Ordering::Release)
    }

    /// Installs `new` if the mark still equals `current`.
    /// Returns the mark observed on failure.
    #[inline(always)]
    pub fn cas_mark(
        &self,
        obj: Address,
        current: MarkWord,
        new: MarkWord,
    ) -> Result<MarkWord, MarkWord> {
        self.words[obj + MARK_OFFSET]
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(MarkWord::from_raw)
            .map_err(MarkWord::from_raw)
    }

    #[inline(always)]
    pub fn klass(&self, obj: Address) -> Value {
        self.load_value(obj + KLASS_OFFSET)
    }

    #[inline(always)]
    pub fn set_klass(&self, obj: Address, klass: Value) {
        self.store_value(obj + KLASS_OFFSET, klass)
    }

    // ── bulk ───────────────────────────────────────────────────────

    /// Copies `words` words from `from` to `to`. Overlapping ranges are
    /// handled in either direction.
    pub fn copy_words(&self, from: Address, to: Address, words: usize) {
        if from == to || words == 0 {
            return;
        }
        if to < from {
            for i in 0..words {
                self.store(to + i, self.load(from + i));
            }
        } else {
            for i in (0..words).rev() {
                self.store(to + i, self.load(from + i));
            }
        }
    }

    pub fn fill(&self, from: Address, words: usize, word: u64) {
        for addr in from..from + words {
            self.store(addr, word);
        }
    }
}

impl core::fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapMemory").field("words", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_copies() {
        let mem = HeapMemory::new(16);
        for i in 0..8 {
            mem.store(4 + i, i as u64);
        }
        mem.copy_words(4, 2, 8);
        assert_eq!((0..8).map(|i| mem.load(2 + i)).collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());

        mem.copy_words(2, 6, 8);
        assert_eq!((0..8).map(|i| mem.load(6 + i)).collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn cas_mark_reports_winner() {
        let mem = HeapMemory::new(8);
        mem.set_mark(2, MarkWord::prototype());
        assert!(mem.cas_mark(2, MarkWord::prototype(), MarkWord::forwarded(6)).is_ok());
        let lost = mem.cas_mark(2, MarkWord::prototype(), MarkWord::forwarded(4));
        assert_eq!(lost, Err(MarkWord::forwarded(6)));
    }
}
