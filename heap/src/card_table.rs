use std::sync::atomic::{AtomicU8, Ordering};

use object::Address;

pub const CLEAN_CARD: u8 = 0xff;
pub const DIRTY_CARD: u8 = 0;

/// One byte per `card_size` words of the heap. A dirty card may hold a
/// pointer into the young generation.
///
/// Writes are byte-granular and idempotent, so concurrent writers to
/// different objects on one card never conflict.
pub struct CardTable {
    shift: u32,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new(heap_words: usize, card_size: usize) -> Self {
        debug_assert!(card_size.is_power_of_two());
        let count = heap_words.div_ceil(card_size);
        Self {
            shift: card_size.trailing_zeros(),
            cards: (0..count).map(|_| AtomicU8::new(CLEAN_CARD)).collect(),
        }
    }

    #[inline(always)]
    pub fn card_size(&self) -> usize {
        1 << self.shift
    }

    #[inline(always)]
    pub fn index_for(&self, addr: Address) -> usize {
        addr >> self.shift
    }

    #[inline(always)]
    pub fn card_start(&self, index: usize) -> Address {
        index << self.shift
    }

    #[inline(always)]
    pub fn mark(&self, addr: Address) {
        self.cards[self.index_for(addr)].store(DIRTY_CARD, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_dirty(&self, addr: Address) -> bool {
        self.is_card_dirty(self.index_for(addr))
    }

    #[inline(always)]
    pub fn is_card_dirty(&self, index: usize) -> bool {
        self.cards[index].load(Ordering::Relaxed) == DIRTY_CARD
    }

    #[inline(always)]
    pub fn clean_card(&self, index: usize) {
        self.cards[index].store(CLEAN_CARD, Ordering::Relaxed);
    }

    /// Cards overlapping `[from, to)`.
    pub fn card_range(&self, from: Address, to: Address) -> std::ops::Range<usize> {
        if from >= to {
            return 0..0;
        }
        self.index_for(from)..self.index_for(to - 1) + 1
    }

    pub fn clear(&self, from: Address, to: Address) {
        for index in self.card_range(from, to) {
            self.clean_card(index);
        }
    }

    /// Conservatively dirties `[from, to)` so the next scavenge rescans it.
    pub fn invalidate(&self, from: Address, to: Address) {
        for index in self.card_range(from, to) {
            self.cards[index].store(DIRTY_CARD, Ordering::Relaxed);
        }
    }

    pub fn dirty_cards(&self, from: Address, to: Address) -> usize {
        self.card_range(from, to)
            .filter(|&index| self.is_card_dirty(index))
            .count()
    }
}

impl core::fmt::Debug for CardTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CardTable")
            .field("card_size", &self.card_size())
            .field("cards", &self.cards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_clear_invalidate() {
        let table = CardTable::new(1024, 64);
        assert_eq!(table.dirty_cards(0, 1024), 0);

        table.mark(130);
        assert!(table.is_dirty(128));
        assert!(table.is_dirty(191));
        assert!(!table.is_dirty(192));

        table.invalidate(256, 512);
        assert_eq!(table.dirty_cards(0, 1024), 5);

        table.clear(0, 1024);
        assert_eq!(table.dirty_cards(0, 1024), 0);
    }

    #[test]
    fn card_range_covers_partial_cards() {
        let table = CardTable::new(1024, 64);
        assert_eq!(table.card_range(10, 70), 0..2);
        assert_eq!(table.card_range(64, 128), 1..2);
        assert_eq!(table.card_range(5, 5), 0..0);
    }
}
