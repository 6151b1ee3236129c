use std::ops::Range;

use object::Address;

use crate::{ObjectStartArray, Space};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationKind {
    Young,
    Old,
    Perm,
}

impl core::fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            GenerationKind::Young => "young",
            GenerationKind::Old => "old",
            GenerationKind::Perm => "perm",
        })
    }
}

#[inline(always)]
pub fn align_up(n: usize, alignment: usize) -> usize {
    n.div_ceil(alignment) * alignment
}

/// Reserved `[low_boundary, high_boundary)` and committed `[low, high)` memory
/// of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualSpace {
    pub low_boundary: Address,
    pub low: Address,
    pub high: Address,
    pub high_boundary: Address,
}

impl VirtualSpace {
    pub fn committed_size(&self) -> usize {
        self.high - self.low
    }

    pub fn reserved_size(&self) -> usize {
        self.high_boundary - self.low_boundary
    }

    pub fn uncommitted_size(&self) -> usize {
        self.reserved_size() - self.committed_size()
    }

    pub fn reserved(&self) -> Range<Address> {
        self.low_boundary..self.high_boundary
    }
}

// ── Young generation ──────────────────────────────────────────────────

/// Eden plus two survivor spaces, laid out `[eden][survivor 0][survivor 1]`
/// from the low end of the committed memory. Committed memory grows
/// downwards from the top of the reservation, so the eden bottom is the
/// young generation's edge towards the old generation.
pub struct YoungGen {
    vs: VirtualSpace,
    eden: Space,
    survivors: [Space; 2],
    from: usize,
}

impl YoungGen {
    pub fn new(
        reserved: Range<Address>,
        committed: usize,
        survivor_ratio: usize,
        card_size: usize,
    ) -> Self {
        let vs = VirtualSpace {
            low_boundary: reserved.start,
            low: reserved.end - committed,
            high: reserved.end,
            high_boundary: reserved.end,
        };
        let survivor = (committed / (survivor_ratio + 2)) / card_size * card_size;
        let eden_end = vs.high - 2 * survivor;
        Self {
            vs,
            eden: Space::new("eden", vs.low, eden_end),
            survivors: [
                Space::new("survivor-0", eden_end, eden_end + survivor),
                Space::new("survivor-1", eden_end + survivor, vs.high),
            ],
            from: 0,
        }
    }

    pub fn virtual_space(&self) -> &VirtualSpace {
        &self.vs
    }

    pub fn eden(&self) -> &Space {
        &self.eden
    }

    pub fn from(&self) -> &Space {
        &self.survivors[self.from]
    }

    pub fn to(&self) -> &Space {
        &self.survivors[1 - self.from]
    }

    pub fn swap_spaces(&mut self) {
        self.from = 1 - self.from;
    }

    /// Eden and both survivors in address order.
    pub fn spaces(&self) -> [&Space; 3] {
        [&self.eden, &self.survivors[0], &self.survivors[1]]
    }

    /// The young/old split: every address at or above it belongs to the
    /// young generation.
    #[inline(always)]
    pub fn boundary(&self) -> Address {
        self.vs.low_boundary
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.vs.high_boundary
    }

    #[inline(always)]
    pub fn is_in_young(&self, addr: Address) -> bool {
        self.vs.low_boundary <= addr && addr < self.vs.high_boundary
    }

    pub fn used(&self) -> usize {
        self.spaces().iter().map(|s| s.used()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.vs.committed_size()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces().iter().all(|s| s.is_empty())
    }

    /// Hands the lowest `words` of the young generation to the generation
    /// below. Eden shrinks from the bottom and is left empty.
    pub fn shrink_from_bottom(&mut self, words: usize) {
        self.vs.low_boundary += words;
        self.vs.low += words;
        let eden_end = self.eden.end();
        self.eden.set_bounds(self.vs.low, eden_end);
        self.eden.set_top(self.vs.low);
    }
}

impl core::fmt::Debug for YoungGen {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("YoungGen")
            .field("vs", &self.vs)
            .field("eden", &self.eden)
            .field("from", self.from())
            .field("to", self.to())
            .finish()
    }
}

// ── Tenured generations ───────────────────────────────────────────────

/// A single-space generation (old or perm) with an object start array.
pub struct TenuredGen {
    kind: GenerationKind,
    vs: VirtualSpace,
    space: Space,
    start_array: ObjectStartArray,
}

impl TenuredGen {
    /// `start_array_end` may lie beyond the reservation when the generation
    /// can later grow into its neighbour.
    pub fn new(
        kind: GenerationKind,
        reserved: Range<Address>,
        committed: usize,
        start_array_end: Address,
    ) -> Self {
        let vs = VirtualSpace {
            low_boundary: reserved.start,
            low: reserved.start,
            high: reserved.start + committed,
            high_boundary: reserved.end,
        };
        let name = match kind {
            GenerationKind::Perm => "perm",
            _ => "old",
        };
        Self {
            kind,
            vs,
            space: Space::new(name, vs.low, vs.high),
            start_array: ObjectStartArray::new(reserved.start, start_array_end),
        }
    }

    pub fn kind(&self) -> GenerationKind {
        self.kind
    }

    pub fn virtual_space(&self) -> &VirtualSpace {
        &self.vs
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn start_array(&self) -> &ObjectStartArray {
        &self.start_array
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.vs.low_boundary <= addr && addr < self.vs.high_boundary
    }

    pub fn used(&self) -> usize {
        self.space.used()
    }

    pub fn capacity(&self) -> usize {
        self.space.capacity()
    }

    pub fn free(&self) -> usize {
        self.space.free()
    }

    /// Bump allocation that also records the object start. Safe to call from
    /// collector threads.
    pub fn par_allocate(&self, words: usize) -> Option<Address> {
        let obj = self.space.par_allocate(words)?;
        self.start_array.allocate_block(obj);
        Some(obj)
    }

    /// Commits enough memory for `words` more words. Returns false when the
    /// reservation is exhausted.
    pub fn expand(&mut self, words: usize, alignment: usize) -> bool {
        let new_high = (self.vs.high + align_up(words, alignment)).min(self.vs.high_boundary);
        if new_high - self.space.top() < words {
            return false;
        }
        log::debug!("{} expanded {} -> {} words", self.kind, self.vs.committed_size(), new_high - self.vs.low);
        self.vs.high = new_high;
        self.space.set_end(new_high);
        true
    }

    /// Commits or uncommits memory towards `desired` committed words, never
    /// below the used part of the space.
    pub fn resize(&mut self, desired: usize, alignment: usize) {
        let floor = align_up(self.space.top() - self.vs.low, alignment).max(alignment);
        let desired = align_up(desired, alignment)
            .max(floor)
            .min(self.vs.reserved_size());
        let new_high = self.vs.low + desired;
        if new_high != self.vs.high {
            log::debug!("{} resized {} -> {} words", self.kind, self.vs.committed_size(), desired);
            self.vs.high = new_high;
            self.space.set_end(new_high);
        }
    }

    /// Takes over `[high_boundary, high_boundary + words)` from `young`.
    pub fn expand_into(&mut self, young: &mut YoungGen, words: usize) {
        debug_assert_eq!(self.vs.high_boundary, young.boundary());
        debug_assert_eq!(self.vs.high, self.vs.high_boundary);
        young.shrink_from_bottom(words);
        self.vs.high_boundary += words;
        self.vs.high += words;
        self.space.set_end(self.vs.high);
    }
}

impl core::fmt::Debug for TenuredGen {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TenuredGen")
            .field("kind", &self.kind)
            .field("vs", &self.vs)
            .field("space", &self.space)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn young_layout_and_swap() {
        let mut young = YoungGen::new(1000..2000, 1000, 8, 10);
        assert_eq!(young.eden().bottom(), 1000);
        assert_eq!(young.from().capacity(), 100);
        assert_eq!(young.to().capacity(), 100);
        assert_eq!(young.eden().capacity(), 800);

        let from = young.from().bottom();
        young.swap_spaces();
        assert_eq!(young.to().bottom(), from);
        assert!(young.is_in_young(1000) && young.is_in_young(1999));
        assert!(!young.is_in_young(999) && !young.is_in_young(2000));
    }

    #[test]
    fn young_with_uncommitted_memory() {
        let young = YoungGen::new(1000..2000, 500, 3, 10);
        assert_eq!(young.virtual_space().uncommitted_size(), 500);
        assert_eq!(young.eden().bottom(), 1500);
        assert_eq!(young.boundary(), 1000);
    }

    #[test]
    fn old_expands_into_young() {
        let mut old = TenuredGen::new(GenerationKind::Old, 100..1000, 900, 2000);
        let mut young = YoungGen::new(1000..2000, 1000, 8, 10);
        old.expand_into(&mut young, 200);
        assert_eq!(old.space().end(), 1200);
        assert_eq!(young.boundary(), 1200);
        assert_eq!(young.eden().bottom(), 1200);
        assert!(young.eden().is_empty());
        assert!(old.contains(1100));
        assert!(!young.is_in_young(1100));
    }

    #[test]
    fn resize_never_drops_below_top() {
        let mut old = TenuredGen::new(GenerationKind::Old, 0..1000, 500, 1000);
        old.par_allocate(300).unwrap();
        old.resize(100, 50);
        assert_eq!(old.capacity(), 300);
        old.resize(2000, 50);
        assert_eq!(old.capacity(), 1000);
        assert!(old.expand(600, 50));
        assert!(!old.expand(800, 50));
    }
}
