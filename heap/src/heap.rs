//! The generational heap.
//!
//! Three generations share one word-addressed memory, laid out
//! `[reserved][perm][old][young]`. Mutators allocate into thread-local
//! buffers carved out of eden; when eden is exhausted the heap scavenges
//! the young generation, and when that is not enough it runs the
//! mark-sweep-compact full collector over all three generations.
//!
//! The heap does not own the mutator's roots. Every operation that may
//! collect takes a [`RootProvider`] and updates the roots it reports.

use std::{fmt, ops::Range, sync::Arc, time::Instant};

use ahash::RandomState;
use object::{
    ARRAY_HEADER_WORDS, ARRAY_LENGTH_OFFSET, Address, HEADER_WORDS, KLASS_WORDS, MAX_ARRAY_LENGTH,
    MIN_FILL_WORDS, MarkState, MarkWord, NEXT_OFFSET, ObjectKind, REFERENCE_WORDS, REFERENT_OFFSET, ReferenceType, Value,
};

use crate::{
    AdaptiveSizePolicy, CardTable, CollectionOutcome, CollectionSummary, CriticalSection, GcCause,
    GcLocker, GcOverheadLimit, GcStats, GenerationKind, HeapError, HeapMemory, HeapResult,
    HeapSettings, HeapUsage, OverheadSample, RootProvider, SizePolicy, SkipReason, TenuredGen,
    Universe, WorkGang, YoungGen, oop, references, universe::init_klass,
};

// ── Layout ────────────────────────────────────────────────────────────

/// Reserved word ranges of the three generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLayout {
    pub perm: Range<Address>,
    pub old: Range<Address>,
    pub young: Range<Address>,
}

impl HeapLayout {
    /// `[reserved][perm][old][young]`. The first alignment unit stays
    /// unused so that no object lives at address 0.
    pub fn from_settings(settings: &HeapSettings) -> Self {
        let base = settings.generation_alignment;
        let perm = base..base + settings.perm_size;
        let old = perm.end..perm.end + settings.old_size;
        let young = old.end..old.end + settings.young_size;
        Self { perm, old, young }
    }

    /// Checks that the generations are non-empty, ordered, disjoint, and
    /// start and end on card boundaries.
    pub fn validate(&self, card_size: usize) -> HeapResult<()> {
        if self.perm.is_empty() || self.old.is_empty() || self.young.is_empty() {
            return Err(HeapError::InvalidSettings("generation ranges must not be empty"));
        }
        if self.perm.start == 0 {
            return Err(HeapError::InvalidSettings("address 0 is reserved"));
        }
        if self.perm.end > self.old.start {
            return Err(HeapError::LayoutOutOfOrder {
                perm_end: self.perm.end,
                old_start: self.old.start,
            });
        }
        for (range, generation) in [
            (&self.perm, GenerationKind::Perm),
            (&self.old, GenerationKind::Old),
        ] {
            if self.young.start < range.end && range.start < self.young.end {
                return Err(HeapError::YoungOverlap {
                    start: self.young.start,
                    end: self.young.end,
                    generation,
                });
            }
        }
        for (range, generation) in [
            (&self.perm, GenerationKind::Perm),
            (&self.old, GenerationKind::Old),
            (&self.young, GenerationKind::Young),
        ] {
            for address in [range.start, range.end] {
                if !address.is_multiple_of(card_size) {
                    return Err(HeapError::UnalignedBoundary {
                        address,
                        generation,
                        card_size,
                    });
                }
            }
        }
        Ok(())
    }

    /// One past the highest reserved word.
    pub fn end(&self) -> Address {
        self.perm.end.max(self.old.end).max(self.young.end)
    }
}

// ── Thread-local allocation buffer ────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct Tlab {
    top: Address,
    end: Address,
}

impl Tlab {
    /// Never leaves a one-word tail, which no filler object could cover.
    #[inline(always)]
    fn allocate(&mut self, words: usize) -> Option<Address> {
        let free = self.end - self.top;
        let rest = free.checked_sub(words)?;
        if rest != 0 && rest < MIN_FILL_WORDS {
            return None;
        }
        let obj = self.top;
        self.top += words;
        Some(obj)
    }
}

// ── Fatal errors ──────────────────────────────────────────────────────

/// Borrowed view of the generations, printed when the heap gives up.
#[derive(Clone, Copy)]
pub(crate) struct HeapDump<'h> {
    pub perm: &'h TenuredGen,
    pub old: &'h TenuredGen,
    pub young: &'h YoungGen,
}

impl fmt::Display for HeapDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for generation in [self.perm, self.old] {
            let vs = generation.virtual_space();
            let space = generation.space();
            writeln!(
                f,
                " {:<5} reserved [{:#x}, {:#x}) committed [{:#x}, {:#x}) top {:#x} used {}/{}",
                generation.kind(),
                vs.low_boundary,
                vs.high_boundary,
                vs.low,
                vs.high,
                space.top(),
                space.used(),
                space.capacity(),
            )?;
        }
        let vs = self.young.virtual_space();
        writeln!(
            f,
            " young reserved [{:#x}, {:#x}) committed [{:#x}, {:#x}) used {}/{}",
            vs.low_boundary,
            vs.high_boundary,
            vs.low,
            vs.high,
            self.young.used(),
            self.young.capacity(),
        )?;
        for (space, role) in [
            (self.young.eden(), "eden"),
            (self.young.from(), "from"),
            (self.young.to(), "to"),
        ] {
            writeln!(
                f,
                "   {role:<4} [{:#x}, {:#x}) top {:#x} used {}",
                space.bottom(),
                space.end(),
                space.top(),
                space.used(),
            )?;
        }
        Ok(())
    }
}

/// Logs the heap state and aborts the collection. Used for broken
/// invariants that leave the heap unusable.
#[cold]
pub(crate) fn fatal_error(dump: HeapDump<'_>, msg: fmt::Arguments<'_>) -> ! {
    log::error!("fatal heap error: {msg}");
    log::error!("heap at failure:\n{dump}");
    panic!("fatal heap error: {msg}");
}

// ── Collection requests ───────────────────────────────────────────────

/// A collection request, stamped with the collection count it was issued
/// at. Executing a request after another collection already ran is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRequest {
    pub cause: GcCause,
    gc_count_before: usize,
}

// ── Heap ──────────────────────────────────────────────────────────────

pub struct Heap {
    pub(crate) settings: HeapSettings,
    layout: HeapLayout,
    pub(crate) memory: HeapMemory,
    pub(crate) perm: TenuredGen,
    pub(crate) old: TenuredGen,
    pub(crate) young: YoungGen,
    pub(crate) card_table: CardTable,
    pub(crate) universe: Universe,
    tlab: Tlab,
    pub(crate) gc_locker: Arc<GcLocker>,
    pub(crate) size_policy: Box<dyn SizePolicy>,
    pub(crate) gang: WorkGang,
    pub(crate) stats: GcStats,
    pub(crate) tenuring_threshold: u8,
    /// End of the previous collection, for the mutator share of wall-clock time.
    last_gc_end: Instant,
    /// Set by a full collection that hit the GC overhead limit.
    gc_overhead_limit_exceeded: bool,
    hash_state: RandomState,
    hash_seq: u64,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> HeapResult<Self> {
        let layout = HeapLayout::from_settings(&settings);
        Self::with_layout(settings, layout)
    }

    pub fn with_layout(settings: HeapSettings, layout: HeapLayout) -> HeapResult<Self> {
        settings.validate()?;
        layout.validate(settings.card_size)?;

        let young_committed = settings.young_initial_size.min(layout.young.len());
        if young_committed / (settings.survivor_ratio + 2) < settings.card_size {
            return Err(HeapError::InvalidSettings(
                "young generation too small for its survivor spaces",
            ));
        }

        let memory = HeapMemory::new(layout.end());
        // Old can only grow into young when the two are adjacent.
        let old_start_array_end = if layout.young.start == layout.old.end {
            layout.young.end
        } else {
            layout.old.end
        };
        let perm = TenuredGen::new(
            GenerationKind::Perm,
            layout.perm.clone(),
            layout.perm.len(),
            layout.perm.end,
        );
        let old = TenuredGen::new(
            GenerationKind::Old,
            layout.old.clone(),
            settings.old_initial_size.min(layout.old.len()),
            old_start_array_end,
        );
        let young = YoungGen::new(
            layout.young.clone(),
            young_committed,
            settings.survivor_ratio,
            settings.card_size,
        );
        let card_table = CardTable::new(memory.len(), settings.card_size);
        let universe = Universe::bootstrap(&memory, &perm)?;

        log::info!(
            "heap initialized: perm [{:#x}, {:#x}) old [{:#x}, {:#x}) young [{:#x}, {:#x}), {} gc threads",
            layout.perm.start,
            layout.perm.end,
            layout.old.start,
            layout.old.end,
            layout.young.start,
            layout.young.end,
            settings.parallel_gc_threads,
        );

        Ok(Self {
            size_policy: Box::new(
                AdaptiveSizePolicy::new(settings.max_tenuring_threshold)
                    .with_gc_overhead_limit(GcOverheadLimit::from_settings(&settings)),
            ),
            gang: WorkGang::new(settings.parallel_gc_threads),
            tenuring_threshold: settings.initial_tenuring_threshold,
            settings,
            layout,
            memory,
            perm,
            old,
            young,
            card_table,
            universe,
            tlab: Tlab::default(),
            gc_locker: Arc::new(GcLocker::new()),
            stats: GcStats::default(),
            last_gc_end: Instant::now(),
            gc_overhead_limit_exceeded: false,
            hash_state: RandomState::new(),
            hash_seq: 0,
        })
    }

    pub fn set_size_policy(&mut self, policy: Box<dyn SizePolicy>) {
        self.size_policy = policy;
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn memory(&self) -> &HeapMemory {
        &self.memory
    }

    pub fn perm(&self) -> &TenuredGen {
        &self.perm
    }

    pub fn old(&self) -> &TenuredGen {
        &self.old
    }

    pub fn young(&self) -> &YoungGen {
        &self.young
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn tenuring_threshold(&self) -> u8 {
        self.tenuring_threshold
    }

    pub fn usage(&self) -> HeapUsage {
        HeapUsage {
            young_used: self.young.used(),
            young_capacity: self.young.capacity(),
            old_used: self.old.used(),
            old_capacity: self.old.capacity(),
            perm_used: self.perm.used(),
            perm_capacity: self.perm.capacity(),
        }
    }

    pub fn generation_of(&self, value: Value) -> Option<GenerationKind> {
        if !value.is_heap_ref() {
            return None;
        }
        let addr = value.address();
        if self.young.is_in_young(addr) {
            Some(GenerationKind::Young)
        } else if self.old.contains(addr) {
            Some(GenerationKind::Old)
        } else if self.perm.contains(addr) {
            Some(GenerationKind::Perm)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_in_young(&self, value: Value) -> bool {
        value.is_heap_ref() && self.young.is_in_young(value.address())
    }

    pub(crate) fn dump(&self) -> HeapDump<'_> {
        HeapDump {
            perm: &self.perm,
            old: &self.old,
            young: &self.young,
        }
    }

    /// Logs a heap dump and panics.
    #[cold]
    pub fn fatal(&self, msg: impl fmt::Display) -> ! {
        fatal_error(self.dump(), format_args!("{msg}"))
    }

    // ── Klasses ───────────────────────────────────────────────────────

    /// Defines a klass in the perm generation. `instance_words` is the full
    /// object size for instance and reference klasses and ignored otherwise.
    pub fn define_klass(
        &mut self,
        kind: ObjectKind,
        instance_words: usize,
        super_klass: Value,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Value> {
        let min_words = match kind {
            ObjectKind::Instance => HEADER_WORDS,
            ObjectKind::Reference(_) => REFERENCE_WORDS,
            _ => 0,
        };
        if instance_words < min_words {
            return Err(HeapError::InvalidInstanceSize {
                words: instance_words,
                kind,
            });
        }
        if !super_klass.is_null() {
            self.check_klass(super_klass)?;
        }
        let mut keep = [super_klass];
        let addr = self.allocate_perm(KLASS_WORDS, &mut keep, roots)?;
        let id = self.universe.next_klass_id();
        init_klass(
            &self.memory,
            addr,
            self.universe.klass_klass,
            kind,
            instance_words.max(min_words),
            id,
            keep[0],
        );
        log::trace!("defined klass {id} ({kind:?}) at {addr:#x}");
        Ok(Value::from_address(addr))
    }

    fn check_klass(&self, klass: Value) -> HeapResult<ObjectKind> {
        if !klass.is_heap_ref()
            || !self.perm.space().is_in_used(klass.address())
            || self.memory.klass(klass.address()) != self.universe.klass_klass
        {
            return Err(HeapError::InvalidKlass(klass.raw()));
        }
        Ok(oop::klass_kind(&self.memory, klass))
    }

    pub fn klass_of(&self, obj: Value) -> Value {
        self.memory.klass(obj.address())
    }

    pub fn kind_of(&self, obj: Value) -> ObjectKind {
        oop::describe(&self.memory, obj.address()).kind
    }

    pub fn object_size(&self, obj: Value) -> usize {
        oop::object_size(&self.memory, obj.address())
    }

    // ── Allocation ────────────────────────────────────────────────────

    pub fn allocate_instance(
        &mut self,
        klass: Value,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Value> {
        if self.check_klass(klass)? != ObjectKind::Instance {
            return Err(HeapError::InvalidKlass(klass.raw()));
        }
        let words = oop::klass_instance_words(&self.memory, klass);
        let mut keep = [klass];
        let obj = self.allocate_young(words, &mut keep, roots)?;
        self.init_object(obj, keep[0], words, HEADER_WORDS);
        Ok(Value::from_address(obj))
    }

    /// Allocates an instance directly in the old generation.
    pub fn allocate_tenured(
        &mut self,
        klass: Value,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Value> {
        if self.check_klass(klass)? != ObjectKind::Instance {
            return Err(HeapError::InvalidKlass(klass.raw()));
        }
        let words = oop::klass_instance_words(&self.memory, klass);
        let mut keep = [klass];
        let obj = self.allocate_old(words, &mut keep, roots)?;
        self.init_object(obj, keep[0], words, HEADER_WORDS);
        Ok(Value::from_address(obj))
    }

    pub fn allocate_array(
        &mut self,
        klass: Value,
        length: usize,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Value> {
        let kind = self.check_klass(klass)?;
        if !kind.is_array() {
            return Err(HeapError::InvalidKlass(klass.raw()));
        }
        let words = length
            .checked_add(ARRAY_HEADER_WORDS)
            .filter(|&words| length <= MAX_ARRAY_LENGTH && words <= self.memory.len());
        let Some(words) = words else {
            log::warn!("array of {length} elements can never fit the heap");
            return Err(HeapError::OutOfMemory {
                words: length.saturating_add(ARRAY_HEADER_WORDS),
                generation: GenerationKind::Young,
            });
        };
        let mut keep = [klass];
        let obj = self.allocate_young(words, &mut keep, roots)?;
        self.memory
            .store_value(obj + ARRAY_LENGTH_OFFSET, Value::from_i64(length as i64));
        self.init_object(obj, keep[0], words, ARRAY_LENGTH_OFFSET + 1);
        Ok(Value::from_address(obj))
    }

    pub fn allocate_ref_array(
        &mut self,
        length: usize,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Value> {
        let klass = self.universe.object_array_klass;
        self.allocate_array(klass, length, roots)
    }

    pub fn allocate_word_array(
        &mut self,
        length: usize,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Value> {
        let klass = self.universe.word_array_klass;
        self.allocate_array(klass, length, roots)
    }

    /// Allocates a soft, weak or final reference to `referent`.
    pub fn allocate_reference(
        &mut self,
        ty: ReferenceType,
        referent: Value,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Value> {
        let klass = self.universe.reference_klass(ty);
        let words = oop::klass_instance_words(&self.memory, klass);
        let mut keep = [klass, referent];
        let obj = self.allocate_young(words, &mut keep, roots)?;
        self.init_object(obj, keep[0], words, HEADER_WORDS);
        self.memory.store_value(obj + REFERENT_OFFSET, keep[1]);
        Ok(Value::from_address(obj))
    }

    /// Header plus null fields from `fields_from` on. Word array payloads
    /// become zero words.
    fn init_object(&self, obj: Address, klass: Value, words: usize, fields_from: usize) {
        self.memory.set_mark(obj, MarkWord::prototype());
        self.memory.set_klass(obj, klass);
        let fill = match oop::klass_kind(&self.memory, klass) {
            ObjectKind::WordArray => 0,
            _ => Value::NULL.raw(),
        };
        if words > fields_from {
            self.memory.fill(obj + fields_from, words - fields_from, fill);
        }
    }

    /// Registers `keep` as handles while `f` runs, so collections inside
    /// `f` update them.
    fn with_handles<T>(&mut self, keep: &mut [Value], f: impl FnOnce(&mut Self) -> T) -> T {
        for value in keep.iter() {
            self.universe.push_handle(*value);
        }
        let result = f(self);
        for value in keep.iter_mut().rev() {
            if let Some(updated) = self.universe.pop_handle() {
                *value = updated;
            }
        }
        result
    }

    fn young_fast_allocate(&mut self, words: usize) -> Option<Address> {
        if let Some(obj) = self.tlab.allocate(words) {
            return Some(obj);
        }
        if words * 2 > self.settings.tlab_size {
            return self.young.eden().par_allocate(words);
        }
        self.retire_tlab();
        let chunk = self.settings.tlab_size.max(MIN_FILL_WORDS);
        match self.young.eden().par_allocate(chunk) {
            Some(start) => {
                self.tlab = Tlab {
                    top: start,
                    end: start + chunk,
                };
                self.tlab.allocate(words)
            }
            None => self.young.eden().par_allocate(words),
        }
    }

    /// The unparsable, not yet allocated part of the current TLAB.
    pub(crate) fn tlab_unused(&self) -> Range<Address> {
        self.tlab.top..self.tlab.end
    }

    /// Plugs the unused tail of the TLAB so eden stays parsable.
    pub(crate) fn retire_tlab(&mut self) {
        if self.tlab.top < self.tlab.end {
            oop::fill_with_object(
                &self.memory,
                self.universe.fillers,
                self.tlab.top,
                self.tlab.end - self.tlab.top,
            );
        }
        self.tlab = Tlab::default();
    }

    fn old_allocate_expanding(&mut self, words: usize) -> Option<Address> {
        self.old.par_allocate(words).or_else(|| {
            if self.old.expand(words, self.settings.generation_alignment) {
                self.old.par_allocate(words)
            } else {
                None
            }
        })
    }

    fn young_or_old_allocate(&mut self, words: usize) -> Option<Address> {
        if words >= self.young.eden().capacity() {
            return self.old_allocate_expanding(words);
        }
        self.young_fast_allocate(words)
            .or_else(|| self.old_allocate_expanding(words))
    }

    fn allocate_young(
        &mut self,
        words: usize,
        keep: &mut [Value],
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Address> {
        if words < self.young.eden().capacity() {
            if let Some(obj) = self.young_fast_allocate(words) {
                return Ok(obj);
            }
        }
        self.with_handles(keep, |heap| heap.failed_young_allocate(words, roots))
    }

    /// Scavenge, then full collection, then full collection clearing soft
    /// references with maximum compaction.
    #[cold]
    fn failed_young_allocate(
        &mut self,
        words: usize,
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Address> {
        self.gc_overhead_limit_exceeded = false;
        let outcome = self.scavenge_with_policy(GcCause::AllocationFailure, roots);
        self.check_gc_overhead_limit(words, GenerationKind::Young)?;
        if let Some(obj) = self.young_or_old_allocate(words) {
            return Ok(obj);
        }
        if outcome == CollectionOutcome::Skipped(SkipReason::GcLockerActive) {
            return Err(HeapError::GcLockerActive);
        }

        for (clear_all, maximum_compaction) in [(false, false), (true, true)] {
            self.mark_sweep_no_policy(GcCause::AllocationFailure, clear_all, maximum_compaction, roots);
            self.check_gc_overhead_limit(words, GenerationKind::Young)?;
            if let Some(obj) = self.young_or_old_allocate(words) {
                return Ok(obj);
            }
        }
        log::warn!("out of memory allocating {words} words");
        Err(HeapError::OutOfMemory {
            words,
            generation: GenerationKind::Young,
        })
    }

    fn allocate_old(
        &mut self,
        words: usize,
        keep: &mut [Value],
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Address> {
        if let Some(obj) = self.old_allocate_expanding(words) {
            return Ok(obj);
        }
        self.with_handles(keep, |heap| {
            heap.gc_overhead_limit_exceeded = false;
            for (clear_all, maximum_compaction) in [(false, false), (true, true)] {
                let outcome = heap.mark_sweep_invoke(
                    GcCause::AllocationFailure,
                    clear_all,
                    maximum_compaction,
                    roots,
                );
                heap.check_gc_overhead_limit(words, GenerationKind::Old)?;
                if let Some(obj) = heap.old_allocate_expanding(words) {
                    return Ok(obj);
                }
                if outcome.is_skipped() {
                    return Err(HeapError::GcLockerActive);
                }
            }
            log::warn!("out of memory allocating {words} words in the old generation");
            Err(HeapError::OutOfMemory {
                words,
                generation: GenerationKind::Old,
            })
        })
    }

    fn allocate_perm(
        &mut self,
        words: usize,
        keep: &mut [Value],
        roots: &mut dyn RootProvider,
    ) -> HeapResult<Address> {
        if let Some(obj) = self.perm.par_allocate(words) {
            return Ok(obj);
        }
        self.with_handles(keep, |heap| {
            for (clear_all, maximum_compaction) in [(false, false), (true, true)] {
                let outcome = heap.mark_sweep_no_policy(
                    GcCause::PermAllocationFailure,
                    clear_all,
                    maximum_compaction,
                    roots,
                );
                if let Some(obj) = heap.perm.par_allocate(words) {
                    return Ok(obj);
                }
                if outcome.is_skipped() {
                    return Err(HeapError::GcLockerActive);
                }
            }
            Err(HeapError::OutOfMemory {
                words,
                generation: GenerationKind::Perm,
            })
        })
    }

    // ── Field access ──────────────────────────────────────────────────

    /// Reads the word at `offset` words from the start of `obj`.
    #[inline]
    pub fn load_field(&self, obj: Value, offset: usize) -> Value {
        debug_assert!(offset >= HEADER_WORDS && offset < self.object_size(obj));
        self.memory.load_value(obj.address() + offset)
    }

    /// Stores `value` at `offset` words from the start of `obj` and dirties
    /// the card when an old or perm slot now refers into young.
    #[inline]
    pub fn store_field(&self, obj: Value, offset: usize, value: Value) {
        debug_assert!(offset >= HEADER_WORDS && offset < self.object_size(obj));
        let slot = obj.address() + offset;
        self.memory.store_value(slot, value);
        self.post_write_barrier(slot, value);
    }

    #[inline(always)]
    fn post_write_barrier(&self, slot: Address, value: Value) {
        if !self.young.is_in_young(slot) && self.is_in_young(value) {
            self.card_table.mark(slot);
        }
    }

    pub fn array_length(&self, array: Value) -> usize {
        oop::array_length(&self.memory, array.address())
    }

    pub fn array_load(&self, array: Value, index: usize) -> Value {
        debug_assert!(index < self.array_length(array));
        self.memory
            .load_value(array.address() + object::ARRAY_HEADER_WORDS + index)
    }

    pub fn array_store(&self, array: Value, index: usize, value: Value) {
        debug_assert!(index < self.array_length(array));
        let slot = array.address() + object::ARRAY_HEADER_WORDS + index;
        self.memory.store_value(slot, value);
        if self.kind_of(array) == ObjectKind::RefArray {
            self.post_write_barrier(slot, value);
        }
    }

    pub fn referent(&self, reference: Value) -> Value {
        self.memory.load_value(reference.address() + REFERENT_OFFSET)
    }

    /// Whether the collector has enqueued `reference`.
    pub fn is_enqueued(&self, reference: Value) -> bool {
        !self
            .memory
            .load_value(reference.address() + NEXT_OFFSET)
            .is_null()
    }

    /// Takes every reference the collector cleared or found finalizable.
    pub fn drain_pending_references(&mut self) -> Vec<Value> {
        references::drain_pending(&self.memory, &mut self.universe.pending_list)
    }

    // ── Header state ──────────────────────────────────────────────────

    /// Returns the identity hash of `obj`, assigning one on first use.
    /// Locked objects keep their hash with the lock owner and report none.
    pub fn identity_hash(&mut self, obj: Value) -> Option<u32> {
        let addr = obj.address();
        let mark = self.memory.mark(addr);
        let age = match mark.state() {
            MarkState::Unlocked { hash, .. } if hash != 0 => return Some(hash),
            MarkState::Unlocked { age, .. } | MarkState::Biased { age, .. } => age,
            MarkState::Locked { .. } => return None,
            state => self.fatal(format_args!("identity hash of {addr:#x} in {state:?}")),
        };
        self.hash_seq += 1;
        let hash = (self.hash_state.hash_one(self.hash_seq) as u32).max(1);
        self.memory.set_mark(addr, MarkWord::unlocked(hash, age));
        Some(hash)
    }

    /// Biases an unhashed, unlocked object towards `thread`.
    pub fn bias(&self, obj: Value, thread: u32) -> bool {
        let addr = obj.address();
        match self.memory.mark(addr).state() {
            MarkState::Unlocked { hash: 0, age } => {
                self.memory.set_mark(addr, MarkWord::biased(thread, age));
                true
            }
            _ => false,
        }
    }

    /// Locks `obj` for `owner` and returns the displaced mark word, which
    /// must be handed back to [`unlock`](Heap::unlock).
    pub fn lock(&self, obj: Value, owner: u32) -> MarkWord {
        let addr = obj.address();
        let displaced = self.memory.mark(addr);
        self.memory.set_mark(addr, MarkWord::locked(owner, displaced.age()));
        displaced
    }

    pub fn unlock(&self, obj: Value, displaced: MarkWord) {
        self.memory.set_mark(obj.address(), displaced);
    }

    pub fn mark_of(&self, obj: Value) -> MarkWord {
        self.memory.mark(obj.address())
    }

    // ── Critical sections ─────────────────────────────────────────────

    /// Blocks collections until the returned guard is dropped.
    pub fn critical_section(&self) -> CriticalSection {
        self.gc_locker.enter()
    }

    pub fn gc_locker(&self) -> &Arc<GcLocker> {
        &self.gc_locker
    }

    // ── Collection entry points ───────────────────────────────────────

    /// Stamps a request with the current collection count.
    pub fn request(&self, cause: GcCause) -> GcRequest {
        GcRequest {
            cause,
            gc_count_before: self.stats.total_collections,
        }
    }

    /// Runs a requested collection unless another one ran since the request
    /// was issued. Allocation failures and GC locker requests scavenge;
    /// everything else runs a full collection.
    pub fn collect(&mut self, request: GcRequest, roots: &mut dyn RootProvider) -> CollectionOutcome {
        if request.gc_count_before != self.stats.total_collections {
            log::debug!("skipping stale {} request", request.cause);
            self.stats.skipped += 1;
            return CollectionOutcome::Skipped(SkipReason::Stale);
        }
        match request.cause {
            GcCause::AllocationFailure | GcCause::GcLocker => {
                let outcome = self.scavenge_with_policy(request.cause, roots);
                if !outcome.is_skipped() {
                    self.gc_locker.clear_needs_gc();
                }
                outcome
            }
            GcCause::SystemGc | GcCause::PermAllocationFailure | GcCause::PromotionFailure => {
                self.mark_sweep_invoke(request.cause, false, false, roots)
            }
        }
    }

    /// Scavenges the young generation. Falls back to a full collection when
    /// the scavenge cannot run or fails to promote every survivor.
    pub fn scavenge(&mut self, roots: &mut dyn RootProvider) -> CollectionOutcome {
        self.scavenge_with_policy(GcCause::AllocationFailure, roots)
    }

    /// Full collection of every generation, preceded by a scavenge when
    /// `scavenge_before_full_gc` is set.
    pub fn collect_full(
        &mut self,
        clear_all_soft_refs: bool,
        maximum_compaction: bool,
        roots: &mut dyn RootProvider,
    ) -> CollectionOutcome {
        self.mark_sweep_invoke(GcCause::SystemGc, clear_all_soft_refs, maximum_compaction, roots)
    }

    pub(crate) fn scavenge_with_policy(
        &mut self,
        cause: GcCause,
        roots: &mut dyn RootProvider,
    ) -> CollectionOutcome {
        match self.scavenge_no_policy(cause, roots) {
            None => {
                log::debug!("scavenge not attempted, collecting the whole heap");
                self.mark_sweep_no_policy(cause, false, false, roots)
            }
            Some(CollectionOutcome::Completed(summary)) if summary.promotion_failed => {
                self.mark_sweep_no_policy(GcCause::PromotionFailure, false, false, roots)
            }
            Some(CollectionOutcome::Completed(summary))
                if self
                    .size_policy
                    .should_full_gc(self.old.free(), self.young.used()) =>
            {
                log::debug!("old generation may not take the next promotions, collecting the whole heap");
                let full = self.mark_sweep_no_policy(cause, false, false, roots);
                if full.is_skipped() {
                    CollectionOutcome::Completed(summary)
                } else {
                    full
                }
            }
            Some(outcome) => outcome,
        }
    }

    /// Books a finished collection: statistics, and the pause and mutator
    /// time for the size policy.
    pub(crate) fn record_collection(&mut self, summary: &CollectionSummary, start: Instant) {
        let mutator = start.saturating_duration_since(self.last_gc_end);
        self.size_policy.record_gc_cost(summary.duration, mutator);
        self.last_gc_end = Instant::now();
        self.stats.record(summary.clone());
    }

    /// Feeds what a full collection left free, and what it reclaimed, to
    /// the overhead limit.
    pub(crate) fn update_gc_overhead_limit(&mut self, summary: &CollectionSummary) {
        let percent = |part: usize, total: usize| if total == 0 { 0 } else { part * 100 / total };
        let old_reserved = self.old.virtual_space().reserved_size();
        let eden = self.young.eden();
        let used = |usage: &HeapUsage| usage.young_used + usage.old_used;
        let sample = OverheadSample {
            old_free: percent(old_reserved.saturating_sub(self.old.used()), old_reserved),
            eden_free: percent(eden.free(), eden.capacity()),
            reclaimed: percent(
                used(&summary.before).saturating_sub(used(&summary.after)),
                old_reserved + self.young.capacity(),
            ),
        };
        if self.size_policy.check_gc_overhead_limit(sample) {
            self.gc_overhead_limit_exceeded = true;
        }
    }

    /// Fails an allocation once full collections stopped paying off.
    fn check_gc_overhead_limit(&mut self, words: usize, generation: GenerationKind) -> HeapResult<()> {
        if std::mem::take(&mut self.gc_overhead_limit_exceeded) {
            log::warn!("GC overhead limit exceeded allocating {words} words");
            return Err(HeapError::GcOverheadLimitExceeded { words, generation });
        }
        Ok(())
    }

    /// Makes every space parsable before a collection walks it.
    pub(crate) fn ensure_parsability(&mut self) {
        self.retire_tlab();
    }

    pub(crate) fn verify_or_die(&self, when: &str) {
        if let Err(err) = self.verify() {
            self.fatal(format_args!("verification {when} failed: {err}"));
        }
    }
}

impl fmt::Display for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "heap: {}", self.usage())?;
        write!(f, "{}", self.dump())?;
        write!(f, " {}", self.stats)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("layout", &self.layout)
            .field("perm", &self.perm)
            .field("old", &self.old)
            .field("young", &self.young)
            .field("tenuring_threshold", &self.tenuring_threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use object::{MarkState, ObjectKind, Value};

    use super::*;
    use crate::testing::{self, LEFT, RIGHT, TestRoots};

    #[test]
    fn layout_is_contiguous_above_reserved_word() {
        let settings = testing::settings();
        let layout = HeapLayout::from_settings(&settings);
        assert_eq!(layout.perm.start, settings.generation_alignment);
        assert_eq!(layout.perm.end, layout.old.start);
        assert_eq!(layout.old.end, layout.young.start);
        assert_eq!(layout.end(), layout.young.end);
        layout.validate(settings.card_size).unwrap();
    }

    #[test]
    fn rejects_bad_layouts() {
        let settings = testing::settings();
        let good = HeapLayout::from_settings(&settings);

        let overlap = HeapLayout {
            young: good.old.start + 512..good.old.start + 512 + settings.young_size,
            ..good.clone()
        };
        assert!(matches!(
            Heap::with_layout(settings.clone(), overlap),
            Err(HeapError::YoungOverlap {
                generation: GenerationKind::Old,
                ..
            })
        ));

        let swapped = HeapLayout {
            perm: good.old.clone(),
            old: good.perm.clone(),
            young: good.young.clone(),
        };
        assert!(matches!(
            swapped.validate(settings.card_size),
            Err(HeapError::LayoutOutOfOrder { .. })
        ));

        let at_zero = HeapLayout {
            perm: 0..good.perm.len(),
            ..good.clone()
        };
        assert!(matches!(
            at_zero.validate(settings.card_size),
            Err(HeapError::InvalidSettings(_))
        ));
    }

    #[test]
    fn generations_must_not_share_a_card() {
        let settings = testing::settings();
        let good = HeapLayout::from_settings(&settings);
        let half_card = settings.card_size / 2;

        let short_perm = HeapLayout {
            perm: good.perm.start..good.perm.end - half_card,
            ..good.clone()
        };
        assert!(matches!(
            short_perm.validate(settings.card_size),
            Err(HeapError::UnalignedBoundary {
                generation: GenerationKind::Perm,
                ..
            })
        ));

        let shifted_old = HeapLayout {
            old: good.old.start + half_card..good.old.end,
            ..good.clone()
        };
        assert!(matches!(
            Heap::with_layout(settings.clone(), shifted_old),
            Err(HeapError::UnalignedBoundary {
                generation: GenerationKind::Old,
                ..
            })
        ));

        let shifted_young = HeapLayout {
            young: good.young.start + half_card..good.young.end + half_card,
            ..good
        };
        let err = shifted_young.validate(settings.card_size).unwrap_err();
        assert!(err.to_string().contains("not aligned"), "{err}");
    }

    #[test]
    fn young_may_sit_apart_from_old() {
        testing::init_logging();
        let settings = testing::settings();
        let good = HeapLayout::from_settings(&settings);
        let gap = 1_024;
        let layout = HeapLayout {
            young: good.young.start + gap..good.young.end + gap,
            ..good
        };
        let mut heap = Heap::with_layout(settings, layout).unwrap();
        let node = testing::node_klass(&mut heap);
        let obj = heap.allocate_instance(node, &mut Vec::new()).unwrap();
        assert!(heap.is_in_young(obj));
        assert_eq!(heap.generation_of(obj), Some(GenerationKind::Young));
    }

    #[test]
    fn allocation_places_objects_by_generation() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();

        let young = heap.allocate_instance(node, &mut roots).unwrap();
        let old = heap.allocate_tenured(node, &mut roots).unwrap();
        let array = heap.allocate_ref_array(10, &mut roots).unwrap();

        assert_eq!(heap.generation_of(young), Some(GenerationKind::Young));
        assert_eq!(heap.generation_of(old), Some(GenerationKind::Old));
        assert_eq!(heap.generation_of(node), Some(GenerationKind::Perm));
        assert_eq!(heap.generation_of(Value::from_i64(3)), None);
        assert_eq!(heap.kind_of(array), ObjectKind::RefArray);
        assert_eq!(heap.array_length(array), 10);
        assert!(heap.array_load(array, 9).is_null());
        assert!(heap.load_field(young, LEFT).is_null());
        assert_eq!(heap.object_size(young), 4);
    }

    #[test]
    fn klass_definition_is_checked() {
        let mut heap = testing::heap();
        let err = heap
            .define_klass(ObjectKind::Instance, 1, Value::NULL, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, HeapError::InvalidInstanceSize { words: 1, .. }));

        let node = testing::node_klass(&mut heap);
        let obj = heap.allocate_instance(node, &mut Vec::new()).unwrap();
        assert!(matches!(
            heap.allocate_instance(obj, &mut Vec::new()),
            Err(HeapError::InvalidKlass(_))
        ));
        assert!(matches!(
            heap.allocate_array(node, 3, &mut Vec::new()),
            Err(HeapError::InvalidKlass(_))
        ));
    }

    #[test]
    fn barrier_dirties_only_old_to_young_stores() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let old = heap.allocate_tenured(node, &mut roots).unwrap();
        let other_old = heap.allocate_tenured(node, &mut roots).unwrap();
        let young = heap.allocate_instance(node, &mut roots).unwrap();
        let other_young = heap.allocate_instance(node, &mut roots).unwrap();

        heap.store_field(old, LEFT, other_old);
        assert!(!heap.card_table().is_dirty(old.address() + LEFT));
        heap.store_field(young, LEFT, other_young);
        assert!(!heap.card_table().is_dirty(young.address() + LEFT));
        heap.store_field(old, RIGHT, young);
        assert!(heap.card_table().is_dirty(old.address() + RIGHT));
        heap.verify().unwrap();
    }

    #[test]
    fn identity_hash_is_stable_and_skips_locked_objects() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let obj = heap.allocate_instance(node, &mut Vec::new()).unwrap();
        let hash = heap.identity_hash(obj).unwrap();
        assert_ne!(hash, 0);
        assert_eq!(heap.identity_hash(obj), Some(hash));
        assert!(!heap.bias(obj, 3));

        let other = heap.allocate_instance(node, &mut Vec::new()).unwrap();
        assert!(heap.bias(other, 3));
        let displaced = heap.lock(other, 9);
        assert!(matches!(heap.mark_of(other).state(), MarkState::Locked { owner: 9, .. }));
        assert_eq!(heap.identity_hash(other), None);
        heap.unlock(other, displaced);
        assert!(matches!(heap.mark_of(other).state(), MarkState::Biased { thread: 3, .. }));
    }

    #[test]
    fn critical_section_defers_collections() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        let node = testing::node_klass(&mut heap);
        heap.allocate_instance(node, &mut roots).unwrap();
        let usage = heap.usage();
        let guard = heap.critical_section();
        let request = heap.request(GcCause::SystemGc);
        assert_eq!(
            heap.collect(request, &mut roots),
            CollectionOutcome::Skipped(SkipReason::GcLockerActive)
        );
        assert_eq!(
            heap.scavenge(&mut roots),
            CollectionOutcome::Skipped(SkipReason::GcLockerActive)
        );
        assert!(heap.gc_locker().needs_gc());
        assert_eq!(heap.stats().skipped, 2);
        assert_eq!(heap.stats().total_collections, 0);
        assert_eq!(heap.usage(), usage);
        drop(guard);

        let request = heap.request(GcCause::GcLocker);
        let outcome = heap.collect(request, &mut roots);
        assert!(outcome.completed().is_some());
        assert!(!heap.gc_locker().needs_gc());
    }

    #[test]
    fn stale_requests_are_dropped() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        let request = heap.request(GcCause::SystemGc);
        heap.scavenge(&mut roots);
        assert_eq!(
            heap.collect(request, &mut roots),
            CollectionOutcome::Skipped(SkipReason::Stale)
        );
        assert_eq!(heap.stats().total_collections, 1);
        assert_eq!(heap.stats().skipped, 1);
    }

    #[test]
    fn allocation_failure_scavenges_and_keeps_roots() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let keep = heap.allocate_instance(node, &mut roots).unwrap();
        heap.store_field(keep, LEFT, Value::from_i64(42));
        roots.strong.push(keep);

        for _ in 0..5_000 {
            heap.allocate_instance(node, &mut roots).unwrap();
        }
        assert!(heap.stats().scavenges >= 3, "{}", heap.stats());
        let keep = roots.strong[0];
        assert_eq!(heap.load_field(keep, LEFT), Value::from_i64(42));
    }

    #[test]
    fn out_of_memory_when_everything_is_live() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let err = loop {
            match heap.allocate_instance(node, &mut roots) {
                Ok(obj) => roots.strong.push(obj),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, HeapError::OutOfMemory { words: 4, .. }), "{err}");
        assert!(heap.stats().full_collections >= 2);
        heap.verify().unwrap();
    }

    #[test]
    fn wasted_full_collections_fail_the_allocation() {
        let mut heap = testing::heap_with(HeapSettings {
            use_gc_overhead_limit: true,
            gc_time_limit: 0,
            gc_heap_free_limit: 50,
            gc_overhead_limit_threshold: 3,
            ..testing::settings()
        });
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let err = loop {
            match heap.allocate_instance(node, &mut roots) {
                Ok(obj) => roots.strong.push(obj),
                Err(err) => break err,
            }
        };
        assert!(
            matches!(
                err,
                HeapError::GcOverheadLimitExceeded {
                    words: 4,
                    generation: GenerationKind::Young
                }
            ),
            "{err}"
        );
        assert!(heap.stats().full_collections >= 3);
        heap.verify().unwrap();

        // the limit fires once; dropping the roots lets allocation resume
        roots.strong.clear();
        heap.allocate_instance(node, &mut roots).unwrap();
    }

    #[test]
    fn oversized_arrays_are_refused() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        for length in [usize::MAX - 1, usize::MAX, MAX_ARRAY_LENGTH + 1, 1 << 40] {
            let err = heap.allocate_ref_array(length, &mut roots).unwrap_err();
            assert!(matches!(err, HeapError::OutOfMemory { .. }), "{err}");
            let err = heap.allocate_word_array(length, &mut roots).unwrap_err();
            assert!(matches!(err, HeapError::OutOfMemory { .. }), "{err}");
        }
        assert_eq!(heap.stats().total_collections, 0);

        let array = heap.allocate_ref_array(100, &mut roots).unwrap();
        assert_eq!(heap.array_length(array), 100);
    }
}
