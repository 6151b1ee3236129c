//! Parallel copying collection of the young generation.
//!
//! Live young objects are evacuated from eden and the from-space into the
//! to-space, or promoted into the old generation once they reach the
//! tenuring threshold or the to-space is full. Roots are the mutator's
//! roots, the universe, and every old or perm slot on a dirty card.
//!
//! Each worker owns a work-stealing queue of copied objects whose fields
//! still need scanning. Forwarding is claimed with a CAS on the original's
//! mark word, so exactly one worker's copy wins; losers give their copy back
//! and use the winner's.

use std::{
    ops::Range,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Instant,
};

use crossbeam_deque::Worker;
use object::{Address, MarkWord, NEXT_OFFSET, ObjectKind, REFERENT_OFFSET, Value};
use parking_lot::Mutex;

use crate::{
    CardTable, CollectionKind, CollectionOutcome, CollectionSummary, Fillers, GcCause,
    GenerationKind, Heap, HeapMemory, IterateFlags, LocalQueue, RootProvider, SkipReason,
    TaskQueueSet, TenuredGen, WorkGang, YoungGen,
    forwarding,
    heap::{HeapDump, fatal_error},
    oop,
    references::{ReferenceContext, ReferenceProcessor, ReferenceStats},
    roots::{self, RootCategory},
};

/// Cards claimed by a worker at a time.
const STRIPE_CARDS: usize = 64;

#[derive(Debug, Clone)]
struct Stripe {
    cards: Range<usize>,
    /// Top of the generation when the scavenge started. Promoted objects
    /// above it are scanned through the queues instead.
    limit: Address,
    generation: GenerationKind,
}

/// State shared by every worker of one scavenge.
struct ScavengeShared<'h> {
    mem: &'h HeapMemory,
    young: &'h YoungGen,
    old: &'h TenuredGen,
    perm: &'h TenuredGen,
    cards: &'h CardTable,
    gang: &'h WorkGang,
    dump: HeapDump<'h>,
    fillers: Fillers,
    queues: TaskQueueSet<Address>,
    refs: ReferenceProcessor,
    tenuring_threshold: u8,
    /// Root scanning drains the local queue down to this length after each root.
    trim_target: usize,
    stripes: Vec<Stripe>,
    next_stripe: AtomicUsize,
    promotion_failed: AtomicBool,
    failed: Mutex<Vec<(Address, MarkWord)>>,
    discovered: Mutex<Vec<Address>>,
    pending: Mutex<Value>,
    ref_stats: Mutex<ReferenceStats>,
    promoted: AtomicUsize,
    survived: AtomicUsize,
}

impl ScavengeShared<'_> {
    fn claim_stripe(&self) -> Option<&Stripe> {
        let index = self.next_stripe.fetch_add(1, Ordering::Relaxed);
        self.stripes.get(index)
    }

    /// The forwarded location of a young object, for values read after
    /// the copying pass.
    fn resolve(&self, value: Value) -> Value {
        if value.is_heap_ref() && self.young.is_in_young(value.address()) {
            if let Some(new) = forwarding::forwardee(self.mem, value.address()) {
                return Value::from_address(new);
            }
        }
        value
    }
}

struct ScavengeWorker<'s, 'h> {
    shared: &'s ScavengeShared<'h>,
    queue: LocalQueue<'s, Address>,
    discovered: Vec<Address>,
    failed: Vec<(Address, MarkWord)>,
    promoted: usize,
    survived: usize,
}

impl<'s, 'h> ScavengeWorker<'s, 'h> {
    fn new(shared: &'s ScavengeShared<'h>, id: usize, local: Worker<Address>) -> Self {
        Self {
            shared,
            queue: LocalQueue::new(id, local, &shared.queues),
            discovered: Vec::new(),
            failed: Vec::new(),
            promoted: 0,
            survived: 0,
        }
    }

    // ── Copying ───────────────────────────────────────────────────────

    /// Returns the new location of the young object `obj`, copying it if
    /// no worker has done so yet.
    #[inline]
    fn evacuate(&mut self, obj: Address) -> Address {
        let mark = self.shared.mem.mark(obj);
        if mark.is_forwarded() {
            mark.forwardee()
        } else {
            self.copy_to_survivor_space(obj, mark)
        }
    }

    fn copy_to_survivor_space(&mut self, obj: Address, mark: MarkWord) -> Address {
        let shared = self.shared;
        let mem = shared.mem;
        let size = oop::object_size(mem, obj);

        let mut promoted = false;
        let to_space = if mark.age() < shared.tenuring_threshold {
            shared.young.to().par_allocate(size)
        } else {
            None
        };
        let new = match to_space {
            Some(new) => new,
            None => match shared.old.par_allocate(size) {
                Some(new) => {
                    promoted = true;
                    new
                }
                None => return self.promotion_failed(obj, mark),
            },
        };

        mem.copy_words(obj, new, size);
        mem.set_mark(new, if promoted { mark } else { mark.incr_age() });

        match forwarding::forward_to_atomic(mem, obj, mark, new) {
            Ok(()) => {
                if promoted {
                    self.promoted += size;
                } else {
                    self.survived += size;
                }
                self.queue.push(new);
                new
            }
            Err(winner) => {
                // Lost the race. Give the copy back or plug it.
                if promoted || !shared.young.to().cas_deallocate(new, size) {
                    oop::fill_with_object(mem, shared.fillers, new, size);
                }
                winner
            }
        }
    }

    /// Neither to-space nor old can hold `obj`: it stays where it is,
    /// forwarded to itself, and its fields are scanned in place.
    #[cold]
    fn promotion_failed(&mut self, obj: Address, mark: MarkWord) -> Address {
        match forwarding::forward_to_atomic(self.shared.mem, obj, mark, obj) {
            Ok(()) => {
                if !self.shared.promotion_failed.swap(true, Ordering::Relaxed) {
                    log::debug!("promotion failed at {obj:#x}");
                }
                self.failed.push((obj, mark));
                self.queue.push(obj);
                obj
            }
            Err(winner) => winner,
        }
    }

    // ── Closures ──────────────────────────────────────────────────────

    fn evacuate_root(&mut self, root: Value) {
        if !root.is_heap_ref() || !self.shared.young.is_in_young(root.address()) {
            return;
        }
        self.evacuate(root.address());
        self.trim_queue();
    }

    /// The strong scanning closure. `barrier` is set for slots outside
    /// the young generation; they get their card re-dirtied when they
    /// still refer into young.
    #[inline]
    fn scan_slot(&mut self, slot: Address, barrier: bool) {
        let shared = self.shared;
        let value = shared.mem.load_value(slot);
        if !value.is_heap_ref() {
            return;
        }
        let obj = value.address();
        let mut new = obj;
        if shared.young.is_in_young(obj) {
            if shared.young.to().contains(obj) {
                fatal_error(
                    shared.dump,
                    format_args!("slot {slot:#x} scanned twice: it already refers to to-space {obj:#x}"),
                );
            }
            new = self.evacuate(obj);
            if new != obj {
                shared.mem.store_value(slot, Value::from_address(new));
            }
        }
        if barrier && shared.young.is_in_young(new) {
            shared.cards.mark(slot);
        }
    }

    /// Weak-reference flavor: referents already in to-space are left alone.
    fn scan_weak_slot(&mut self, slot: Address) {
        let shared = self.shared;
        let value = shared.mem.load_value(slot);
        if !value.is_heap_ref() {
            return;
        }
        let obj = value.address();
        if !shared.young.is_in_young(obj) || shared.young.to().contains(obj) {
            return;
        }
        let new = self.evacuate(obj);
        if new != obj {
            shared.mem.store_value(slot, Value::from_address(new));
        }
    }

    /// Scans the fields of a copied (or self-forwarded) object.
    fn scan_object(&mut self, obj: Address) {
        let shared = self.shared;
        let mem = shared.mem;
        let young = shared.young;
        let barrier = !young.is_in_young(obj);

        let mut flags = IterateFlags::REFERENT;
        if let ObjectKind::Reference(_) = oop::describe(mem, obj).kind {
            let discover = shared.refs.should_discover(mem, obj, |referent| {
                young.is_in_young(referent) && !mem.mark(referent).is_forwarded()
            });
            if discover {
                self.discovered.push(obj);
                flags = IterateFlags::empty();
            }
        }
        oop::oop_iterate(mem, obj, flags, &mut |slot| self.scan_slot(slot, barrier));
    }

    // ── Queue processing ──────────────────────────────────────────────

    fn trim_queue(&mut self) {
        while self.queue.len() > self.shared.trim_target {
            match self.queue.pop_local() {
                Some(obj) => self.scan_object(obj),
                None => break,
            }
        }
    }

    fn drain(&mut self) {
        while let Some(obj) = self.queue.pop() {
            self.scan_object(obj);
        }
    }

    fn drain_and_terminate(&mut self) {
        loop {
            self.drain();
            if self.shared.queues.offer_termination() {
                break;
            }
        }
    }

    // ── Old-to-young roots ────────────────────────────────────────────

    fn scan_stripe(&mut self, stripe: &Stripe) {
        let shared = self.shared;
        let mem = shared.mem;
        let cards = shared.cards;
        let generation = match stripe.generation {
            GenerationKind::Perm => shared.perm,
            _ => shared.old,
        };
        let bottom = generation.space().bottom();

        for card in stripe.cards.clone() {
            if !cards.is_card_dirty(card) {
                continue;
            }
            cards.clean_card(card);
            let card_end = cards.card_start(card + 1);
            let start = cards.card_start(card).max(bottom);
            let end = card_end.min(stripe.limit);
            if start < end {
                let mut obj = generation.start_array().object_start(mem, start);
                while obj < end {
                    obj += oop::oop_iterate(mem, obj, IterateFlags::REFERENT, &mut |slot| {
                        if start <= slot && slot < end {
                            self.scan_slot(slot, true);
                        }
                    });
                }
            }
            if card_end > stripe.limit {
                // Shared with objects promoted during this pass.
                cards.mark(card_end - 1);
            }
        }
    }

    fn publish(self) {
        let shared = self.shared;
        shared.promoted.fetch_add(self.promoted, Ordering::Relaxed);
        shared.survived.fetch_add(self.survived, Ordering::Relaxed);
        if !self.failed.is_empty() {
            shared.failed.lock().extend(self.failed);
        }
    }
}

impl ReferenceContext for ScavengeWorker<'_, '_> {
    fn is_alive(&self, obj: Address) -> bool {
        !self.shared.young.is_in_young(obj) || self.shared.mem.mark(obj).is_forwarded()
    }

    fn keep_alive(&mut self, slot: Address) {
        self.scan_weak_slot(slot);
        let shared = self.shared;
        if !shared.young.is_in_young(slot) {
            let value = shared.mem.load_value(slot);
            if value.is_heap_ref() && shared.young.is_in_young(value.address()) {
                shared.cards.mark(slot);
            }
        }
    }

    fn complete_gc(&mut self) {
        self.drain();
    }
}

/// What the serial epilogue needs from the parallel pass.
struct ScavengeResult {
    promotion_failed: bool,
    failed: Vec<(Address, MarkWord)>,
    pending: Value,
    promoted: usize,
    survived: usize,
}

impl Heap {
    /// One scavenge, without falling back to a full collection. Returns
    /// `None` when the scavenge should not be attempted: the to-space holds
    /// objects, or the old generation may not take the promotions.
    pub(crate) fn scavenge_no_policy(
        &mut self,
        cause: GcCause,
        roots: &mut dyn RootProvider,
    ) -> Option<CollectionOutcome> {
        if self.gc_locker.check_active_before_gc() {
            log::debug!("scavenge skipped: a critical section is active");
            self.stats.skipped += 1;
            return Some(CollectionOutcome::Skipped(SkipReason::GcLockerActive));
        }
        if !self.young.to().is_empty() {
            log::debug!("scavenge not attempted: to-space is not empty");
            return None;
        }

        self.ensure_parsability();
        let young_used = self.young.used();
        let alignment = self.settings.generation_alignment;
        if self.old.free() < young_used && !self.old.expand(young_used, alignment) {
            let reserved = self.old.virtual_space().reserved_size();
            self.old.resize(reserved, alignment);
        }
        if self.size_policy.should_full_gc(self.old.free(), young_used) {
            log::debug!("scavenge not attempted: old generation too full");
            return None;
        }

        let start = Instant::now();
        if self.settings.verify_before_gc {
            self.verify_or_die("before scavenge");
        }
        let before = self.usage();
        log::debug!("scavenge ({cause}) starts: {before}, tenuring threshold {}", self.tenuring_threshold);

        let result = self.scavenge_parallel(roots);

        self.fix_roots_after_scavenge(roots, result.pending);

        if result.promotion_failed {
            self.clean_up_failed_promotion(&result.failed);
        } else {
            let zap = self.settings.zap_unused_heap_area;
            self.young.eden().clear(&self.memory, zap);
            self.young.from().clear(&self.memory, zap);
            self.young.swap_spaces();
            self.tenuring_threshold = self.size_policy.minor_collection_end(
                result.promoted,
                result.survived,
                self.young.from().capacity(),
                self.tenuring_threshold,
            );
        }

        let after = self.usage();
        log::debug!(
            "scavenge ends: {after}, promoted {} words, survived {} words",
            result.promoted,
            result.survived
        );
        if self.settings.verify_after_gc && !result.promotion_failed {
            self.verify_or_die("after scavenge");
        }
        self.gc_locker.clear_needs_gc();

        let summary = CollectionSummary {
            kind: CollectionKind::Scavenge,
            cause,
            before,
            after,
            duration: start.elapsed(),
            promotion_failed: result.promotion_failed,
            absorbed_from_eden: 0,
        };
        self.record_collection(&summary, start);
        Some(CollectionOutcome::Completed(summary))
    }

    fn scavenge_parallel(&mut self, roots: &mut dyn RootProvider) -> ScavengeResult {
        let workers = self.gang.workers();

        let mut root_values = Vec::new();
        self.universe.oops_do(&mut |value| {
            if value.is_heap_ref() {
                root_values.push(*value);
            }
        });
        roots::snapshot_roots(roots, &mut root_values);

        let mut stripes = Vec::new();
        for (generation, kind) in [(&self.old, GenerationKind::Old), (&self.perm, GenerationKind::Perm)] {
            let limit = generation.space().top();
            let cards = self.card_table.card_range(generation.space().bottom(), limit);
            let mut first = cards.start;
            while first < cards.end {
                let last = (first + STRIPE_CARDS).min(cards.end);
                stripes.push(Stripe {
                    cards: first..last,
                    limit,
                    generation: kind,
                });
                first = last;
            }
        }

        let (queues, locals) = TaskQueueSet::new(workers, self.settings.task_queue_capacity);
        let shared = ScavengeShared {
            mem: &self.memory,
            young: &self.young,
            old: &self.old,
            perm: &self.perm,
            cards: &self.card_table,
            gang: &self.gang,
            dump: HeapDump {
                perm: &self.perm,
                old: &self.old,
                young: &self.young,
            },
            fillers: self.universe.fillers,
            queues,
            refs: ReferenceProcessor::new(false),
            tenuring_threshold: self.tenuring_threshold,
            trim_target: 10 * workers,
            stripes,
            next_stripe: AtomicUsize::new(0),
            promotion_failed: AtomicBool::new(false),
            failed: Mutex::new(Vec::new()),
            discovered: Mutex::new(Vec::new()),
            pending: Mutex::new(self.universe.pending_list),
            ref_stats: Mutex::new(ReferenceStats::default()),
            promoted: AtomicUsize::new(0),
            survived: AtomicUsize::new(0),
        };

        let states: Vec<_> = roots::distribute(root_values, workers)
            .into_iter()
            .zip(locals)
            .collect();

        shared.gang.run(states, |id, (chunk, local)| {
            let mut worker = ScavengeWorker::new(&shared, id, local);
            for root in chunk {
                worker.evacuate_root(root);
            }
            while let Some(stripe) = shared.claim_stripe() {
                worker.scan_stripe(stripe);
            }
            worker.drain_and_terminate();
            shared.discovered.lock().append(&mut worker.discovered);

            shared.gang.sync();
            if id == 0 {
                shared.refs.disable_discovery();
                shared.queues.terminator().reset();
                let discovered = std::mem::take(&mut *shared.discovered.lock());
                let mut pending = shared.resolve(*shared.pending.lock());
                let stats =
                    shared
                        .refs
                        .process_discovered(shared.mem, &discovered, &mut pending, &mut worker);
                *shared.pending.lock() = pending;
                *shared.ref_stats.lock() = stats;
            }
            shared.gang.sync();

            worker.drain_and_terminate();
            worker.publish();
        });

        if !shared.queues.is_empty() {
            fatal_error(shared.dump, format_args!("work queues not empty after scavenge"));
        }
        let stats = shared.queues.stats();
        log::trace!("scavenge queues: {stats:?}, references: {:?}", shared.ref_stats.lock());

        let ScavengeShared {
            promotion_failed,
            failed,
            pending,
            promoted,
            survived,
            ..
        } = shared;
        ScavengeResult {
            promotion_failed: promotion_failed.into_inner(),
            failed: failed.into_inner(),
            pending: pending.into_inner(),
            promoted: promoted.into_inner(),
            survived: survived.into_inner(),
        }
    }

    /// Points every root at its evacuated object, clears weak roots whose
    /// referent died and re-dirties cards of pending references in old.
    fn fix_roots_after_scavenge(&mut self, roots: &mut dyn RootProvider, pending: Value) {
        let mem = &self.memory;
        let young = &self.young;
        let dump = HeapDump {
            perm: &self.perm,
            old: &self.old,
            young: &self.young,
        };
        let mut strong = |value: &mut Value| {
            if value.is_heap_ref() && young.is_in_young(value.address()) {
                match forwarding::forwardee(mem, value.address()) {
                    Some(new) => *value = Value::from_address(new),
                    None => fatal_error(
                        dump,
                        format_args!("strong root {:#x} was not evacuated", value.address()),
                    ),
                }
            }
        };
        self.universe.oops_do(&mut strong);
        for category in RootCategory::ALL {
            roots.visit_roots(category, &mut strong);
        }
        roots.visit_weak_roots(&mut |value| {
            if value.is_heap_ref() && young.is_in_young(value.address()) {
                *value = match forwarding::forwardee(mem, value.address()) {
                    Some(new) => Value::from_address(new),
                    None => Value::NULL,
                };
            }
        });

        self.universe.pending_list = pending;
        let mut cur = pending;
        while cur.is_heap_ref() {
            let obj = cur.address();
            if !young.is_in_young(obj) {
                for slot in [obj + REFERENT_OFFSET, obj + NEXT_OFFSET] {
                    let value = mem.load_value(slot);
                    if value.is_heap_ref() && young.is_in_young(value.address()) {
                        self.card_table.mark(slot);
                    }
                }
            }
            let next = mem.load_value(obj + NEXT_OFFSET);
            if next == cur {
                break;
            }
            cur = next;
        }
    }

    /// Undoes the self-forwarding of a failed scavenge. Every object left
    /// in eden or from-space gets a usable mark back; the survivors are not
    /// swapped.
    fn clean_up_failed_promotion(&mut self, failed: &[(Address, MarkWord)]) {
        log::info!("promotion failed: {} objects stayed in place", failed.len());
        let mem = &self.memory;
        for space in [self.young.eden(), self.young.from()] {
            oop::walk_objects(mem, space.bottom(), space.top(), |obj, _| {
                if mem.mark(obj).is_forwarded() {
                    mem.set_mark(obj, MarkWord::prototype());
                }
            });
        }
        for &(obj, mark) in failed {
            mem.set_mark(obj, mark);
        }
    }
}
