//! Four-phase mark-sweep-compact collection of every generation.
//!
//! 1. Mark everything reachable from the roots, in parallel, with reference
//!    discovery. Then clear dead weak roots and unlink dead table entries.
//! 2. Compute a forwarding address for every live object by sliding it
//!    towards the bottom of its generation. Young goes first, then old,
//!    then perm, so klasses are still in place while object sizes are read.
//! 3. Rewrite every root and every field to the forwarding addresses.
//! 4. Move the objects. Perm goes first so that every klass sits at its
//!    new address before the objects described by it are sized.
//!
//! The mark word doubles as mark bit and forwarding pointer. Marks that
//! carry a hash or lock state are saved in [`PreservedMarks`] and written
//! back at the end.

use std::time::Instant;

use crossbeam_deque::Worker;
use object::{Address, MIN_FILL_WORDS, MarkWord, ObjectKind, Value};
use parking_lot::Mutex;

use crate::{
    CollectionKind, CollectionOutcome, CollectionSummary, GcCause, GenerationKind, Heap,
    HeapMemory, IterateFlags, LocalQueue, Phase, PhaseEvent, PreservedMarks, RootProvider,
    SkipReason, Space, TaskQueueSet, WorkGang, align_up, forwarding,
    heap::{HeapDump, fatal_error},
    oop,
    references::{ReferenceContext, ReferenceProcessor, ReferenceStats},
    roots::{self, RootCategory},
};

// ── Phase 1: marking ──────────────────────────────────────────────────

struct MarkShared<'h> {
    mem: &'h HeapMemory,
    gang: &'h WorkGang,
    dump: HeapDump<'h>,
    queues: TaskQueueSet<Address>,
    refs: ReferenceProcessor,
    preserved: &'h PreservedMarks,
    discovered: Mutex<Vec<Address>>,
    pending: Mutex<Value>,
    ref_stats: Mutex<ReferenceStats>,
}

struct Marker<'s, 'h> {
    shared: &'s MarkShared<'h>,
    queue: LocalQueue<'s, Address>,
    discovered: Vec<Address>,
}

impl<'s, 'h> Marker<'s, 'h> {
    fn new(shared: &'s MarkShared<'h>, id: usize, local: Worker<Address>) -> Self {
        Self {
            shared,
            queue: LocalQueue::new(id, local, &shared.queues),
            discovered: Vec::new(),
        }
    }

    /// Marks `value`'s object and queues it for tracing, unless another
    /// worker got there first.
    fn mark_and_push(&mut self, value: Value) {
        if !value.is_heap_ref() {
            return;
        }
        let mem = self.shared.mem;
        let obj = value.address();
        let mut mark = mem.mark(obj);
        loop {
            if mark.is_marked() {
                return;
            }
            if mark.is_gc_state() {
                fatal_error(
                    self.shared.dump,
                    format_args!("object {obj:#x} found in {:?} while marking", mark.state()),
                );
            }
            match mem.cas_mark(obj, mark, MarkWord::marked()) {
                Ok(_) => break,
                Err(current) => mark = current,
            }
        }
        if mark.must_be_preserved() {
            self.shared.preserved.push(mem, obj, mark);
        }
        self.queue.push(obj);
    }

    fn follow(&mut self, obj: Address) {
        let mem = self.shared.mem;
        let mut flags = IterateFlags::KLASS | IterateFlags::REFERENT;
        if let ObjectKind::Reference(_) = oop::describe(mem, obj).kind {
            let discover = self
                .shared
                .refs
                .should_discover(mem, obj, |referent| !mem.mark(referent).is_marked());
            if discover {
                self.discovered.push(obj);
                flags.remove(IterateFlags::REFERENT);
            }
        }
        oop::oop_iterate(mem, obj, flags, &mut |slot| {
            self.mark_and_push(mem.load_value(slot))
        });
    }

    fn drain(&mut self) {
        while let Some(obj) = self.queue.pop() {
            self.follow(obj);
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
}

impl ReferenceContext for Marker<'_, '_> {
    fn is_alive(&self, obj: Address) -> bool {
        self.shared.mem.mark(obj).is_marked()
    }

    fn keep_alive(&mut self, slot: Address) {
        let value = self.shared.mem.load_value(slot);
        self.mark_and_push(value);
    }

    fn complete_gc(&mut self) {
        self.drain();
    }
}

// ── Phases 2 to 4: compaction plan ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpaceId {
    /// Index into [`YoungGen::spaces`](crate::YoungGen::spaces).
    Young(usize),
    Old,
    Perm,
}

impl SpaceId {
    fn generation(self) -> GenerationKind {
        match self {
            SpaceId::Young(_) => GenerationKind::Young,
            SpaceId::Old => GenerationKind::Old,
            SpaceId::Perm => GenerationKind::Perm,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SpaceCompaction {
    id: SpaceId,
    original_top: Address,
    /// End of the last live object (or kept dead run). Dead runs beyond it
    /// are never walked again.
    end_of_live: Address,
    new_top: Address,
}

impl Heap {
    /// Policy entry point: optionally scavenges first, then collects the
    /// whole heap. Maximum compaction also clears soft references.
    pub(crate) fn mark_sweep_invoke(
        &mut self,
        cause: GcCause,
        clear_all_soft_refs: bool,
        maximum_compaction: bool,
        roots: &mut dyn RootProvider,
    ) -> CollectionOutcome {
        if self.settings.scavenge_before_full_gc {
            self.scavenge_no_policy(cause, roots);
        }
        self.mark_sweep_no_policy(
            cause,
            clear_all_soft_refs || maximum_compaction,
            maximum_compaction,
            roots,
        )
    }

    pub(crate) fn mark_sweep_no_policy(
        &mut self,
        cause: GcCause,
        clear_all_soft_refs: bool,
        maximum_compaction: bool,
        roots: &mut dyn RootProvider,
    ) -> CollectionOutcome {
        if self.gc_locker.check_active_before_gc() {
            log::debug!("full collection skipped: a critical section is active");
            self.stats.skipped += 1;
            return CollectionOutcome::Skipped(SkipReason::GcLockerActive);
        }

        let start = Instant::now();
        self.ensure_parsability();
        if self.settings.verify_before_gc {
            self.verify_or_die("before full collection");
        }
        let before = self.usage();
        log::debug!("full collection ({cause}) starts: {before}");

        // The empty to-space holds preserved marks while it is unused.
        let to = self.young.to();
        let preserved = if to.is_empty() {
            PreservedMarks::new(to.bottom()..to.end())
        } else {
            PreservedMarks::new(0..0)
        };
        let mut trace = Vec::new();

        self.mark_phase(&preserved, clear_all_soft_refs, roots);
        trace.push(PhaseEvent {
            phase: Phase::Mark,
            generation: None,
        });

        let plans = self.precompact_phase(maximum_compaction, &mut trace);
        self.adjust_phase(&preserved, &plans, roots, &mut trace);
        self.compact_phase(&plans, &mut trace);

        log::trace!("restoring {} preserved marks", preserved.len());
        preserved.restore(&self.memory);
        preserved.release();

        let absorbed = if self.young.eden().is_empty() {
            0
        } else {
            self.absorb_live_data_from_eden()
        };

        let card_range = (self.perm.space().bottom(), self.old.space().end());
        if self.young.is_empty() {
            self.card_table.clear(card_range.0, card_range.1);
        } else {
            self.card_table.invalidate(card_range.0, card_range.1);
        }

        self.size_policy
            .major_collection_end(self.old.used(), self.young.used());
        if self.settings.use_adaptive_size_policy {
            let desired = self.size_policy.desired_old_capacity(self.old.used());
            self.old.resize(desired, self.settings.generation_alignment);
        }

        if self.settings.zap_unused_heap_area {
            for space in self.young.spaces() {
                space.mangle_unused_area(&self.memory);
            }
            self.old.space().mangle_unused_area(&self.memory);
            self.perm.space().mangle_unused_area(&self.memory);
        }

        let after = self.usage();
        log::debug!("full collection ends: {after}");
        if self.settings.verify_after_gc {
            self.verify_or_die("after full collection");
        }
        self.gc_locker.clear_needs_gc();

        let summary = CollectionSummary {
            kind: CollectionKind::Full,
            cause,
            before,
            after,
            duration: start.elapsed(),
            promotion_failed: false,
            absorbed_from_eden: absorbed,
        };
        self.stats.last_phase_trace = trace;
        self.record_collection(&summary, start);
        self.update_gc_overhead_limit(&summary);
        CollectionOutcome::Completed(summary)
    }

    // ── Phase 1 ───────────────────────────────────────────────────────

    fn mark_phase(
        &mut self,
        preserved: &PreservedMarks,
        clear_all_soft_refs: bool,
        roots: &mut dyn RootProvider,
    ) {
        let workers = self.gang.workers();
        let mut root_values = Vec::new();
        self.universe.oops_do(&mut |value| {
            if value.is_heap_ref() {
                root_values.push(*value);
            }
        });
        roots::snapshot_roots(roots, &mut root_values);

        let (queues, locals) = TaskQueueSet::new(workers, self.settings.task_queue_capacity);
        let shared = MarkShared {
            mem: &self.memory,
            gang: &self.gang,
            dump: HeapDump {
                perm: &self.perm,
                old: &self.old,
                young: &self.young,
            },
            queues,
            refs: ReferenceProcessor::new(clear_all_soft_refs),
            preserved,
            discovered: Mutex::new(Vec::new()),
            pending: Mutex::new(self.universe.pending_list),
            ref_stats: Mutex::new(ReferenceStats::default()),
        };
        let states: Vec<_> = roots::distribute(root_values, workers)
            .into_iter()
            .zip(locals)
            .collect();

        shared.gang.run(states, |id, (chunk, local)| {
            let mut marker = Marker::new(&shared, id, local);
            for root in chunk {
                marker.mark_and_push(root);
            }
            marker.drain_and_terminate();
            shared.discovered.lock().append(&mut marker.discovered);

            shared.gang.sync();
            if id == 0 {
                shared.refs.disable_discovery();
                shared.queues.terminator().reset();
                let discovered = std::mem::take(&mut *shared.discovered.lock());
                let mut pending = *shared.pending.lock();
                let stats =
                    shared
                        .refs
                        .process_discovered(shared.mem, &discovered, &mut pending, &mut marker);
                *shared.pending.lock() = pending;
                *shared.ref_stats.lock() = stats;
            }
            shared.gang.sync();
            marker.drain_and_terminate();
        });

        if !shared.queues.is_empty() {
            fatal_error(shared.dump, format_args!("marking stack not empty after marking"));
        }
        log::trace!(
            "marking queues: {:?}, references: {:?}",
            shared.queues.stats(),
            shared.ref_stats.lock()
        );
        let pending = shared.pending.into_inner();
        self.universe.pending_list = pending;

        let mem = &self.memory;
        let is_alive = |value: Value| !value.is_heap_ref() || mem.mark(value.address()).is_marked();
        roots.visit_weak_roots(&mut |value| {
            if !is_alive(*value) {
                *value = Value::NULL;
            }
        });
        let purged_klass = roots.unlink_dead(&is_alive);
        roots.unload_code(&is_alive, purged_klass);
    }

    // ── Phase 2 ───────────────────────────────────────────────────────

    fn space(&self, id: SpaceId) -> &Space {
        match id {
            SpaceId::Young(index) => self.young.spaces()[index],
            SpaceId::Old => self.old.space(),
            SpaceId::Perm => self.perm.space(),
        }
    }

    fn precompact_phase(
        &self,
        maximum_compaction: bool,
        trace: &mut Vec<PhaseEvent>,
    ) -> Vec<SpaceCompaction> {
        let every = self.settings.mark_sweep_always_compact_count;
        let allow_dead = !maximum_compaction && (self.stats.full_collections + 1) % every != 0;
        let ratio = |r: usize| if allow_dead { r } else { 0 };

        // Eden, then from. An empty to-space carries the preserved marks.
        // When to-space holds objects too, both survivors follow in address
        // order so that no object moves upward over one not yet copied.
        let young_chain = if self.young.to().is_empty() {
            let from = if self.young.from().bottom() == self.young.spaces()[1].bottom() {
                1
            } else {
                2
            };
            vec![SpaceId::Young(0), SpaceId::Young(from)]
        } else {
            vec![SpaceId::Young(0), SpaceId::Young(1), SpaceId::Young(2)]
        };

        let mut plans = Vec::new();
        for (chain, dead_ratio) in [
            (young_chain, 0),
            (vec![SpaceId::Old], ratio(self.settings.mark_sweep_dead_ratio)),
            (vec![SpaceId::Perm], ratio(self.settings.perm_mark_sweep_dead_ratio)),
        ] {
            self.precompact_chain(&chain, dead_ratio, &mut plans);
            trace.push(PhaseEvent {
                phase: Phase::Precompact,
                generation: Some(chain[0].generation()),
            });
        }
        plans
    }

    /// Forwards every live object of `chain` to the next free address of
    /// the chain, switching to the next space when one is full. Dead runs
    /// become dead spans, or fillers kept in place while they fit in the
    /// dead-space allowance and nothing below them moved.
    fn precompact_chain(
        &self,
        chain: &[SpaceId],
        dead_ratio: usize,
        plans: &mut Vec<SpaceCompaction>,
    ) {
        let mem = &self.memory;
        let fillers = self.universe.fillers;
        let first_plan = plans.len();

        let mut new_tops: Vec<Address> = chain.iter().map(|&id| self.space(id).bottom()).collect();
        let mut dest = 0;
        let mut compact_top = new_tops[0];

        for &id in chain {
            let space = self.space(id);
            let (bottom, top) = (space.bottom(), space.top());
            let mut allowed_dead = space.capacity() * dead_ratio / 100;
            let mut end_of_live = bottom;
            let mut q = bottom;

            while q < top {
                if mem.mark(q).is_marked() {
                    let size = oop::object_size(mem, q);
                    while compact_top + size > self.space(chain[dest]).end() {
                        dest += 1;
                        if dest == chain.len() {
                            self.fatal(format_args!(
                                "live objects of {} do not fit their own spaces",
                                id.generation()
                            ));
                        }
                        compact_top = self.space(chain[dest]).bottom();
                    }
                    forwarding::install_forward(mem, q, compact_top);
                    compact_top += size;
                    new_tops[dest] = compact_top;
                    q += size;
                    end_of_live = q;
                    continue;
                }

                let mut end = q;
                while end < top && !mem.mark(end).is_marked() {
                    end += oop::object_size(mem, end);
                }
                let run = end - q;
                if compact_top == q && run <= allowed_dead {
                    allowed_dead -= run;
                    oop::fill_with_object(mem, fillers, q, run);
                    forwarding::install_forward(mem, q, q);
                    compact_top = end;
                    new_tops[dest] = end;
                    end_of_live = end;
                } else {
                    mem.set_mark(q, MarkWord::dead_span(end));
                }
                q = end;
            }

            plans.push(SpaceCompaction {
                id,
                original_top: top,
                end_of_live,
                new_top: bottom,
            });
        }

        for (plan, new_top) in plans[first_plan..].iter_mut().zip(new_tops) {
            plan.new_top = new_top;
        }
    }

    // ── Phase 3 ───────────────────────────────────────────────────────

    fn adjust_phase(
        &mut self,
        preserved: &PreservedMarks,
        plans: &[SpaceCompaction],
        roots: &mut dyn RootProvider,
        trace: &mut Vec<PhaseEvent>,
    ) {
        let mem = &self.memory;
        let dump = HeapDump {
            perm: &self.perm,
            old: &self.old,
            young: &self.young,
        };
        let adjusted = |value: Value| -> Value {
            if !value.is_heap_ref() {
                return value;
            }
            match forwarding::forwardee(mem, value.address()) {
                Some(new) => Value::from_address(new),
                None => fatal_error(
                    dump,
                    format_args!("reference to unmarked object {:#x}", value.address()),
                ),
            }
        };

        let mut adjust_root = |root: &mut Value| *root = adjusted(*root);
        self.universe.oops_do(&mut adjust_root);
        for category in RootCategory::ALL {
            roots.visit_roots(category, &mut adjust_root);
        }
        roots.visit_weak_roots(&mut |root| {
            if root.is_heap_ref() {
                *root = match forwarding::forwardee(mem, root.address()) {
                    Some(new) => Value::from_address(new),
                    None => Value::NULL,
                };
            }
        });
        preserved.adjust(mem);

        let flags = IterateFlags::KLASS | IterateFlags::REFERENT;
        for plan in plans {
            let mut q = self.space(plan.id).bottom();
            while q < plan.end_of_live {
                let mark = mem.mark(q);
                if mark.is_dead_span() {
                    q = mark.next_live();
                    continue;
                }
                q += oop::oop_iterate(mem, q, flags, &mut |slot| {
                    let value = mem.load_value(slot);
                    if value.is_heap_ref() {
                        mem.store_value(slot, adjusted(value));
                    }
                });
            }
            push_generation_event(trace, Phase::Adjust, plan.id.generation());
        }
    }

    // ── Phase 4 ───────────────────────────────────────────────────────

    fn compact_phase(&mut self, plans: &[SpaceCompaction], trace: &mut Vec<PhaseEvent>) {
        let mem = &self.memory;
        for generation in [GenerationKind::Perm, GenerationKind::Old, GenerationKind::Young] {
            for plan in plans.iter().filter(|plan| plan.id.generation() == generation) {
                let mut q = self.space(plan.id).bottom();
                while q < plan.end_of_live {
                    let mark = mem.mark(q);
                    if mark.is_dead_span() {
                        q = mark.next_live();
                        continue;
                    }
                    let new = mark.forwardee();
                    let size = oop::object_size(mem, q);
                    if new != q {
                        mem.copy_words(q, new, size);
                    }
                    mem.set_mark(new, MarkWord::prototype());
                    q += size;
                }
            }
            push_generation_event(trace, Phase::Compact, generation);
        }

        for plan in plans {
            self.space(plan.id).set_top(plan.new_top);
        }
        for generation in [&self.old, &self.perm] {
            let plan = plans
                .iter()
                .find(|plan| plan.id.generation() == generation.kind());
            if let Some(plan) = plan {
                let bottom = generation.space().bottom();
                generation.start_array().reset(bottom, plan.original_top);
                generation.start_array().record_range(mem, bottom, plan.new_top);
            }
        }

        // Keep the surviving young data in from-space.
        if self.young.from().is_empty() && !self.young.to().is_empty() {
            self.young.swap_spaces();
        }
    }

    // ── Epilogue ──────────────────────────────────────────────────────

    /// Moves the old/young boundary up over the live data left in eden, so
    /// it becomes part of the old generation without being copied. Returns
    /// the number of words absorbed, or 0 when the move is not possible.
    fn absorb_live_data_from_eden(&mut self) -> usize {
        if !(self.settings.use_adaptive_size_policy && self.settings.use_adaptive_gc_boundary) {
            return 0;
        }
        let young_vs = *self.young.virtual_space();
        let old_vs = *self.old.virtual_space();
        if young_vs.uncommitted_size() != 0 || old_vs.uncommitted_size() != 0 {
            log::debug!("eden not absorbed: generations not fully committed");
            return 0;
        }
        if old_vs.high_boundary != self.young.boundary() {
            log::debug!("eden not absorbed: old and young are not adjacent");
            return 0;
        }

        let eden = self.young.eden();
        let alignment = self.settings.generation_alignment;
        let absorb = align_up(
            eden.used() + self.size_policy.padded_average_promoted(),
            alignment,
        );
        if absorb >= eden.capacity() {
            log::debug!("eden not absorbed: {absorb} words would not leave an eden");
            return 0;
        }
        if self.young.capacity() - absorb < self.settings.min_young_size {
            log::debug!("eden not absorbed: young would shrink below its minimum");
            return 0;
        }

        let unused_start = self.old.space().top();
        let unused = self.old.space().end() - unused_start;
        if unused != 0 && unused < MIN_FILL_WORDS {
            return 0;
        }
        if unused != 0 {
            oop::fill_with_object(&self.memory, self.universe.fillers, unused_start, unused);
        }

        let new_top = eden.top();
        self.old.expand_into(&mut self.young, absorb);
        self.old.space().set_top(new_top);
        self.old
            .start_array()
            .record_range(&self.memory, unused_start, new_top);
        self.size_policy.set_words_absorbed_from_eden(absorb);
        log::info!(
            "absorbed {absorb} words of eden into old, boundary now {:#x}",
            self.young.boundary()
        );
        absorb
    }
}

fn push_generation_event(trace: &mut Vec<PhaseEvent>, phase: Phase, generation: GenerationKind) {
    let event = PhaseEvent {
        phase,
        generation: Some(generation),
    };
    if trace.last() != Some(&event) {
        trace.push(event);
    }
}

#[cfg(test)]
mod tests {
    use object::{KLASS_WORDS, MarkState, ObjectKind, ReferenceType, Value};

    use crate::{
        CollectionKind, GcCause, GenerationKind, Heap, HeapSettings, Phase, PhaseEvent,
        testing::{self, LEFT, RIGHT, TestRoots},
    };

    fn tenured_nodes(heap: &mut Heap, roots: &mut TestRoots, count: i64) -> Vec<Value> {
        let node = testing::node_klass(heap);
        (0..count)
            .map(|i| {
                let obj = heap.allocate_tenured(node, roots).unwrap();
                heap.store_field(obj, LEFT, Value::from_i64(i));
                obj
            })
            .collect()
    }

    #[test]
    fn maximum_compaction_slides_live_objects_down() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        let objs = tenured_nodes(&mut heap, &mut roots, 10);
        let live = [1, 4, 6, 9];
        roots.strong = live.iter().map(|&i| objs[i]).collect();

        let outcome = heap.collect_full(false, true, &mut roots);
        let summary = outcome.completed().unwrap();
        assert_eq!(summary.kind, CollectionKind::Full);
        assert_eq!(summary.cause, GcCause::SystemGc);

        let bottom = heap.old().space().bottom();
        assert_eq!(heap.old().used(), 16);
        for (k, &i) in live.iter().enumerate() {
            let obj = roots.strong[k];
            assert_eq!(obj.address(), bottom + 4 * k);
            assert_eq!(heap.load_field(obj, LEFT), Value::from_i64(i as i64));
        }
    }

    #[test]
    fn dead_prefix_stays_until_compaction_is_forced() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        let objs = tenured_nodes(&mut heap, &mut roots, 3);
        roots.strong.push(objs[1]);

        heap.collect_full(false, false, &mut roots);
        assert_eq!(roots.strong[0], objs[1]);
        assert_eq!(heap.old().used(), 8);

        heap.collect_full(false, true, &mut roots);
        assert_eq!(roots.strong[0].address(), heap.old().space().bottom());
        assert_eq!(heap.old().used(), 4);
        assert_eq!(heap.load_field(roots.strong[0], LEFT), Value::from_i64(1));
    }

    #[test]
    fn dead_space_allowance_depends_on_compaction_mode() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        let objs = tenured_nodes(&mut heap, &mut roots, 10);
        let live = [1, 4, 6, 9];
        roots.strong = live.iter().map(|&i| objs[i]).collect();

        // Every dead run fits the allowance, so nothing moves.
        heap.collect_full(false, false, &mut roots);
        assert_eq!(heap.old().used(), 40);
        for (k, &i) in live.iter().enumerate() {
            assert_eq!(roots.strong[k], objs[i]);
        }
        heap.verify().unwrap();

        heap.collect_full(false, true, &mut roots);
        assert_eq!(heap.old().used(), 16);
        let bottom = heap.old().space().bottom();
        for (k, &i) in live.iter().enumerate() {
            assert_eq!(roots.strong[k].address(), bottom + 4 * k);
            assert_eq!(heap.load_field(roots.strong[k], LEFT), Value::from_i64(i as i64));
        }
    }

    #[test]
    fn phases_run_in_generation_order() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        heap.collect_full(false, false, &mut roots);

        let event = |phase, generation| PhaseEvent { phase, generation };
        let (young, old, perm) = (
            Some(GenerationKind::Young),
            Some(GenerationKind::Old),
            Some(GenerationKind::Perm),
        );
        assert_eq!(
            heap.stats().last_phase_trace,
            vec![
                event(Phase::Mark, None),
                event(Phase::Precompact, young),
                event(Phase::Precompact, old),
                event(Phase::Precompact, perm),
                event(Phase::Adjust, young),
                event(Phase::Adjust, old),
                event(Phase::Adjust, perm),
                event(Phase::Compact, perm),
                event(Phase::Compact, old),
                event(Phase::Compact, young),
            ]
        );
    }

    #[test]
    fn young_garbage_is_squeezed_out() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        for i in 0..100 {
            let obj = heap.allocate_instance(node, &mut roots).unwrap();
            heap.store_field(obj, LEFT, Value::from_i64(i));
            roots.strong.push(obj);
            heap.allocate_instance(node, &mut roots).unwrap();
        }
        heap.scavenge(&mut roots);
        for _ in 0..50 {
            heap.allocate_instance(node, &mut roots).unwrap();
        }

        heap.collect_full(false, false, &mut roots);
        assert_eq!(heap.young().used(), 400);
        assert_eq!(heap.young().eden().used(), 400);
        assert!(heap.young().from().is_empty());
        for (i, obj) in roots.strong.iter().enumerate() {
            assert!(heap.young().eden().contains(obj.address()));
            assert_eq!(heap.load_field(*obj, LEFT), Value::from_i64(i as i64));
        }
    }

    #[test]
    fn unreachable_klass_is_reclaimed_and_instances_follow() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        heap.define_klass(ObjectKind::Instance, 3, Value::NULL, &mut roots)
            .unwrap();
        let live = heap
            .define_klass(ObjectKind::Instance, 5, Value::NULL, &mut roots)
            .unwrap();
        let obj = heap.allocate_instance(live, &mut roots).unwrap();
        roots.strong.push(obj);
        let perm_used = heap.perm().used();

        heap.collect_full(false, true, &mut roots);
        let obj = roots.strong[0];
        assert_eq!(heap.klass_of(obj).address(), live.address() - KLASS_WORDS);
        assert_eq!(heap.object_size(obj), 5);
        assert_eq!(heap.perm().used(), perm_used - KLASS_WORDS);
    }

    #[test]
    fn perm_exhaustion_collects_dead_klasses() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        for _ in 0..1_000 {
            heap.define_klass(ObjectKind::Instance, 2, Value::NULL, &mut roots)
                .unwrap();
        }
        assert!(heap.stats().full_collections >= 1);
        let last = heap.stats().last.as_ref().unwrap();
        assert_eq!(last.cause, GcCause::PermAllocationFailure);
    }

    #[test]
    fn soft_references_survive_until_cleared_explicitly() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let target = heap.allocate_instance(node, &mut roots).unwrap();
        let soft = heap.allocate_reference(ReferenceType::Soft, target, &mut roots).unwrap();
        roots.strong.push(soft);
        let target = heap.allocate_instance(node, &mut roots).unwrap();
        let weak = heap.allocate_reference(ReferenceType::Weak, target, &mut roots).unwrap();
        roots.strong.push(weak);

        heap.collect_full(false, false, &mut roots);
        let (soft, weak) = (roots.strong[0], roots.strong[1]);
        assert!(!heap.referent(soft).is_null());
        assert!(heap.referent(weak).is_null());
        assert_eq!(heap.drain_pending_references(), vec![weak]);

        heap.collect_full(true, true, &mut roots);
        let soft = roots.strong[0];
        assert!(heap.referent(soft).is_null());
        assert_eq!(heap.drain_pending_references(), vec![soft]);
    }

    #[test]
    fn maximum_compaction_clears_soft_references() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let target = heap.allocate_instance(node, &mut roots).unwrap();
        let soft = heap.allocate_reference(ReferenceType::Soft, target, &mut roots).unwrap();
        roots.strong.push(soft);

        heap.collect_full(false, true, &mut roots);
        let soft = roots.strong[0];
        assert!(heap.referent(soft).is_null());
        assert_eq!(heap.drain_pending_references(), vec![soft]);
    }

    #[test]
    fn hash_and_lock_survive_compaction() {
        let mut heap = testing::heap();
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        heap.allocate_instance(node, &mut roots).unwrap();
        let hashed = heap.allocate_instance(node, &mut roots).unwrap();
        roots.strong.push(hashed);
        let locked = heap.allocate_instance(node, &mut roots).unwrap();
        roots.strong.push(locked);
        let hash = heap.identity_hash(hashed).unwrap();
        let displaced = heap.lock(locked, 11);

        heap.collect_full(false, true, &mut roots);
        let (hashed, locked) = (roots.strong[0], roots.strong[1]);
        assert_eq!(hashed.address(), heap.young().eden().bottom());
        assert_eq!(heap.identity_hash(hashed), Some(hash));
        assert!(matches!(heap.mark_of(locked).state(), MarkState::Locked { owner: 11, .. }));
        heap.unlock(locked, displaced);
        assert!(matches!(heap.mark_of(locked).state(), MarkState::Unlocked { hash: 0, .. }));
    }

    #[test]
    fn weak_roots_are_cleared_or_moved() {
        let mut heap = testing::heap();
        let mut roots = TestRoots::default();
        let objs = tenured_nodes(&mut heap, &mut roots, 3);
        roots.strong.push(objs[2]);
        roots.weak = vec![objs[0], objs[2], Value::from_i64(8)];

        heap.collect_full(false, true, &mut roots);
        assert_eq!(roots.weak, vec![Value::NULL, roots.strong[0], Value::from_i64(8)]);
    }

    fn absorbing_settings() -> HeapSettings {
        HeapSettings {
            use_adaptive_size_policy: true,
            use_adaptive_gc_boundary: true,
            ..testing::settings()
        }
    }

    #[test]
    fn live_eden_data_is_absorbed_into_old() {
        let mut heap = testing::heap_with(absorbing_settings());
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        for _ in 0..10 {
            let obj = heap.allocate_instance(node, &mut roots).unwrap();
            roots.strong.push(obj);
        }
        let boundary = heap.young().boundary();
        let young_capacity = heap.young().capacity();

        let outcome = heap.collect_full(false, false, &mut roots);
        assert_eq!(outcome.completed().unwrap().absorbed_from_eden, 512);
        assert_eq!(heap.young().boundary(), boundary + 512);
        assert_eq!(heap.young().capacity(), young_capacity - 512);
        assert!(heap.young().is_empty());
        for obj in &roots.strong {
            assert!(heap.old().contains(obj.address()));
            assert!(!heap.is_in_young(*obj));
        }
        assert!(!heap.is_in_young(Value::from_address(boundary)));

        let fresh = heap.allocate_instance(node, &mut roots).unwrap();
        assert!(heap.is_in_young(fresh));
        heap.verify().unwrap();
    }

    #[test]
    fn absorption_keeps_the_minimum_young_size() {
        let mut heap = testing::heap_with(HeapSettings {
            min_young_size: 8_192,
            ..absorbing_settings()
        });
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let obj = heap.allocate_instance(node, &mut roots).unwrap();
        roots.strong.push(obj);
        let boundary = heap.young().boundary();

        let outcome = heap.collect_full(false, false, &mut roots);
        assert_eq!(outcome.completed().unwrap().absorbed_from_eden, 0);
        assert_eq!(heap.young().boundary(), boundary);
        assert!(heap.is_in_young(roots.strong[0]));
    }

    #[test]
    fn absorption_needs_a_fully_committed_young_generation() {
        let mut heap = testing::heap_with(HeapSettings {
            young_initial_size: 4_096,
            ..absorbing_settings()
        });
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let obj = heap.allocate_instance(node, &mut roots).unwrap();
        roots.strong.push(obj);
        let boundary = heap.young().boundary();

        let outcome = heap.collect_full(false, false, &mut roots);
        assert_eq!(outcome.completed().unwrap().absorbed_from_eden, 0);
        assert_eq!(heap.young().boundary(), boundary);
        assert!(heap.is_in_young(roots.strong[0]));
        heap.verify().unwrap();
    }

    #[test]
    fn parallel_marking_handles_shared_objects() {
        let mut heap = testing::heap_with(HeapSettings {
            parallel_gc_threads: 4,
            ..testing::settings()
        });
        let node = testing::node_klass(&mut heap);
        let mut roots = TestRoots::default();
        let shared = heap.allocate_tenured(node, &mut roots).unwrap();
        roots.strong.push(shared);
        for i in 0..300 {
            let obj = heap.allocate_instance(node, &mut roots).unwrap();
            heap.store_field(obj, LEFT, roots.strong[0]);
            heap.store_field(obj, RIGHT, Value::from_i64(i));
            roots.strong.push(obj);
            // garbage between the live nodes
            heap.allocate_tenured(node, &mut roots).unwrap();
        }

        heap.collect_full(false, true, &mut roots);
        let shared = roots.strong[0];
        assert_eq!(heap.old().used(), 4);
        assert_eq!(heap.young().used(), 300 * 4);
        for (i, obj) in roots.strong[1..].iter().enumerate() {
            assert_eq!(heap.load_field(*obj, LEFT), shared);
            assert_eq!(heap.load_field(*obj, RIGHT), Value::from_i64(i as i64));
        }
    }
}
