//! Soft, weak and final reference discovery and processing.
//!
//! While tracing, a reference object whose referent is not yet known to be
//! live is *discovered*: its referent slot is left untraced and the object is
//! recorded. After the strong closure is complete the discovered references
//! are processed according to their type and the soft reference policy.

use std::sync::atomic::{AtomicBool, Ordering};

use object::{Address, NEXT_OFFSET, ObjectKind, REFERENT_OFFSET, ReferenceType, Value};

use crate::{HeapMemory, oop};

/// Collector-specific liveness and tracing callbacks.
pub trait ReferenceContext {
    fn is_alive(&self, obj: Address) -> bool;
    /// Makes the referent in `slot` live, updating the slot if it moves.
    fn keep_alive(&mut self, slot: Address);
    /// Traces everything reachable from objects kept alive so far.
    fn complete_gc(&mut self);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceStats {
    pub discovered: usize,
    pub cleared: usize,
    pub kept_alive: usize,
    pub enqueued: usize,
}

#[derive(Debug)]
pub struct ReferenceProcessor {
    discovering: AtomicBool,
    clear_all_soft_refs: bool,
}

impl ReferenceProcessor {
    pub fn new(clear_all_soft_refs: bool) -> Self {
        Self {
            discovering: AtomicBool::new(true),
            clear_all_soft_refs,
        }
    }

    #[inline]
    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Acquire)
    }

    pub fn disable_discovery(&self) {
        self.discovering.store(false, Ordering::Release);
    }

    pub fn clear_all_soft_refs(&self) -> bool {
        self.clear_all_soft_refs
    }

    /// Whether tracing `obj` (a reference object) should record it instead of
    /// tracing its referent. `needs_tracing` tells whether the referent is not
    /// yet known to be live.
    pub fn should_discover(
        &self,
        mem: &HeapMemory,
        obj: Address,
        needs_tracing: impl Fn(Address) -> bool,
    ) -> bool {
        if !self.is_discovering() {
            return false;
        }
        let referent = mem.load_value(obj + REFERENT_OFFSET);
        referent.is_heap_ref()
            && mem.load_value(obj + NEXT_OFFSET).is_null()
            && needs_tracing(referent.address())
    }

    /// Processes every discovered reference. Cleared weak and soft references
    /// and finalizable references are linked onto `pending`.
    pub fn process_discovered(
        &self,
        mem: &HeapMemory,
        discovered: &[Address],
        pending: &mut Value,
        ctx: &mut dyn ReferenceContext,
    ) -> ReferenceStats {
        let mut stats = ReferenceStats {
            discovered: discovered.len(),
            ..ReferenceStats::default()
        };
        let of_type = |ty: ReferenceType| {
            discovered
                .iter()
                .copied()
                .filter(move |&obj| oop::describe(mem, obj).kind == ObjectKind::Reference(ty))
        };

        for obj in of_type(ReferenceType::Soft) {
            let slot = obj + REFERENT_OFFSET;
            if self.referent_alive(mem, slot, ctx) || !self.clear_all_soft_refs {
                ctx.keep_alive(slot);
                stats.kept_alive += 1;
            } else {
                clear_and_enqueue(mem, obj, pending);
                stats.cleared += 1;
                stats.enqueued += 1;
            }
        }
        ctx.complete_gc();

        for obj in of_type(ReferenceType::Weak) {
            let slot = obj + REFERENT_OFFSET;
            if self.referent_alive(mem, slot, ctx) {
                ctx.keep_alive(slot);
                stats.kept_alive += 1;
            } else {
                clear_and_enqueue(mem, obj, pending);
                stats.cleared += 1;
                stats.enqueued += 1;
            }
        }

        for obj in of_type(ReferenceType::Final) {
            let slot = obj + REFERENT_OFFSET;
            let alive = self.referent_alive(mem, slot, ctx);
            ctx.keep_alive(slot);
            stats.kept_alive += 1;
            if !alive {
                enqueue(mem, obj, pending);
                stats.enqueued += 1;
            }
        }
        ctx.complete_gc();

        log::debug!(
            "references: {} discovered, {} cleared, {} kept alive, {} enqueued",
            stats.discovered,
            stats.cleared,
            stats.kept_alive,
            stats.enqueued
        );
        stats
    }

    fn referent_alive(&self, mem: &HeapMemory, slot: Address, ctx: &dyn ReferenceContext) -> bool {
        let referent = mem.load_value(slot);
        !referent.is_heap_ref() || ctx.is_alive(referent.address())
    }
}

fn clear_and_enqueue(mem: &HeapMemory, obj: Address, pending: &mut Value) {
    mem.store_value(obj + REFERENT_OFFSET, Value::NULL);
    enqueue(mem, obj, pending);
}

/// Links `obj` onto the pending list. A non-null `next` marks the reference
/// inactive so it is never discovered again.
fn enqueue(mem: &HeapMemory, obj: Address, pending: &mut Value) {
    let next = if pending.is_null() {
        Value::from_address(obj)
    } else {
        *pending
    };
    mem.store_value(obj + NEXT_OFFSET, next);
    *pending = Value::from_address(obj);
}

/// Unlinks the whole pending list. Each reference keeps a self-link in
/// `next` and stays inactive.
pub fn drain_pending(mem: &HeapMemory, pending: &mut Value) -> Vec<Value> {
    let mut drained = Vec::new();
    let mut cur = std::mem::replace(pending, Value::NULL);
    while cur.is_heap_ref() {
        let obj = cur.address();
        let next = mem.load_value(obj + NEXT_OFFSET);
        mem.store_value(obj + NEXT_OFFSET, cur);
        drained.push(cur);
        if next == cur {
            break;
        }
        cur = next;
    }
    drained
}
