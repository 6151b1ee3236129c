//! Whole-heap consistency check, run around collections when enabled.

use ahash::AHashSet;
use object::{
    ARRAY_LENGTH_OFFSET, Address, KLASS_INSTANCE_WORDS_OFFSET, KLASS_KIND_OFFSET, ObjectKind, Value,
};

use crate::{Heap, HeapError, HeapResult, IterateFlags, Space, TenuredGen, oop};

fn fail<T>(msg: String) -> HeapResult<T> {
    Err(HeapError::Verification(msg))
}

impl Heap {
    /// Checks that every space is parsable, every object has a valid klass
    /// and a normal mark, every reference field points at an object start,
    /// start arrays know every tenured object, and every old-to-young
    /// pointer sits on a dirty card.
    pub fn verify(&self) -> HeapResult<()> {
        self.verify_layout()?;

        let mut starts = AHashSet::new();
        for (space, generation) in self.all_spaces() {
            self.verify_space(space, &mut starts)
                .map_err(|err| match err {
                    HeapError::Verification(msg) => {
                        HeapError::Verification(format!("{generation} {}: {msg}", space.name()))
                    }
                    other => other,
                })?;
        }

        let mem = &self.memory;
        for (space, _) in self.all_spaces() {
            let tenured = self.tenured_containing(space.bottom());
            self.walk_space(space, |obj| {
                if let Some(generation) = tenured {
                    if !generation.start_array().is_block_start_consistent(obj) {
                        return fail(format!("no start recorded for {obj:#x}"));
                    }
                }
                let mut result = Ok(());
                oop::oop_iterate(mem, obj, IterateFlags::KLASS | IterateFlags::REFERENT, &mut |slot| {
                    if result.is_err() {
                        return;
                    }
                    let value = mem.load_value(slot);
                    if !value.is_heap_ref() {
                        return;
                    }
                    if !starts.contains(&value.address()) {
                        result = fail(format!(
                            "slot {slot:#x} of {obj:#x} refers to {:#x}, not an object",
                            value.address()
                        ));
                    } else if tenured.is_some()
                        && self.young.is_in_young(value.address())
                        && !self.card_table.is_dirty(slot)
                    {
                        result = fail(format!(
                            "slot {slot:#x} refers to young {:#x} on a clean card",
                            value.address()
                        ));
                    }
                });
                result
            })?;
        }
        Ok(())
    }

    fn all_spaces(&self) -> impl Iterator<Item = (&Space, crate::GenerationKind)> {
        let [eden, s0, s1] = self.young.spaces();
        [
            (self.perm.space(), self.perm.kind()),
            (self.old.space(), self.old.kind()),
            (eden, crate::GenerationKind::Young),
            (s0, crate::GenerationKind::Young),
            (s1, crate::GenerationKind::Young),
        ]
        .into_iter()
    }

    fn tenured_containing(&self, addr: Address) -> Option<&TenuredGen> {
        [&self.perm, &self.old]
            .into_iter()
            .find(|generation| generation.contains(addr))
    }

    fn verify_layout(&self) -> HeapResult<()> {
        let perm = self.perm.virtual_space();
        let old = self.old.virtual_space();
        let young = self.young.virtual_space();
        if perm.high_boundary > old.low_boundary {
            return fail(format!(
                "perm ends at {:#x} above old start {:#x}",
                perm.high_boundary, old.low_boundary
            ));
        }
        if old.high_boundary > young.low_boundary {
            return fail(format!(
                "old ends at {:#x} above young start {:#x}",
                old.high_boundary, young.low_boundary
            ));
        }
        for (space, generation) in self.all_spaces() {
            if !(space.bottom() <= space.top() && space.top() <= space.end()) {
                return fail(format!(
                    "{generation} {} bounds out of order: {:#x} {:#x} {:#x}",
                    space.name(),
                    space.bottom(),
                    space.top(),
                    space.end()
                ));
            }
        }
        Ok(())
    }

    /// Walks `space` up to its top, skipping the unallocated part of the
    /// current TLAB.
    fn walk_space(
        &self,
        space: &Space,
        mut f: impl FnMut(Address) -> HeapResult<()>,
    ) -> HeapResult<()> {
        let tlab = self.tlab_unused();
        let mut q = space.bottom();
        while q < space.top() {
            if q == tlab.start && tlab.start < tlab.end {
                q = tlab.end;
                continue;
            }
            f(q)?;
            q += oop::object_size(&self.memory, q);
        }
        Ok(())
    }

    /// Checks headers and sizes of every object in `space`, collecting the
    /// object starts.
    fn verify_space(&self, space: &Space, starts: &mut AHashSet<Address>) -> HeapResult<()> {
        let mem = &self.memory;
        self.walk_space(space, |obj| {
            let mark = mem.mark(obj);
            if mark.is_gc_state() {
                return fail(format!("{obj:#x} has mark {:?} outside a collection", mark.state()));
            }
            let klass = mem.klass(obj);
            self.verify_klass(obj, klass)?;
            let size = self.checked_size(obj, klass)?;
            if obj + size > space.top() {
                return fail(format!("{obj:#x} of {size} words runs past top {:#x}", space.top()));
            }
            starts.insert(obj);
            Ok(())
        })
    }

    fn verify_klass(&self, obj: Address, klass: Value) -> HeapResult<()> {
        if !klass.is_heap_ref() || !self.perm.space().is_in_used(klass.address()) {
            return fail(format!("{obj:#x} has klass {klass:?} outside perm"));
        }
        let meta = self.memory.klass(klass.address());
        if meta != self.universe.klass_klass {
            return fail(format!("klass {:#x} of {obj:#x} is not a klass", klass.address()));
        }
        Ok(())
    }

    /// Object size computed without trusting the klass fields.
    fn checked_size(&self, obj: Address, klass: Value) -> HeapResult<usize> {
        let mem = &self.memory;
        let tag = mem.load_value(klass.address() + KLASS_KIND_OFFSET);
        let Some(kind) = ObjectKind::from_value(tag) else {
            return fail(format!("klass {:#x} has kind {tag:?}", klass.address()));
        };
        if kind.is_array() {
            match mem.load_value(obj + ARRAY_LENGTH_OFFSET).as_fixnum() {
                Some(len) if len >= 0 => {}
                other => return fail(format!("array {obj:#x} has length {other:?}")),
            }
        } else if kind != ObjectKind::Klass {
            let words = mem.load_value(klass.address() + KLASS_INSTANCE_WORDS_OFFSET);
            if !words.as_fixnum().is_some_and(|n| n >= object::HEADER_WORDS as i64) {
                return fail(format!("klass {:#x} has size {words:?}", klass.address()));
            }
        }
        Ok(oop::object_size(mem, obj))
    }
}
