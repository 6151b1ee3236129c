//! Well-known klasses and VM-internal roots.

use object::{
    Address, HEADER_WORDS, KLASS_ID_OFFSET, KLASS_INSTANCE_WORDS_OFFSET, KLASS_KIND_OFFSET,
    KLASS_SUPER_OFFSET, KLASS_WORDS, MarkWord, ObjectKind, REFERENCE_WORDS, ReferenceType, Value,
};

use crate::{Fillers, GenerationKind, HeapError, HeapMemory, HeapResult, TenuredGen};

pub(crate) fn init_klass(
    mem: &HeapMemory,
    addr: Address,
    klass_klass: Value,
    kind: ObjectKind,
    instance_words: usize,
    id: i64,
    super_klass: Value,
) {
    mem.set_mark(addr, MarkWord::prototype());
    mem.set_klass(addr, klass_klass);
    mem.store_value(addr + KLASS_KIND_OFFSET, kind.to_value());
    mem.store_value(addr + KLASS_INSTANCE_WORDS_OFFSET, Value::from_i64(instance_words as i64));
    mem.store_value(addr + KLASS_ID_OFFSET, Value::from_i64(id));
    mem.store_value(addr + KLASS_SUPER_OFFSET, super_klass);
}

/// Bootstrap klasses live at the very bottom of the perm generation and are
/// always reachable, so they never move.
#[derive(Debug)]
pub struct Universe {
    pub klass_klass: Value,
    pub fillers: Fillers,
    pub object_array_klass: Value,
    pub word_array_klass: Value,
    pub soft_reference_klass: Value,
    pub weak_reference_klass: Value,
    pub final_reference_klass: Value,
    /// Head of the list of cleared or finalizable references, linked
    /// through their `next` slot. The tail links to itself.
    pub pending_list: Value,
    handles: Vec<Value>,
    next_klass_id: i64,
}

impl Universe {
    pub fn bootstrap(mem: &HeapMemory, perm: &TenuredGen) -> HeapResult<Self> {
        let allocate = || {
            perm.par_allocate(KLASS_WORDS).ok_or(HeapError::OutOfMemory {
                words: KLASS_WORDS,
                generation: GenerationKind::Perm,
            })
        };

        let kk = allocate()?;
        let klass_klass = Value::from_address(kk);
        init_klass(mem, kk, klass_klass, ObjectKind::Klass, KLASS_WORDS, 0, Value::NULL);

        let mut next_klass_id = 1;
        let mut define = |kind: ObjectKind, instance_words: usize| -> HeapResult<Value> {
            let addr = allocate()?;
            init_klass(mem, addr, klass_klass, kind, instance_words, next_klass_id, Value::NULL);
            next_klass_id += 1;
            Ok(Value::from_address(addr))
        };

        let filler_object = define(ObjectKind::Instance, HEADER_WORDS)?;
        let filler_array = define(ObjectKind::WordArray, 0)?;
        let object_array_klass = define(ObjectKind::RefArray, 0)?;
        let word_array_klass = define(ObjectKind::WordArray, 0)?;
        let soft = define(ObjectKind::Reference(ReferenceType::Soft), REFERENCE_WORDS)?;
        let weak = define(ObjectKind::Reference(ReferenceType::Weak), REFERENCE_WORDS)?;
        let final_ = define(ObjectKind::Reference(ReferenceType::Final), REFERENCE_WORDS)?;

        log::debug!("universe bootstrapped, perm used {} words", perm.used());

        Ok(Self {
            klass_klass,
            fillers: Fillers {
                object: filler_object,
                array: filler_array,
            },
            object_array_klass,
            word_array_klass,
            soft_reference_klass: soft,
            weak_reference_klass: weak,
            final_reference_klass: final_,
            pending_list: Value::NULL,
            handles: Vec::new(),
            next_klass_id,
        })
    }

    pub fn reference_klass(&self, ty: ReferenceType) -> Value {
        match ty {
            ReferenceType::Soft => self.soft_reference_klass,
            ReferenceType::Weak => self.weak_reference_klass,
            ReferenceType::Final => self.final_reference_klass,
        }
    }

    pub(crate) fn next_klass_id(&mut self) -> i64 {
        let id = self.next_klass_id;
        self.next_klass_id += 1;
        id
    }

    /// Keeps `value` alive and up to date across collections until the
    /// matching [`pop_handle`](Universe::pop_handle).
    pub fn push_handle(&mut self, value: Value) {
        self.handles.push(value);
    }

    pub fn pop_handle(&mut self) -> Option<Value> {
        self.handles.pop()
    }

    /// Visits every VM-internal root.
    pub fn oops_do(&mut self, f: &mut dyn FnMut(&mut Value)) {
        f(&mut self.klass_klass);
        f(&mut self.fillers.object);
        f(&mut self.fillers.array);
        f(&mut self.object_array_klass);
        f(&mut self.word_array_klass);
        f(&mut self.soft_reference_klass);
        f(&mut self.weak_reference_klass);
        f(&mut self.final_reference_klass);
        f(&mut self.pending_list);
        for handle in &mut self.handles {
            f(handle);
        }
    }
}
