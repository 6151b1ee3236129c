//! Object sizing and field iteration, dispatched through the klass.

use bitflags::bitflags;
use object::{
    ARRAY_HEADER_WORDS, ARRAY_LENGTH_OFFSET, Address, HEADER_WORDS, KLASS_INSTANCE_WORDS_OFFSET,
    KLASS_KIND_OFFSET, KLASS_OFFSET, KLASS_SUPER_OFFSET, MIN_FILL_WORDS, MarkWord, NEXT_OFFSET,
    ObjectKind, REFERENT_OFFSET, Value,
};

use crate::HeapMemory;

bitflags! {
    /// Which non-field slots an iteration visits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IterateFlags: u8 {
        /// The header's klass slot.
        const KLASS = 1 << 0;
        /// The referent of reference objects. Left out while references are discovered.
        const REFERENT = 1 << 1;
    }
}

/// Klasses used to plug holes so every space stays parsable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fillers {
    /// Two word instance klass.
    pub object: Value,
    /// Word array klass for anything larger.
    pub array: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub kind: ObjectKind,
    pub size: usize,
}

pub fn klass_kind(mem: &HeapMemory, klass: Value) -> ObjectKind {
    assert!(klass.is_heap_ref(), "object without klass: {klass:?}");
    let tag = mem.load_value(klass.address() + KLASS_KIND_OFFSET);
    match ObjectKind::from_value(tag) {
        Some(kind) => kind,
        None => panic!("corrupt klass at {:#x}: kind {tag:?}", klass.address()),
    }
}

pub fn klass_instance_words(mem: &HeapMemory, klass: Value) -> usize {
    let words = mem.load_value(klass.address() + KLASS_INSTANCE_WORDS_OFFSET);
    match words.as_fixnum() {
        Some(n) if n >= HEADER_WORDS as i64 => n as usize,
        _ => panic!("corrupt klass at {:#x}: instance words {words:?}", klass.address()),
    }
}

pub fn array_length(mem: &HeapMemory, obj: Address) -> usize {
    let len = mem.load_value(obj + ARRAY_LENGTH_OFFSET);
    match len.as_fixnum() {
        Some(n) if n >= 0 => n as usize,
        _ => panic!("corrupt array at {obj:#x}: length {len:?}"),
    }
}

/// Kind and size of `obj`, using `klass` instead of the header's klass slot.
pub fn describe_with_klass(mem: &HeapMemory, obj: Address, klass: Value) -> ObjectInfo {
    let kind = klass_kind(mem, klass);
    let size = match kind {
        ObjectKind::RefArray | ObjectKind::WordArray => {
            kind.size(0, array_length(mem, obj))
        }
        ObjectKind::Klass => kind.size(0, 0),
        ObjectKind::Instance | ObjectKind::Reference(_) => {
            kind.size(klass_instance_words(mem, klass), 0)
        }
    };
    ObjectInfo { kind, size }
}

#[inline]
pub fn describe(mem: &HeapMemory, obj: Address) -> ObjectInfo {
    describe_with_klass(mem, obj, mem.klass(obj))
}

#[inline]
pub fn object_size(mem: &HeapMemory, obj: Address) -> usize {
    describe(mem, obj).size
}

/// Calls `f` with the address of every reference-carrying slot of `obj`.
///
/// Kind and size are read before `f` runs, so `f` may rewrite the klass slot.
/// Returns the object size.
pub fn oop_iterate(
    mem: &HeapMemory,
    obj: Address,
    flags: IterateFlags,
    f: &mut dyn FnMut(Address),
) -> usize {
    let ObjectInfo { kind, size } = describe(mem, obj);
    if flags.contains(IterateFlags::KLASS) {
        f(obj + KLASS_OFFSET);
    }
    match kind {
        ObjectKind::Instance => {
            (obj + HEADER_WORDS..obj + size).for_each(&mut *f);
        }
        ObjectKind::RefArray => {
            (obj + ARRAY_HEADER_WORDS..obj + size).for_each(&mut *f);
        }
        ObjectKind::WordArray => {}
        ObjectKind::Klass => f(obj + KLASS_SUPER_OFFSET),
        ObjectKind::Reference(_) => {
            if flags.contains(IterateFlags::REFERENT) {
                f(obj + REFERENT_OFFSET);
            }
            f(obj + NEXT_OFFSET);
            (obj + NEXT_OFFSET + 1..obj + size).for_each(&mut *f);
        }
    }
    size
}

/// Turns `[addr, addr + words)` into a single dead-but-parsable object.
pub fn fill_with_object(mem: &HeapMemory, fillers: Fillers, addr: Address, words: usize) {
    assert!(words >= MIN_FILL_WORDS, "gap of {words} words at {addr:#x} cannot be filled");
    mem.set_mark(addr, MarkWord::prototype());
    if words == MIN_FILL_WORDS {
        mem.set_klass(addr, fillers.object);
    } else {
        mem.set_klass(addr, fillers.array);
        mem.store_value(
            addr + ARRAY_LENGTH_OFFSET,
            Value::from_i64((words - ARRAY_HEADER_WORDS) as i64),
        );
    }
}

/// Walks the objects in `[from, to)` in address order.
pub fn walk_objects(mem: &HeapMemory, from: Address, to: Address, mut f: impl FnMut(Address, usize)) {
    let mut cur = from;
    while cur < to {
        let size = object_size(mem, cur);
        f(cur, size);
        cur += size;
    }
}
