//! Word layout of heap objects.
//!
//! Every object starts with a two word header: the [`MarkWord`](crate::MarkWord)
//! followed by a reference to its klass. Klasses are ordinary heap objects
//! whose own klass is the self-describing klass-klass.

use crate::Value;

/// Word index into the heap reservation.
pub type Address = usize;

pub const MARK_OFFSET: usize = 0;
pub const KLASS_OFFSET: usize = 1;
pub const HEADER_WORDS: usize = 2;

pub const ARRAY_LENGTH_OFFSET: usize = 2;
pub const ARRAY_HEADER_WORDS: usize = 3;
/// Longest array whose length still fits a fixnum together with its header.
pub const MAX_ARRAY_LENGTH: usize = (1 << 62) - 1 - ARRAY_HEADER_WORDS;

pub const REFERENT_OFFSET: usize = 2;
pub const NEXT_OFFSET: usize = 3;
pub const REFERENCE_WORDS: usize = 4;

pub const KLASS_KIND_OFFSET: usize = 2;
pub const KLASS_INSTANCE_WORDS_OFFSET: usize = 3;
pub const KLASS_ID_OFFSET: usize = 4;
pub const KLASS_SUPER_OFFSET: usize = 5;
pub const KLASS_WORDS: usize = 6;

/// Smallest gap that can be turned into a filler object.
pub const MIN_FILL_WORDS: usize = HEADER_WORDS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceType {
    Soft,
    Weak,
    Final,
}

/// Shape of the instances described by a klass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Fixed number of value slots after the header.
    Instance,
    /// Length word followed by value slots.
    RefArray,
    /// Length word followed by raw, untraced words.
    WordArray,
    /// A klass descriptor.
    Klass,
    /// An instance whose first two slots are `referent` and `next`.
    Reference(ReferenceType),
}

impl ObjectKind {
    pub const fn tag(self) -> i64 {
        match self {
            ObjectKind::Instance => 0,
            ObjectKind::RefArray => 1,
            ObjectKind::WordArray => 2,
            ObjectKind::Klass => 3,
            ObjectKind::Reference(ReferenceType::Soft) => 4,
            ObjectKind::Reference(ReferenceType::Weak) => 5,
            ObjectKind::Reference(ReferenceType::Final) => 6,
        }
    }

    pub const fn from_tag(tag: i64) -> Option<Self> {
        Some(match tag {
            0 => ObjectKind::Instance,
            1 => ObjectKind::RefArray,
            2 => ObjectKind::WordArray,
            3 => ObjectKind::Klass,
            4 => ObjectKind::Reference(ReferenceType::Soft),
            5 => ObjectKind::Reference(ReferenceType::Weak),
            6 => ObjectKind::Reference(ReferenceType::Final),
            _ => return None,
        })
    }

    pub fn to_value(self) -> Value {
        Value::from_i64(self.tag())
    }

    pub fn from_value(value: Value) -> Option<Self> {
        value.as_fixnum().and_then(Self::from_tag)
    }

    pub const fn is_array(self) -> bool {
        matches!(self, ObjectKind::RefArray | ObjectKind::WordArray)
    }

    /// Object size in words. `instance_words` comes from the klass and
    /// `length` from the array length slot; each is ignored when the kind
    /// does not use it.
    pub const fn size(self, instance_words: usize, length: usize) -> usize {
        match self {
            ObjectKind::RefArray | ObjectKind::WordArray => ARRAY_HEADER_WORDS + length,
            ObjectKind::Klass => KLASS_WORDS,
            ObjectKind::Instance | ObjectKind::Reference(_) => instance_words,
        }
    }
}
