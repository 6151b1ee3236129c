use thiserror::Error;

use crate::GenerationKind;

pub type HeapResult<T> = Result<T, HeapError>;

/// Recoverable heap errors. Invariant violations inside a collection are not
/// represented here; they go through [`Heap::fatal`](crate::Heap::fatal).
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),

    #[error("generation layout out of order: perm ends at {perm_end:#x}, old starts at {old_start:#x}")]
    LayoutOutOfOrder { perm_end: usize, old_start: usize },

    #[error("young generation [{start:#x}, {end:#x}) overlaps the {generation} generation")]
    YoungOverlap {
        start: usize,
        end: usize,
        generation: GenerationKind,
    },

    #[error("{generation} generation boundary {address:#x} is not aligned to {card_size}-word cards")]
    UnalignedBoundary {
        address: usize,
        generation: GenerationKind,
        card_size: usize,
    },

        #[error("out of memory allocating {words} words in the {generation} generation")]
    OutOfMemory {
        words: usize,
        generation: GenerationKind,
    },

    #[error("GC overhead limit exceeded allocating {words} words in the {generation} generation")]
    GcOverheadLimitExceeded {
        words: usize,
        generation: GenerationKind,
    },

    #[error("allocation failed while a GC critical section is active")]
    GcLockerActive,

    #[error("invalid klass {0:#x}")]
    InvalidKlass(u64),

    #[error("invalid instance size of {words} words for a {kind:?} klass")]
    InvalidInstanceSize { words: usize, kind: object::ObjectKind },

    #[error("heap verification failed: {0}")]
    Verification(String),
}
