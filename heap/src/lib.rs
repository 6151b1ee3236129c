mod barrier;
mod card_table;
mod error;
pub mod forwarding;
mod gc_locker;
mod generation;
mod heap;
mod mark_sweep;
mod memory;
pub mod oop;
mod preserved;
pub mod references;
pub mod roots;
mod scavenge;
mod settings;
mod size_policy;
mod space;
mod start_array;
mod stats;
mod taskqueue;
mod universe;
mod verify;
mod workers;

#[cfg(test)]
mod testing;

pub use barrier::SenseBarrier;
pub use card_table::{CLEAN_CARD, CardTable, DIRTY_CARD};
pub use error::{HeapError, HeapResult};
pub use gc_locker::{CriticalSection, GcLocker};
pub use generation::{GenerationKind, TenuredGen, VirtualSpace, YoungGen, align_up};
pub use heap::{GcRequest, Heap, HeapLayout};
pub use memory::{HeapMemory, ZAP_WORD};
pub use oop::{Fillers, IterateFlags};
pub use preserved::PreservedMarks;
pub use roots::{RootCategory, RootProvider};
pub use settings::HeapSettings;
pub use size_policy::{
    AdaptiveSizePolicy, AdaptiveWeightedAverage, GcOverheadLimit, OverheadSample, SizePolicy,
};
pub use space::Space;
pub use start_array::ObjectStartArray;
pub use stats::{
    CollectionKind, CollectionOutcome, CollectionSummary, GcCause, GcStats, HeapUsage, Phase,
    PhaseEvent, SkipReason,
};
pub use taskqueue::{LocalQueue, QueueStatsSnapshot, TaskQueueSet, Terminator};
pub use universe::Universe;
pub use workers::WorkGang;
