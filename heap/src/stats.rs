use std::time::Duration;

use crate::GenerationKind;

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCause {
    AllocationFailure,
    PermAllocationFailure,
    /// Explicit request from the runtime.
    SystemGc,
    /// A scavenge could not place every survivor.
    PromotionFailure,
    /// A critical section blocked an earlier collection.
    GcLocker,
}

impl core::fmt::Display for GcCause {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            GcCause::AllocationFailure => "allocation failure",
            GcCause::PermAllocationFailure => "perm allocation failure",
            GcCause::SystemGc => "system gc",
            GcCause::PromotionFailure => "promotion failure",
            GcCause::GcLocker => "gc locker",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Scavenge,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A critical section was active.
    GcLockerActive,
    /// Another collection ran since the request was issued.
    Stale,
}

/// Words used and committed per generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub young_used: usize,
    pub young_capacity: usize,
    pub old_used: usize,
    pub old_capacity: usize,
    pub perm_used: usize,
    pub perm_capacity: usize,
}

impl HeapUsage {
    pub fn total_used(&self) -> usize {
        self.young_used + self.old_used + self.perm_used
    }
}

impl core::fmt::Display for HeapUsage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "young {}/{} old {}/{} perm {}/{} words",
            self.young_used,
            self.young_capacity,
            self.old_used,
            self.old_capacity,
            self.perm_used,
            self.perm_capacity
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSummary {
    pub kind: CollectionKind,
    pub cause: GcCause,
    pub before: HeapUsage,
    pub after: HeapUsage,
    pub duration: Duration,
    pub promotion_failed: bool,
    /// Eden words handed to the old generation by a full collection.
    pub absorbed_from_eden: usize,
}

impl core::fmt::Display for CollectionSummary {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self.kind {
            CollectionKind::Scavenge => "scavenge",
            CollectionKind::Full => "full",
        };
        write!(
            f,
            "[{kind} ({})] {} -> {} words in {:?}",
            self.cause,
            self.before.total_used(),
            self.after.total_used(),
            self.duration
        )?;
        if self.promotion_failed {
            f.write_str(" (promotion failed)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionOutcome {
    Completed(CollectionSummary),
    Skipped(SkipReason),
}

impl CollectionOutcome {
    pub fn completed(&self) -> Option<&CollectionSummary> {
        match self {
            CollectionOutcome::Completed(summary) => Some(summary),
            CollectionOutcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CollectionOutcome::Skipped(_))
    }
}

/// Full collection phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Mark,
    Precompact,
    Adjust,
    Compact,
}

/// One step of a full collection, in execution order. Whole-heap steps
/// carry no generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub generation: Option<GenerationKind>,
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Collections that ran, of either kind.
    pub total_collections: usize,
    pub full_collections: usize,
    pub scavenges: usize,
    pub skipped: usize,
    pub promotion_failures: usize,
    pub total_pause: Duration,
    pub last: Option<CollectionSummary>,
    /// Generation steps of the most recent full collection.
    pub last_phase_trace: Vec<PhaseEvent>,
}

impl GcStats {
    pub(crate) fn record(&mut self, summary: CollectionSummary) {
        self.total_collections += 1;
        match summary.kind {
            CollectionKind::Scavenge => self.scavenges += 1,
            CollectionKind::Full => self.full_collections += 1,
        }
        if summary.promotion_failed {
            self.promotion_failures += 1;
        }
        self.total_pause += summary.duration;
        log::info!("{summary}");
        self.last = Some(summary);
    }
}

impl core::fmt::Display for GcStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} collections ({} scavenges, {} full, {} skipped, {} promotion failures), total pause {:?}",
            self.total_collections,
            self.scavenges,
            self.full_collections,
            self.skipped,
            self.promotion_failures,
            self.total_pause
        )
    }
}
