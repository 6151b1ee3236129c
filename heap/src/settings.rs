use object::MarkWord;

use crate::{HeapError, HeapResult};

/// Configuration for the generational heap. All sizes are in words.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Reserved size of the permanent generation (klass descriptors).
    pub perm_size: usize,
    /// Reserved size of the old generation.
    pub old_size: usize,
    /// Committed size of the old generation at startup.
    pub old_initial_size: usize,
    /// Reserved size of the young generation.
    pub young_size: usize,
    /// Committed size of the young generation at startup.
    pub young_initial_size: usize,
    /// Lower bound on the young generation when eden is absorbed into old.
    pub min_young_size: usize,
    /// Eden is `survivor_ratio` times the size of one survivor space.
    pub survivor_ratio: usize,
    /// Words covered by one card. Must be a power of two.
    pub card_size: usize,
    /// Generation boundaries move in multiples of this. Must be a multiple of `card_size`.
    pub generation_alignment: usize,
    /// Size of a thread-local allocation buffer carved out of eden.
    pub tlab_size: usize,
    /// Number of parallel collector threads.
    pub parallel_gc_threads: usize,
    /// Local work queue capacity before entries spill into the shared overflow.
    pub task_queue_capacity: usize,
    pub initial_tenuring_threshold: u8,
    pub max_tenuring_threshold: u8,
    /// Run a scavenge before every policy-driven full collection.
    pub scavenge_before_full_gc: bool,
    pub use_adaptive_size_policy: bool,
    /// Allow the old generation to grow into the young generation's memory.
    pub use_adaptive_gc_boundary: bool,
    /// Percentage of the old generation that may stay as dead space in the dense prefix.
    pub mark_sweep_dead_ratio: usize,
    /// Percentage of the perm generation that may stay as dead space in the dense prefix.
    pub perm_mark_sweep_dead_ratio: usize,
    /// Every n-th full collection compacts without leaving dead space.
    pub mark_sweep_always_compact_count: usize,
    /// Fail allocations once full collections keep running without freeing memory.
    pub use_gc_overhead_limit: bool,
    /// Percentage of time spent collecting at which a full collection counts as overhead.
    pub gc_time_limit: usize,
    /// A full collection counts as overhead when it leaves less than this percentage
    /// of old and of eden free.
    pub gc_heap_free_limit: usize,
    /// Consecutive overhead full collections before an allocation fails.
    pub gc_overhead_limit_threshold: usize,
    pub verify_before_gc: bool,
    pub verify_after_gc: bool,
    /// Overwrite freed memory with a recognizable pattern.
    pub zap_unused_heap_area: bool,
}

impl Default for HeapSettings {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get().min(8))
            .unwrap_or(1);
        Self {
            perm_size: 65_536,          // 512 KB
            old_size: 4_194_304,        // 32 MB
            old_initial_size: 4_194_304,
            young_size: 2_097_152,      // 16 MB
            young_initial_size: 2_097_152,
            min_young_size: 262_144,    // 2 MB
            survivor_ratio: 8,
            card_size: 64,              // 512 bytes
            generation_alignment: 8_192, // 64 KB
            tlab_size: 2_048,
            parallel_gc_threads: threads,
            task_queue_capacity: 16_384,
            initial_tenuring_threshold: 7,
            max_tenuring_threshold: 15,
            scavenge_before_full_gc: true,
            use_adaptive_size_policy: true,
            use_adaptive_gc_boundary: false,
            mark_sweep_dead_ratio: 5,
            perm_mark_sweep_dead_ratio: 20,
            mark_sweep_always_compact_count: 4,
            use_gc_overhead_limit: true,
            gc_time_limit: 98,
            gc_heap_free_limit: 2,
            gc_overhead_limit_threshold: 5,
            verify_before_gc: false,
            verify_after_gc: false,
            zap_unused_heap_area: false,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> HeapResult<()> {
        let err = |msg| Err(HeapError::InvalidSettings(msg));

        if self.perm_size == 0 || self.old_size == 0 || self.young_size == 0 {
            return err("generation sizes must be > 0");
        }
        if !self.card_size.is_power_of_two() {
            return err("card_size must be a power of two");
        }
        if self.generation_alignment == 0
            || !self.generation_alignment.is_multiple_of(self.card_size)
        {
            return err("generation_alignment must be a multiple of card_size");
        }
        let aligned = |n: usize| n.is_multiple_of(self.generation_alignment);
        if !aligned(self.perm_size)
            || !aligned(self.old_size)
            || !aligned(self.old_initial_size)
            || !aligned(self.young_size)
            || !aligned(self.young_initial_size)
        {
            return err("generation sizes must be multiples of generation_alignment");
        }
        if self.old_initial_size == 0 || self.old_initial_size > self.old_size {
            return err("old_initial_size must be in (0, old_size]");
        }
        if self.young_initial_size > self.young_size {
            return err("young_initial_size must not exceed young_size");
        }
        if self.min_young_size > self.young_initial_size {
            return err("min_young_size must not exceed young_initial_size");
        }
        if self.survivor_ratio == 0 {
            return err("survivor_ratio must be > 0");
        }
        if self.young_initial_size / (self.survivor_ratio + 2) < self.card_size {
            return err("young generation too small for its survivor spaces");
        }
        if self.tlab_size == 0 {
            return err("tlab_size must be > 0");
        }
        if self.parallel_gc_threads == 0 {
            return err("parallel_gc_threads must be > 0");
        }
        if self.task_queue_capacity < 2 {
            return err("task_queue_capacity must be >= 2");
        }
        if self.max_tenuring_threshold > MarkWord::MAX_AGE
            || self.initial_tenuring_threshold > self.max_tenuring_threshold
        {
            return err("tenuring thresholds must satisfy initial <= max <= 15");
        }
        if self.mark_sweep_dead_ratio > 100 || self.perm_mark_sweep_dead_ratio > 100 {
            return err("dead ratios are percentages");
        }
        if self.mark_sweep_always_compact_count == 0 {
            return err("mark_sweep_always_compact_count must be > 0");
        }
        if self.gc_time_limit > 100 || self.gc_heap_free_limit > 100 {
            return err("GC overhead limits are percentages");
        }
        if self.gc_overhead_limit_threshold == 0 {
            return err("gc_overhead_limit_threshold must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert!(HeapSettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_misaligned_generation() {
        let settings = HeapSettings {
            old_size: 4_194_304 + 1,
            ..HeapSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(HeapError::InvalidSettings(_))
        ));
    }

    #[test]
    fn rejects_bad_tenuring_threshold() {
        let settings = HeapSettings {
            max_tenuring_threshold: 16,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_cards() {
        let settings = HeapSettings {
            card_size: 48,
            generation_alignment: 48 * 16,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
