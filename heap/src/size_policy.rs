//! Generation sizing decisions fed by collection statistics.

use std::time::Duration;

use crate::HeapSettings;

/// Exponentially weighted average with a padded estimate of its spread.
///
/// Early samples are weighted more heavily so the average warms up quickly.
#[derive(Debug, Clone)]
pub struct AdaptiveWeightedAverage {
    weight: f64,
    padding: f64,
    average: f64,
    deviation: f64,
    samples: u32,
}

impl AdaptiveWeightedAverage {
    /// `weight` is the percentage given to each new sample.
    pub fn new(weight: u32, padding: f64) -> Self {
        Self {
            weight: weight as f64,
            padding,
            average: 0.0,
            deviation: 0.0,
            samples: 0,
        }
    }

    pub fn sample(&mut self, value: f64) {
        self.samples = self.samples.saturating_add(1);
        let weight = self.weight.max(100.0 / self.samples as f64);
        let decay = |old: f64, new: f64| ((100.0 - weight) * old + weight * new) / 100.0;
        self.average = decay(self.average, value);
        self.deviation = decay(self.deviation, (value - self.average).abs());
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn padded_average(&self) -> f64 {
        self.average + self.padding * self.deviation
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// Consumes collection statistics and recommends sizes. The collectors only
/// feed it and apply its answers.
pub trait SizePolicy: Send {
    /// Padded estimate of words promoted by the next scavenge.
    fn padded_average_promoted(&self) -> usize;

    /// Whether the next scavenge should be replaced by a full collection
    /// because the old generation may not absorb its promotions.
    fn should_full_gc(&self, old_free: usize, young_used: usize) -> bool {
        self.padded_average_promoted().min(young_used) > old_free
    }

    /// Records a finished scavenge and returns the next tenuring threshold.
    fn minor_collection_end(
        &mut self,
        promoted: usize,
        survived: usize,
        survivor_capacity: usize,
        tenuring_threshold: u8,
    ) -> u8;

    /// Records a finished full collection.
    fn major_collection_end(&mut self, old_live: usize, young_live: usize);

    /// Committed old generation size to aim for after a full collection.
    fn desired_old_capacity(&self, old_live: usize) -> usize;

    fn set_words_absorbed_from_eden(&mut self, words: usize);

    /// Records one collection pause and the mutator time that preceded it.
    fn record_gc_cost(&mut self, _pause: Duration, _mutator: Duration) {}

    /// Called after every full collection with the free share of old and
    /// eden and the share of the heap it reclaimed, in percent. Returns true
    /// when allocations should give up.
    fn check_gc_overhead_limit(&mut self, _sample: OverheadSample) -> bool {
        false
    }
}

/// Free and reclaimed shares after a full collection, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverheadSample {
    pub old_free: usize,
    pub eden_free: usize,
    pub reclaimed: usize,
}

/// When full collections count as wasted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcOverheadLimit {
    pub time_limit: usize,
    pub heap_free_limit: usize,
    pub threshold: usize,
}

impl GcOverheadLimit {
    pub fn from_settings(settings: &HeapSettings) -> Option<Self> {
        settings.use_gc_overhead_limit.then_some(Self {
            time_limit: settings.gc_time_limit,
            heap_free_limit: settings.gc_heap_free_limit,
            threshold: settings.gc_overhead_limit_threshold,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveSizePolicy {
    avg_promoted: AdaptiveWeightedAverage,
    avg_survived: AdaptiveWeightedAverage,
    avg_old_live: AdaptiveWeightedAverage,
    max_tenuring_threshold: u8,
    /// Percentage of a survivor space survivors should fill at most.
    target_survivor_ratio: usize,
    /// Extra old generation room, as a percentage of live data.
    min_old_free_ratio: usize,
    absorbed_from_eden: usize,
    avg_gc_cost: AdaptiveWeightedAverage,
    overhead_limit: Option<GcOverheadLimit>,
    /// Consecutive full collections that counted as overhead.
    overhead_count: usize,
}

impl AdaptiveSizePolicy {
    pub fn new(max_tenuring_threshold: u8) -> Self {
        Self {
            avg_promoted: AdaptiveWeightedAverage::new(25, 3.0),
            avg_survived: AdaptiveWeightedAverage::new(25, 3.0),
            avg_old_live: AdaptiveWeightedAverage::new(50, 0.0),
            max_tenuring_threshold,
            target_survivor_ratio: 50,
            min_old_free_ratio: 40,
            absorbed_from_eden: 0,
            avg_gc_cost: AdaptiveWeightedAverage::new(25, 0.0),
            overhead_limit: None,
            overhead_count: 0,
        }
    }

    pub fn with_gc_overhead_limit(mut self, limit: Option<GcOverheadLimit>) -> Self {
        self.overhead_limit = limit;
        self
    }

    /// Fraction of recent wall-clock time spent in collections.
    pub fn gc_cost(&self) -> f64 {
        self.avg_gc_cost.average()
    }

    pub fn absorbed_from_eden(&self) -> usize {
        self.absorbed_from_eden
    }
}

impl SizePolicy for AdaptiveSizePolicy {
    fn padded_average_promoted(&self) -> usize {
        self.avg_promoted.padded_average().ceil() as usize
    }

    fn minor_collection_end(
        &mut self,
        promoted: usize,
        survived: usize,
        survivor_capacity: usize,
        tenuring_threshold: u8,
    ) -> u8 {
        self.avg_promoted.sample(promoted as f64);
        self.avg_survived.sample(survived as f64);

        let target = survivor_capacity * self.target_survivor_ratio / 100;
        let padded_survived = self.avg_survived.padded_average() as usize;
        let threshold = if padded_survived > target {
            tenuring_threshold.saturating_sub(1).max(1)
        } else if promoted > 0 && padded_survived < target / 2 {
            (tenuring_threshold + 1).min(self.max_tenuring_threshold)
        } else {
            tenuring_threshold
        };
        if threshold != tenuring_threshold {
            log::debug!("tenuring threshold {tenuring_threshold} -> {threshold}");
        }
        threshold
    }

    fn major_collection_end(&mut self, old_live: usize, young_live: usize) {
        self.avg_old_live.sample(old_live as f64);
        log::trace!("major collection end: old live {old_live}, young live {young_live}");
    }

    fn desired_old_capacity(&self, old_live: usize) -> usize {
        let free = (old_live * self.min_old_free_ratio / 100).max(self.padded_average_promoted() * 2);
        old_live + free
    }

    fn set_words_absorbed_from_eden(&mut self, words: usize) {
        self.absorbed_from_eden += words;
    }

    fn record_gc_cost(&mut self, pause: Duration, mutator: Duration) {
        let total = (pause + mutator).as_secs_f64();
        let cost = if total > 0.0 { pause.as_secs_f64() / total } else { 0.0 };
        self.avg_gc_cost.sample(cost);
    }

    /// A full collection is overhead when collections dominate the run
    /// time, eden stays full, and old is full or nothing was reclaimed.
    fn check_gc_overhead_limit(&mut self, sample: OverheadSample) -> bool {
        let Some(limit) = self.overhead_limit else {
            return false;
        };
        let cost_percent = (self.gc_cost() * 100.0) as usize;
        let free = limit.heap_free_limit;
        let overhead = cost_percent >= limit.time_limit
            && sample.eden_free < free
            && (sample.old_free < free || sample.reclaimed < free);
        if !overhead {
            self.overhead_count = 0;
            return false;
        }
        self.overhead_count += 1;
        log::debug!(
            "full collection {} of {} without progress: gc cost {cost_percent}%, {sample:?}",
            self.overhead_count,
            limit.threshold
        );
        if self.overhead_count < limit.threshold {
            return false;
        }
        self.overhead_count = 0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_the_average() {
        let mut avg = AdaptiveWeightedAverage::new(25, 2.0);
        avg.sample(100.0);
        assert_eq!(avg.average(), 100.0);
        assert_eq!(avg.padded_average(), 100.0);
    }

    #[test]
    fn padding_grows_with_variance() {
        let mut avg = AdaptiveWeightedAverage::new(25, 2.0);
        for v in [10.0, 90.0, 10.0, 90.0] {
            avg.sample(v);
        }
        assert!(avg.padded_average() > avg.average());
    }

    #[test]
    fn full_gc_when_old_cannot_take_promotions() {
        let mut policy = AdaptiveSizePolicy::new(15);
        policy.minor_collection_end(1000, 0, 100, 7);
        assert!(policy.should_full_gc(10, 100_000));
        assert!(!policy.should_full_gc(10, 5));
        assert!(!policy.should_full_gc(100_000, 100_000));
    }

    #[test]
    fn overhead_limit_needs_consecutive_wasted_collections() {
        let limit = GcOverheadLimit {
            time_limit: 50,
            heap_free_limit: 10,
            threshold: 3,
        };
        let mut policy = AdaptiveSizePolicy::new(15).with_gc_overhead_limit(Some(limit));
        policy.record_gc_cost(Duration::from_millis(90), Duration::from_millis(10));
        assert!(policy.gc_cost() > 0.5);

        let full = OverheadSample {
            old_free: 5,
            eden_free: 5,
            reclaimed: 50,
        };
        assert!(!policy.check_gc_overhead_limit(full));
        assert!(!policy.check_gc_overhead_limit(full));
        // one collection that frees enough eden starts the count over
        assert!(!policy.check_gc_overhead_limit(OverheadSample {
            eden_free: 50,
            ..full
        }));
        assert!(!policy.check_gc_overhead_limit(full));
        assert!(!policy.check_gc_overhead_limit(full));
        assert!(policy.check_gc_overhead_limit(full));
        assert!(!policy.check_gc_overhead_limit(full));

        // old has room, but a collection that reclaims nothing still counts
        let stuck = OverheadSample {
            old_free: 40,
            eden_free: 0,
            reclaimed: 0,
        };
        assert!(!policy.check_gc_overhead_limit(OverheadSample {
            reclaimed: 30,
            ..stuck
        }));
        assert!(!policy.check_gc_overhead_limit(stuck));
        assert!(!policy.check_gc_overhead_limit(stuck));
        assert!(policy.check_gc_overhead_limit(stuck));
    }

    #[test]
    fn cheap_collections_are_not_overhead() {
        let limit = GcOverheadLimit {
            time_limit: 50,
            heap_free_limit: 10,
            threshold: 1,
        };
        let mut policy = AdaptiveSizePolicy::new(15).with_gc_overhead_limit(Some(limit));
        let nothing_free = OverheadSample {
            old_free: 0,
            eden_free: 0,
            reclaimed: 0,
        };
        policy.record_gc_cost(Duration::from_millis(1), Duration::from_millis(99));
        assert!(!policy.check_gc_overhead_limit(nothing_free));

        let mut disabled = AdaptiveSizePolicy::new(15);
        disabled.record_gc_cost(Duration::from_millis(99), Duration::from_millis(1));
        assert!(!disabled.check_gc_overhead_limit(nothing_free));
    }

    #[test]
    fn threshold_drops_when_survivors_overflow() {
        let mut policy = AdaptiveSizePolicy::new(15);
        assert_eq!(policy.minor_collection_end(0, 900, 1000, 7), 6);
        let mut policy = AdaptiveSizePolicy::new(15);
        assert_eq!(policy.minor_collection_end(10, 0, 1000, 7), 8);
    }
}
