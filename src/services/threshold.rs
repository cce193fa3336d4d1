//! Threshold evaluation over bucketed histograms
//!
//! `compute_qualifying` is the pure per-histogram evaluation. `QualifyingTotals`
//! turns successive cumulative readings from one or more producers into a
//! monotonic running total of qualifying events:
//! - only per-bucket increases since the previous reading are counted, and
//!   they are judged against the threshold in force when they are observed,
//!   so a threshold change never adds or drops already-seen events
//! - each producer (main process, every subordinate process) keeps its own
//!   previous reading, so processes appearing or disappearing never double count;
//!   a subordinate's reading is forgotten once it has stopped reporting for a while
//! - a reading lower than the previous one is clamped to zero and re-baselined

use crate::domain::types::{Histogram, LowerBound, SourceId, Threshold};
use crate::services::liveness::Liveness;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Result of evaluating one histogram against a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qualifying {
    /// Sum of counts in qualifying buckets
    pub count: u64,
    /// Smallest qualifying lower bound; `None` when no bucket qualifies
    pub min_lower_bound: Option<u64>,
}

/// Count events in buckets whose lower bound passes `threshold`
pub fn compute_qualifying(histogram: &Histogram, threshold: &Threshold) -> Qualifying {
    let buckets = histogram.ranges.len().min(histogram.counts.len());
    let mut count = 0u64;
    let mut min_lower_bound: Option<u64> = None;

    for i in 0..buckets {
        let (lower, _) = histogram.bucket_bounds(i);
        if !threshold.admits(lower) {
            continue;
        }
        count = count.saturating_add(histogram.counts[i]);
        if let LowerBound::At(value) = lower {
            min_lower_bound = Some(min_lower_bound.map_or(value, |m| m.min(value)));
        }
    }

    Qualifying { count, min_lower_bound }
}

fn min_option(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Outcome of one `QualifyingTotals::observe` pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Running total after this pass
    pub total: u64,
    /// Qualifying events added by this pass
    pub added: u64,
    /// Smallest qualifying lower bound across all producers
    pub computed_threshold: Option<u64>,
    /// Readings that had to be clamped, skipped or re-baselined
    pub repairs: u64,
}

/// Monotonic running total of qualifying events across producers
#[derive(Debug, Default)]
pub struct QualifyingTotals {
    previous: FxHashMap<SourceId, Vec<u64>>,
    liveness: Liveness,
    total: u64,
}

impl QualifyingTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every producer's previous reading; the running total is kept
    pub fn reset_baselines(&mut self) {
        self.previous.clear();
        self.liveness.clear();
    }

    /// Fold a pass of readings into the running total
    ///
    /// In a `seed` pass producers seen for the first time only establish their
    /// baseline. Outside a seed pass a newly appearing producer contributes all
    /// of its qualifying counts.
    pub fn observe(
        &mut self,
        readings: &[(SourceId, &Histogram)],
        threshold: &Threshold,
        seed: bool,
    ) -> Observation {
        let mut added = 0u64;
        let mut repairs = 0u64;
        let mut computed_threshold = None;

        for (source, histogram) in readings {
            self.liveness.seen(source);
            if let Err(reason) = histogram.validate() {
                warn!(source = %source, reason = %reason, "histogram_malformed_skipped");
                repairs += 1;
                continue;
            }

            let current = compute_qualifying(histogram, threshold);
            computed_threshold = min_option(computed_threshold, current.min_lower_bound);

            match self.previous.get(source) {
                Some(previous) if previous.len() == histogram.counts.len() => {
                    let mut delta = Vec::with_capacity(previous.len());
                    for (i, (&now, &before)) in histogram.counts.iter().zip(previous).enumerate() {
                        if now < before {
                            warn!(
                                source = %source,
                                bucket = %i,
                                previous = %before,
                                current = %now,
                                "histogram_count_decreased"
                            );
                            repairs += 1;
                            delta.push(0);
                        } else {
                            delta.push(now - before);
                        }
                    }
                    let delta = Histogram { ranges: histogram.ranges.clone(), counts: delta };
                    added += compute_qualifying(&delta, threshold).count;
                }
                Some(previous) => {
                    warn!(
                        source = %source,
                        previous_buckets = %previous.len(),
                        current_buckets = %histogram.counts.len(),
                        "histogram_reshaped_rebaselined"
                    );
                    repairs += 1;
                }
                None if seed => {
                    debug!(source = %source, "histogram_baseline_seeded");
                }
                None => {
                    debug!(source = %source, qualifying = %current.count, "histogram_source_appeared");
                    added += current.count;
                }
            }

            self.previous.insert(source.clone(), histogram.counts.clone());
        }

        let expired = self.liveness.end_pass();
        if !expired.is_empty() {
            self.previous.retain(|source, _| !expired.contains(source));
        }

        self.total = self.total.saturating_add(added);

        Observation { total: self.total, added, computed_threshold, repairs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::liveness::ABSENT_PASSES_BEFORE_EXPIRY;

    fn hist(counts: &[u64]) -> Histogram {
        Histogram::new(vec![10, 20, 30], counts.to_vec())
    }

    #[test]
    fn test_bucket_boundary_inclusive() {
        let result = compute_qualifying(&hist(&[1, 3, 3]), &Threshold::inclusive(11));
        assert_eq!(result, Qualifying { count: 6, min_lower_bound: Some(11) });
    }

    #[test]
    fn test_bucket_boundary_exclusive() {
        let result = compute_qualifying(&hist(&[1, 3, 3]), &Threshold::exclusive(11));
        assert_eq!(result, Qualifying { count: 3, min_lower_bound: Some(21) });
    }

    #[test]
    fn test_leading_bucket_never_qualifies() {
        let result = compute_qualifying(&hist(&[9, 0, 0]), &Threshold::inclusive(1));
        assert_eq!(result.count, 0);
        assert_eq!(result.min_lower_bound, Some(11));
    }

    #[test]
    fn test_no_qualifying_bucket() {
        let result = compute_qualifying(&hist(&[1, 3, 3]), &Threshold::inclusive(500));
        assert_eq!(result, Qualifying { count: 0, min_lower_bound: None });
    }

    #[test]
    fn test_compute_qualifying_is_idempotent() {
        let h = hist(&[4, 8, 15]);
        let t = Threshold::inclusive(12);
        assert_eq!(compute_qualifying(&h, &t), compute_qualifying(&h, &t));
        assert_eq!(h, hist(&[4, 8, 15]));
    }

    #[test]
    fn test_mismatched_lengths_do_not_panic() {
        let h = Histogram::new(vec![10, 20], vec![1, 2, 3]);
        assert_eq!(compute_qualifying(&h, &Threshold::inclusive(11)).count, 2);
    }

    #[test]
    fn test_observe_scenario_adds_delta() {
        let mut totals = QualifyingTotals::new();
        let t = Threshold::inclusive(11);

        let first = totals.observe(&[(SourceId::Main, &hist(&[5, 2, 0]))], &t, true);
        assert_eq!(first.added, 0);
        assert_eq!(first.total, 0);

        let second = totals.observe(&[(SourceId::Main, &hist(&[5, 4, 1]))], &t, false);
        assert_eq!(second.added, 3);
        assert_eq!(second.total, 3);
        assert_eq!(second.computed_threshold, Some(11));
    }

    #[test]
    fn test_threshold_change_does_not_recount() {
        let mut totals = QualifyingTotals::new();
        totals.observe(&[(SourceId::Main, &hist(&[5, 2, 0]))], &Threshold::inclusive(21), true);

        // Lowering the threshold must not pull the 2 old events in bucket 11..20
        let lowered =
            totals.observe(&[(SourceId::Main, &hist(&[5, 2, 0]))], &Threshold::inclusive(11), false);
        assert_eq!(lowered.added, 0);

        // New events are judged against the threshold in force now
        let next =
            totals.observe(&[(SourceId::Main, &hist(&[6, 3, 1]))], &Threshold::inclusive(11), false);
        assert_eq!(next.added, 2);
        assert_eq!(next.total, 2);
    }

    #[test]
    fn test_raising_threshold_keeps_total() {
        let mut totals = QualifyingTotals::new();
        let t = Threshold::inclusive(11);
        totals.observe(&[(SourceId::Main, &hist(&[0, 0, 0]))], &t, true);
        totals.observe(&[(SourceId::Main, &hist(&[0, 4, 0]))], &t, false);

        let raised =
            totals.observe(&[(SourceId::Main, &hist(&[0, 4, 0]))], &Threshold::inclusive(21), false);
        assert_eq!(raised.added, 0);
        assert_eq!(raised.total, 4);
    }

    #[test]
    fn test_decrease_is_clamped_and_rebaselined() {
        let mut totals = QualifyingTotals::new();
        let t = Threshold::inclusive(11);
        totals.observe(&[(SourceId::Main, &hist(&[0, 5, 5]))], &t, true);

        let reset = totals.observe(&[(SourceId::Main, &hist(&[0, 1, 6]))], &t, false);
        assert_eq!(reset.added, 1);
        assert_eq!(reset.repairs, 1);

        let after = totals.observe(&[(SourceId::Main, &hist(&[0, 3, 6]))], &t, false);
        assert_eq!(after.added, 2);
        assert_eq!(after.total, 3);
    }

    #[test]
    fn test_subordinates_are_tracked_independently() {
        let mut totals = QualifyingTotals::new();
        let t = Threshold::inclusive(11);
        let a = SourceId::Subordinate("a".into());
        let b = SourceId::Subordinate("b".into());

        totals.observe(&[(SourceId::Main, &hist(&[0, 1, 0])), (a.clone(), &hist(&[0, 2, 0]))], &t, true);

        // "b" appears after the seed pass: all of its qualifying counts are new
        let pass = totals.observe(
            &[
                (SourceId::Main, &hist(&[0, 1, 0])),
                (a.clone(), &hist(&[0, 2, 1])),
                (b.clone(), &hist(&[0, 3, 0])),
            ],
            &t,
            false,
        );
        assert_eq!(pass.added, 4);

        // "a" goes away, then comes back unchanged: nothing is recounted
        totals.observe(&[(SourceId::Main, &hist(&[0, 1, 0])), (b.clone(), &hist(&[0, 3, 0]))], &t, false);
        let back = totals.observe(&[(a, &hist(&[0, 2, 1]))], &t, false);
        assert_eq!(back.added, 0);
        assert_eq!(back.total, 4);
    }

    #[test]
    fn test_exited_subordinates_are_forgotten() {
        let mut totals = QualifyingTotals::new();
        let t = Threshold::inclusive(11);
        totals.observe(&[(SourceId::Main, &hist(&[0, 0, 0]))], &t, true);

        for pid in 0..1000 {
            let sub = SourceId::Subordinate(pid.to_string());
            totals.observe(&[(SourceId::Main, &hist(&[0, 0, 0])), (sub, &hist(&[0, 1, 0]))], &t, false);
        }
        // Main plus the subordinates still inside the retention window
        assert_eq!(totals.previous.len(), 1 + ABSENT_PASSES_BEFORE_EXPIRY as usize);
        assert!(totals.previous.contains_key(&SourceId::Main));
    }

    #[test]
    fn test_reshaped_histogram_is_rebaselined() {
        let mut totals = QualifyingTotals::new();
        let t = Threshold::inclusive(11);
        totals.observe(&[(SourceId::Main, &hist(&[0, 1, 0]))], &t, true);

        let wider = Histogram::new(vec![10, 20, 30, 40], vec![0, 2, 0, 9]);
        let pass = totals.observe(&[(SourceId::Main, &wider)], &t, false);
        assert_eq!(pass.added, 0);
        assert_eq!(pass.repairs, 1);

        let next = Histogram::new(vec![10, 20, 30, 40], vec![0, 2, 0, 10]);
        assert_eq!(totals.observe(&[(SourceId::Main, &next)], &t, false).added, 1);
    }

    #[test]
    fn test_malformed_reading_is_skipped() {
        let mut totals = QualifyingTotals::new();
        let t = Threshold::inclusive(11);
        totals.observe(&[(SourceId::Main, &hist(&[0, 1, 0]))], &t, true);

        let broken = Histogram::new(vec![10, 20], vec![0, 1, 7]);
        let pass = totals.observe(&[(SourceId::Main, &broken)], &t, false);
        assert_eq!(pass.added, 0);
        assert_eq!(pass.repairs, 1);

        // Baseline from before the malformed reading is still in force
        assert_eq!(totals.observe(&[(SourceId::Main, &hist(&[0, 2, 0]))], &t, false).added, 1);
    }

    #[test]
    fn test_reset_baselines_keeps_total() {
        let mut totals = QualifyingTotals::new();
        let t = Threshold::inclusive(11);
        totals.observe(&[(SourceId::Main, &hist(&[0, 0, 0]))], &t, true);
        totals.observe(&[(SourceId::Main, &hist(&[0, 2, 0]))], &t, false);
        totals.reset_baselines();

        let seeded = totals.observe(&[(SourceId::Main, &hist(&[0, 9, 9]))], &t, true);
        assert_eq!(seeded.added, 0);
        assert_eq!(seeded.total, 2);
    }
}
