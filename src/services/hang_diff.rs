//! Per-stack hang diffing
//!
//! Every hang site keeps a private cumulative histogram. Between two polls the
//! per-bucket increase is the number of new hangs of that duration class at
//! that site. Each new hang in a bucket the threshold admits becomes one
//! `HangRecord` in a bounded, oldest-first history.
//!
//! Baselines are keyed by producer and stack, so the same stack hanging in two
//! processes never cancels out. A subordinate's baselines are dropped once it
//! has stopped reporting for a while.

use crate::domain::types::{HangEntry, HangRecord, Histogram, SourceId, Threshold};
use crate::services::liveness::Liveness;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tracing::{debug, warn};

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Hang entries reported by one producer in one poll
pub type HangBatch = (SourceId, Vec<HangEntry>);

/// Result of one diff pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffPass {
    /// Full history after this pass, oldest first
    pub records: Vec<HangRecord>,
    /// Hangs that qualified in this pass, including any already evicted
    pub added: u64,
    /// Entries that were skipped or re-baselined
    pub repairs: u64,
}

pub struct HangDiffEngine {
    baselines: FxHashMap<(SourceId, String), Vec<u64>>,
    history: VecDeque<HangRecord>,
    capacity: usize,
    liveness: Liveness,
}

impl HangDiffEngine {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            baselines: FxHashMap::default(),
            history: VecDeque::with_capacity(capacity),
            capacity,
            liveness: Liveness::new(),
        }
    }

    /// Current history, oldest first
    pub fn history(&self) -> Vec<HangRecord> {
        self.history.iter().cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Number of (producer, stack) baselines held
    pub fn tracked_stacks(&self) -> usize {
        self.baselines.len()
    }

    /// Record current counts as baselines without emitting anything
    pub fn prime(&mut self, batches: &[HangBatch]) {
        for (source, entries) in batches {
            self.liveness.seen(source);
            for (key, histogram) in merge_entries(source, entries) {
                if histogram.validate().is_ok() {
                    self.baselines.insert((source.clone(), key), histogram.counts);
                }
            }
        }
        self.expire_absent();
        debug!(tracked = %self.baselines.len(), "hang_baselines_primed");
    }

    /// Diff `batches` against the stored baselines and append new records
    ///
    /// All records of one pass share `now` as their timestamp.
    pub fn diff(&mut self, batches: &[HangBatch], threshold: &Threshold, now: DateTime<Utc>) -> DiffPass {
        let mut added = 0u64;
        let mut repairs = 0u64;

        for (source, entries) in batches {
            self.liveness.seen(source);
            for (key, histogram) in merge_entries(source, entries) {
                if let Err(reason) = histogram.validate() {
                    warn!(source = %source, reason = %reason, "hang_entry_malformed_skipped");
                    repairs += 1;
                    continue;
                }

                let baseline_key = (source.clone(), key);
                let previous = self.baselines.get(&baseline_key).cloned();

                match previous.as_deref() {
                    Some(previous) if previous.len() != histogram.counts.len() => {
                        warn!(
                            source = %source,
                            previous_buckets = %previous.len(),
                            current_buckets = %histogram.counts.len(),
                            "hang_entry_reshaped_rebaselined"
                        );
                        repairs += 1;
                    }
                    _ => {
                        for (i, &current) in histogram.counts.iter().enumerate() {
                            let before = previous.as_ref().map_or(0, |p| p[i]);
                            if current < before {
                                debug!(
                                    source = %source,
                                    bucket = %i,
                                    previous = %before,
                                    current = %current,
                                    "hang_count_decreased"
                                );
                                repairs += 1;
                                continue;
                            }

                            let new_hangs = current - before;
                            let (lower, upper) = histogram.bucket_bounds(i);
                            if new_hangs == 0 || !threshold.admits(lower) {
                                continue;
                            }

                            added += new_hangs;
                            // Only the newest `capacity` records can survive the pass
                            let emit = new_hangs.min(self.capacity as u64);
                            for _ in 0..emit {
                                self.push(HangRecord {
                                    stack_key: baseline_key.1.clone(),
                                    lower_bound: lower,
                                    upper_bound: upper,
                                    timestamp: now,
                                    process_origin: source.origin(),
                                });
                            }
                        }
                    }
                }

                self.baselines.insert(baseline_key, histogram.counts);
            }
        }

        self.expire_absent();

        if added > 0 {
            debug!(added = %added, history = %self.history.len(), "hang_records_added");
        }

        DiffPass { records: self.history(), added, repairs }
    }

    fn expire_absent(&mut self) {
        let expired = self.liveness.end_pass();
        if !expired.is_empty() {
            self.baselines.retain(|(source, _), _| !expired.contains(source));
        }
    }

    fn push(&mut self, record: HangRecord) {
        self.history.push_back(record);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }
}

/// Group a producer's entries by stack key, summing duplicates
///
/// First-seen order is kept so records come out deterministically.
fn merge_entries(source: &SourceId, entries: &[HangEntry]) -> Vec<(String, Histogram)> {
    let mut merged: Vec<(String, Histogram)> = Vec::with_capacity(entries.len());
    let mut index: FxHashMap<String, usize> = FxHashMap::default();

    for entry in entries {
        let key = entry.stack.key();
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut merged[i].1;
                if existing.ranges == entry.histogram.ranges
                    && existing.counts.len() == entry.histogram.counts.len()
                {
                    for (sum, &count) in existing.counts.iter_mut().zip(&entry.histogram.counts) {
                        *sum = sum.saturating_add(count);
                    }
                } else {
                    warn!(source = %source, "hang_entry_duplicate_shape_mismatch");
                }
            }
            None => {
                index.insert(key.clone(), merged.len());
                merged.push((key, entry.histogram.clone()));
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{HangStack, LowerBound, ProcessOrigin};
    use crate::services::liveness::ABSENT_PASSES_BEFORE_EXPIRY;
    use chrono::TimeZone;

    fn entry(stack: &[&str], counts: &[u64]) -> HangEntry {
        HangEntry {
            stack: HangStack(stack.iter().map(|s| s.to_string()).collect()),
            histogram: Histogram::new(vec![10, 20, 30], counts.to_vec()),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_scenario_emits_one_record_per_new_hang() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let t = Threshold::inclusive(11);

        engine.prime(&[(SourceId::Main, vec![entry(&["leaf", "root"], &[5, 2, 0])])]);
        let pass = engine.diff(&[(SourceId::Main, vec![entry(&["leaf", "root"], &[5, 4, 1])])], &t, at(100));

        assert_eq!(pass.added, 3);
        assert_eq!(pass.records.len(), 3);
        assert_eq!(
            pass.records.iter().map(|r| r.lower_bound).collect::<Vec<_>>(),
            vec![LowerBound::At(11), LowerBound::At(11), LowerBound::At(21)]
        );
        assert_eq!(pass.records[2].upper_bound, 30);
        assert!(pass.records.iter().all(|r| r.stack_key == "root\nleaf"));
        assert!(pass.records.iter().all(|r| r.timestamp == at(100)));
        assert!(pass.records.iter().all(|r| r.process_origin == ProcessOrigin::Main));
    }

    #[test]
    fn test_unseen_stack_diffs_against_zero() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let pass = engine.diff(
            &[(SourceId::Main, vec![entry(&["a"], &[7, 0, 2])])],
            &Threshold::inclusive(11),
            at(1),
        );
        // Leading bucket never qualifies
        assert_eq!(pass.added, 2);
    }

    #[test]
    fn test_threshold_filters_records() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let pass = engine.diff(
            &[(SourceId::Main, vec![entry(&["a"], &[0, 3, 1])])],
            &Threshold::exclusive(11),
            at(1),
        );
        assert_eq!(pass.added, 1);
        assert_eq!(pass.records[0].lower_bound, LowerBound::At(21));
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut engine = HangDiffEngine::new(3);
        let t = Threshold::inclusive(11);
        engine.diff(&[(SourceId::Main, vec![entry(&["old"], &[0, 2, 0])])], &t, at(1));
        let pass = engine.diff(&[(SourceId::Main, vec![entry(&["new"], &[0, 2, 0])])], &t, at(2));

        assert_eq!(pass.records.len(), 3);
        assert_eq!(pass.records[0].stack_key, "old");
        assert_eq!(pass.records[1].stack_key, "new");
        assert_eq!(pass.records[2].timestamp, at(2));
    }

    #[test]
    fn test_large_increase_is_bounded_by_capacity() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let pass = engine.diff(
            &[(SourceId::Main, vec![entry(&["a"], &[0, 0, 1_000_000])])],
            &Threshold::inclusive(11),
            at(1),
        );
        assert_eq!(pass.added, 1_000_000);
        assert_eq!(pass.records.len(), DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn test_baselines_are_per_process() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let t = Threshold::inclusive(11);
        let sub = SourceId::Subordinate("12".into());

        engine.prime(&[
            (SourceId::Main, vec![entry(&["shared"], &[0, 5, 0])]),
            (sub.clone(), vec![entry(&["shared"], &[0, 1, 0])]),
        ]);
        let pass = engine.diff(
            &[
                (SourceId::Main, vec![entry(&["shared"], &[0, 5, 0])]),
                (sub, vec![entry(&["shared"], &[0, 2, 0])]),
            ],
            &t,
            at(1),
        );

        assert_eq!(pass.added, 1);
        assert_eq!(pass.records[0].process_origin, ProcessOrigin::Subordinate);
        assert_eq!(engine.tracked_stacks(), 2);
    }

    #[test]
    fn test_short_lived_processes_do_not_accumulate() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let t = Threshold::inclusive(11);

        // One live subordinate per pass, each with a fresh pid
        for pid in 0..5000 {
            let sub = SourceId::Subordinate(pid.to_string());
            engine.diff(&[(sub, vec![entry(&["work"], &[0, 0, 0])])], &t, at(pid));
        }
        assert_eq!(engine.tracked_stacks(), ABSENT_PASSES_BEFORE_EXPIRY as usize);
    }

    #[test]
    fn test_briefly_missing_process_keeps_baseline() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let t = Threshold::inclusive(11);
        let sub = SourceId::Subordinate("12".into());

        engine.prime(&[(sub.clone(), vec![entry(&["a"], &[0, 6, 0])])]);
        for i in 0..3 {
            engine.diff(&[(SourceId::Main, Vec::new())], &t, at(i));
        }
        let pass = engine.diff(&[(sub, vec![entry(&["a"], &[0, 7, 0])])], &t, at(10));
        assert_eq!(pass.added, 1);
    }

    #[test]
    fn test_main_baselines_never_expire() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let t = Threshold::inclusive(11);
        engine.prime(&[(SourceId::Main, vec![entry(&["a"], &[0, 6, 0])])]);
        for i in 0..ABSENT_PASSES_BEFORE_EXPIRY as i64 * 2 {
            engine.diff(&[], &t, at(i));
        }
        assert_eq!(engine.tracked_stacks(), 1);
    }

    #[test]
    fn test_duplicate_stacks_are_summed() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let t = Threshold::inclusive(11);
        engine.prime(&[(SourceId::Main, vec![entry(&["a"], &[0, 1, 0]), entry(&["a"], &[0, 1, 0])])]);

        let pass = engine.diff(
            &[(SourceId::Main, vec![entry(&["a"], &[0, 2, 0]), entry(&["a"], &[0, 1, 0])])],
            &t,
            at(1),
        );
        assert_eq!(pass.added, 1);
        assert_eq!(engine.tracked_stacks(), 1);
    }

    #[test]
    fn test_decrease_rebaselines_without_records() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let t = Threshold::inclusive(11);
        engine.prime(&[(SourceId::Main, vec![entry(&["a"], &[0, 4, 0])])]);

        let pass = engine.diff(&[(SourceId::Main, vec![entry(&["a"], &[0, 1, 0])])], &t, at(1));
        assert_eq!(pass.added, 0);
        assert_eq!(pass.repairs, 1);

        let pass = engine.diff(&[(SourceId::Main, vec![entry(&["a"], &[0, 2, 0])])], &t, at(2));
        assert_eq!(pass.added, 1);
    }

    #[test]
    fn test_clear_history_keeps_baselines() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let t = Threshold::inclusive(11);
        engine.diff(&[(SourceId::Main, vec![entry(&["a"], &[0, 1, 0])])], &t, at(1));
        engine.clear_history();
        assert!(engine.history().is_empty());

        let pass = engine.diff(&[(SourceId::Main, vec![entry(&["a"], &[0, 1, 0])])], &t, at(2));
        assert_eq!(pass.added, 0);
        assert!(pass.records.is_empty());
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let mut engine = HangDiffEngine::new(DEFAULT_HISTORY_CAPACITY);
        let broken = HangEntry {
            stack: HangStack(vec!["a".into()]),
            histogram: Histogram::new(vec![20, 10], vec![0, 3]),
        };
        let pass = engine.diff(&[(SourceId::Main, vec![broken])], &Threshold::inclusive(1), at(1));
        assert_eq!(pass.added, 0);
        assert_eq!(pass.repairs, 1);
        assert_eq!(engine.tracked_stacks(), 0);
    }
}
