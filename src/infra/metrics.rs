//! Lock-free engine metrics and periodic reporting
//!
//! Counters are updated from the poll loop and read by the reporter and the
//! control server. All atomics use Relaxed ordering: these are statistics,
//! never used for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Poll duration bucket boundaries (microseconds)
/// Buckets: ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, ≤10000, ≤25000, ≤50000, ≤100000, >100000
const POLL_BUCKET_BOUNDS: [u64; 10] = [100, 250, 500, 1000, 2500, 5000, 10000, 25000, 50000, 100000];

/// Subordinate fetch latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
const FETCH_BUCKET_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(bounds: &[u64; 10], value: u64) -> usize {
    bounds.partition_point(|&bound| bound < value)
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Lock-free metrics collector for the poll loop
pub struct Metrics {
    /// Poll passes started (monotonic)
    polls_total: AtomicU64,
    /// Poll passes that ended in the Failed state (monotonic)
    polls_failed: AtomicU64,
    /// Subordinate fetches that failed or timed out (monotonic)
    fetch_failures: AtomicU64,
    /// Reads of a histogram the host does not provide (monotonic)
    source_unavailable: AtomicU64,
    /// Subordinate requests served from the cache
    cache_hits: AtomicU64,
    /// Subordinate requests that went to the source
    cache_misses: AtomicU64,
    /// Individual hang records reconstructed (monotonic)
    hangs_recorded: AtomicU64,
    /// Qualifying events added to the raw total (monotonic)
    qualifying_events: AtomicU64,
    /// Negative deltas or bad shapes repaired (monotonic)
    malformed_repairs: AtomicU64,
    /// Explicit clears plus deferred clears
    clears_total: AtomicU64,
    mode_switches: AtomicU64,
    poll_duration_buckets: [AtomicU64; NUM_BUCKETS],
    poll_duration_max_us: AtomicU64,
    poll_duration_sum_us: AtomicU64,
    fetch_latency_buckets: [AtomicU64; NUM_BUCKETS],
    fetch_latency_sum_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            polls_total: AtomicU64::new(0),
            polls_failed: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            source_unavailable: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            hangs_recorded: AtomicU64::new(0),
            qualifying_events: AtomicU64::new(0),
            malformed_repairs: AtomicU64::new(0),
            clears_total: AtomicU64::new(0),
            mode_switches: AtomicU64::new(0),
            poll_duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            poll_duration_max_us: AtomicU64::new(0),
            poll_duration_sum_us: AtomicU64::new(0),
            fetch_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            fetch_latency_sum_ms: AtomicU64::new(0),
        }
    }

    /// Record a completed poll pass and how long it took
    #[inline]
    pub fn record_poll(&self, duration_us: u64, failed: bool) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.polls_failed.fetch_add(1, Ordering::Relaxed);
        }
        let bucket = bucket_index(&POLL_BUCKET_BOUNDS, duration_us);
        self.poll_duration_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.poll_duration_sum_us.fetch_add(duration_us, Ordering::Relaxed);
        update_atomic_max(&self.poll_duration_max_us, duration_us);
    }

    #[inline]
    pub fn record_fetch_latency(&self, latency_ms: u64) {
        let bucket = bucket_index(&FETCH_BUCKET_BOUNDS, latency_ms);
        self.fetch_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.fetch_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_source_unavailable(&self) {
        self.source_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_hangs(&self, count: u64) {
        self.hangs_recorded.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_qualifying(&self, count: u64) {
        self.qualifying_events.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self, count: u64) {
        self.malformed_repairs.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_clear(&self) {
        self.clears_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mode_switch(&self) {
        self.mode_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all metrics (cumulative, nothing is reset)
    pub fn report(&self) -> MetricsSummary {
        let fetch_latency_buckets = load_buckets(&self.fetch_latency_buckets);
        let fetch_count: u64 = fetch_latency_buckets.iter().sum();
        let fetch_sum = self.fetch_latency_sum_ms.load(Ordering::Relaxed);
        let fetch_latency_avg_ms = if fetch_count > 0 { fetch_sum / fetch_count } else { 0 };

        MetricsSummary {
            polls_total: self.polls_total.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            source_unavailable: self.source_unavailable.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            hangs_recorded: self.hangs_recorded.load(Ordering::Relaxed),
            qualifying_events: self.qualifying_events.load(Ordering::Relaxed),
            malformed_repairs: self.malformed_repairs.load(Ordering::Relaxed),
            clears_total: self.clears_total.load(Ordering::Relaxed),
            mode_switches: self.mode_switches.load(Ordering::Relaxed),
            poll_duration_buckets: load_buckets(&self.poll_duration_buckets),
            poll_duration_max_us: self.poll_duration_max_us.load(Ordering::Relaxed),
            poll_duration_sum_us: self.poll_duration_sum_us.load(Ordering::Relaxed),
            fetch_latency_buckets,
            fetch_latency_avg_ms,
            fetch_latency_sum_ms: fetch_sum,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
pub const METRICS_POLL_BOUNDS: [u64; 10] = POLL_BUCKET_BOUNDS;
pub const METRICS_FETCH_BOUNDS: [u64; 10] = FETCH_BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub polls_total: u64,
    pub polls_failed: u64,
    pub fetch_failures: u64,
    pub source_unavailable: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hangs_recorded: u64,
    pub qualifying_events: u64,
    pub malformed_repairs: u64,
    pub clears_total: u64,
    pub mode_switches: u64,
    /// Bounds: ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, ≤10000, ≤25000, ≤50000, ≤100000, >100000 µs
    pub poll_duration_buckets: [u64; NUM_BUCKETS],
    pub poll_duration_max_us: u64,
    pub poll_duration_sum_us: u64,
    /// Bounds: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000 ms
    pub fetch_latency_buckets: [u64; NUM_BUCKETS],
    pub fetch_latency_avg_ms: u64,
    pub fetch_latency_sum_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            polls = %self.polls_total,
            polls_failed = %self.polls_failed,
            fetch_failures = %self.fetch_failures,
            unavailable = %self.source_unavailable,
            cache_hits = %self.cache_hits,
            cache_misses = %self.cache_misses,
            hangs = %self.hangs_recorded,
            qualifying = %self.qualifying_events,
            repairs = %self.malformed_repairs,
            clears = %self.clears_total,
            mode_switches = %self.mode_switches,
            poll_max_us = %self.poll_duration_max_us,
            fetch_avg_ms = %self.fetch_latency_avg_ms,
            "metrics"
        );
    }
}
