//! Short-lived cache in front of the subordinate fetch
//!
//! Subordinate bundles cross a process boundary and are comparatively
//! expensive to collect. A result is reused until `ttl` has passed since it
//! arrived; failures are never cached so the next poll retries.

use crate::domain::types::HistogramBundle;
use crate::infra::error::SourceError;
use crate::infra::metrics::Metrics;
use crate::io::source::HistogramSource;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

struct CachedBundles {
    fetched_at: Instant,
    bundles: Arc<Vec<HistogramBundle>>,
}

pub struct SubordinateCache {
    ttl: Duration,
    entry: Option<CachedBundles>,
}

impl SubordinateCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    /// Cached bundles if they are younger than the TTL at `now`
    pub fn get_fresh(&self, now: Instant) -> Option<Arc<Vec<HistogramBundle>>> {
        self.entry
            .as_ref()
            .filter(|entry| now.saturating_duration_since(entry.fetched_at) < self.ttl)
            .map(|entry| entry.bundles.clone())
    }

    pub fn store(&mut self, now: Instant, bundles: Vec<HistogramBundle>) -> Arc<Vec<HistogramBundle>> {
        let bundles = Arc::new(bundles);
        self.entry = Some(CachedBundles { fetched_at: now, bundles: bundles.clone() });
        bundles
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// Serve from cache or fetch through `source`, bounded by `timeout`
    pub async fn fetch<S>(
        &mut self,
        source: &S,
        timeout: Duration,
        metrics: &Metrics,
    ) -> Result<Arc<Vec<HistogramBundle>>, SourceError>
    where
        S: HistogramSource + ?Sized,
    {
        if let Some(bundles) = self.get_fresh(Instant::now()) {
            metrics.record_cache_lookup(true);
            trace!(bundles = %bundles.len(), "subordinate_cache_hit");
            return Ok(bundles);
        }
        metrics.record_cache_lookup(false);

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, source.subordinate_bundles()).await;
        metrics.record_fetch_latency(started.elapsed().as_millis() as u64);

        match result {
            Ok(Ok(bundles)) => {
                debug!(bundles = %bundles.len(), "subordinate_bundles_fetched");
                Ok(self.store(Instant::now(), bundles))
            }
            Ok(Err(e)) => {
                if !e.is_permanent() {
                    metrics.record_fetch_failure();
                }
                Err(e)
            }
            Err(_) => {
                metrics.record_fetch_failure();
                warn!(timeout_ms = %timeout.as_millis(), "subordinate_fetch_timeout");
                Err(SourceError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::source::InMemorySource;

    fn bundle(pid: &str) -> HistogramBundle {
        HistogramBundle { process_id: pid.into(), ..Default::default() }
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let mut cache = SubordinateCache::new(Duration::from_millis(300));
        let t0 = Instant::now();
        assert!(cache.get_fresh(t0).is_none());

        cache.store(t0, vec![bundle("1")]);
        assert!(cache.get_fresh(t0 + Duration::from_millis(299)).is_some());
        assert!(cache.get_fresh(t0 + Duration::from_millis(300)).is_none());

        cache.invalidate();
        assert!(cache.get_fresh(t0).is_none());
    }

    #[tokio::test]
    async fn test_second_fetch_is_served_from_cache() {
        let source = InMemorySource::new();
        source.set_subordinates(vec![bundle("1")]);
        let metrics = Metrics::new();
        let mut cache = SubordinateCache::new(Duration::from_secs(10));

        let first = cache.fetch(&source, Duration::from_secs(1), &metrics).await.unwrap();
        source.set_subordinates(vec![bundle("2")]);
        let second = cache.fetch(&source, Duration::from_secs(1), &metrics).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(metrics.report().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_fetches() {
        let source = InMemorySource::new();
        source.set_subordinates(vec![bundle("1")]);
        let metrics = Metrics::new();
        let mut cache = SubordinateCache::new(Duration::ZERO);

        cache.fetch(&source, Duration::from_secs(1), &metrics).await.unwrap();
        cache.fetch(&source, Duration::from_secs(1), &metrics).await.unwrap();
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let source = InMemorySource::new();
        source.fail_subordinates(SourceError::FetchFailed("ipc".into()));
        let metrics = Metrics::new();
        let mut cache = SubordinateCache::new(Duration::from_secs(10));

        assert!(cache.fetch(&source, Duration::from_secs(1), &metrics).await.is_err());

        source.set_subordinates(vec![bundle("3")]);
        let bundles = cache.fetch(&source, Duration::from_secs(1), &metrics).await.unwrap();
        assert_eq!(bundles[0].process_id, "3");
        assert_eq!(metrics.report().fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out() {
        let source = InMemorySource::new();
        source.set_subordinates(vec![bundle("1")]);
        source.hold_fetches();
        let metrics = Metrics::new();
        let mut cache = SubordinateCache::new(Duration::from_secs(10));

        let result = cache.fetch(&source, Duration::from_millis(20), &metrics).await;
        assert_eq!(result, Err(SourceError::Timeout(Duration::from_millis(20))));
        assert!(cache.get_fresh(Instant::now()).is_none());
    }
}
