//! Histogram source boundary
//!
//! The host performance-monitoring subsystem is reached only through
//! `HistogramSource`. Main-process reads are synchronous; subordinate bundles
//! cross a process boundary and are fetched asynchronously.

use crate::domain::types::{HangEntry, Histogram, HistogramBundle};
use crate::infra::error::SourceError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[async_trait]
pub trait HistogramSource: Send + Sync {
    /// Cumulative histogram for a named counter in the main process
    fn histogram(&self, name: &str) -> Result<Histogram, SourceError>;

    /// Per-stack hang entries recorded against a named counter
    fn hang_entries(&self, name: &str) -> Result<Vec<HangEntry>, SourceError>;

    /// Histogram bundles of every live subordinate process
    async fn subordinate_bundles(&self) -> Result<Vec<HistogramBundle>, SourceError>;
}

#[derive(Default)]
struct InMemoryState {
    histograms: FxHashMap<String, Histogram>,
    hang_entries: FxHashMap<String, Vec<HangEntry>>,
    subordinates: Option<Result<Vec<HistogramBundle>, SourceError>>,
}

/// Scriptable source backed by in-memory maps
///
/// Used by tests and by embedders that already hold host data in memory.
/// Subordinate fetches can be held "in flight" until released.
#[derive(Default)]
pub struct InMemorySource {
    state: Mutex<InMemoryState>,
    fetch_gate: Mutex<Option<Arc<Notify>>>,
    fetch_started: Notify,
    fetch_count: AtomicU64,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_histogram(&self, name: &str, histogram: Histogram) {
        self.state.lock().histograms.insert(name.to_string(), histogram);
    }

    pub fn remove_histogram(&self, name: &str) {
        self.state.lock().histograms.remove(name);
    }

    pub fn set_hang_entries(&self, name: &str, entries: Vec<HangEntry>) {
        self.state.lock().hang_entries.insert(name.to_string(), entries);
    }

    pub fn set_subordinates(&self, bundles: Vec<HistogramBundle>) {
        self.state.lock().subordinates = Some(Ok(bundles));
    }

    /// Make every subsequent subordinate fetch reject with `err`
    pub fn fail_subordinates(&self, err: SourceError) {
        self.state.lock().subordinates = Some(Err(err));
    }

    /// Hold subordinate fetches until `release_fetches` is called
    pub fn hold_fetches(&self) {
        *self.fetch_gate.lock() = Some(Arc::new(Notify::new()));
    }

    /// Let held fetches complete and stop holding new ones
    pub fn release_fetches(&self) {
        if let Some(gate) = self.fetch_gate.lock().take() {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    /// Wait until a subordinate fetch has started
    pub async fn fetch_started(&self) {
        self.fetch_started.notified().await;
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HistogramSource for InMemorySource {
    fn histogram(&self, name: &str) -> Result<Histogram, SourceError> {
        self.state
            .lock()
            .histograms
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::unavailable(name))
    }

    fn hang_entries(&self, name: &str) -> Result<Vec<HangEntry>, SourceError> {
        self.state
            .lock()
            .hang_entries
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::unavailable(name))
    }

    async fn subordinate_bundles(&self) -> Result<Vec<HistogramBundle>, SourceError> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        self.fetch_started.notify_one();

        let gate = self.fetch_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match &self.state.lock().subordinates {
            Some(Ok(bundles)) => Ok(bundles.clone()),
            Some(Err(e)) => Err(e.clone()),
            None => Err(SourceError::unavailable("subordinates")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::HangStack;
    use std::time::Duration;

    #[test]
    fn test_missing_histogram_is_unavailable() {
        let source = InMemorySource::new();
        assert_eq!(source.histogram("Gecko"), Err(SourceError::unavailable("Gecko")));
        assert!(source.hang_entries("Gecko").is_err());
    }

    #[test]
    fn test_set_and_read() {
        let source = InMemorySource::new();
        source.set_histogram("Gecko", Histogram::new(vec![10, 20], vec![1, 2]));
        source.set_hang_entries(
            "Gecko",
            vec![HangEntry {
                stack: HangStack(vec!["a".into()]),
                histogram: Histogram::new(vec![10, 20], vec![0, 1]),
            }],
        );
        assert_eq!(source.histogram("Gecko").unwrap().counts, vec![1, 2]);
        assert_eq!(source.hang_entries("Gecko").unwrap().len(), 1);

        source.remove_histogram("Gecko");
        assert!(source.histogram("Gecko").is_err());
    }

    #[tokio::test]
    async fn test_subordinate_failure_is_reported() {
        let source = InMemorySource::new();
        assert!(source.subordinate_bundles().await.is_err());

        source.fail_subordinates(SourceError::FetchFailed("ipc closed".into()));
        assert_eq!(
            source.subordinate_bundles().await,
            Err(SourceError::FetchFailed("ipc closed".into()))
        );
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_held_fetch_completes_after_release() {
        let source = Arc::new(InMemorySource::new());
        source.set_subordinates(vec![HistogramBundle {
            process_id: "7".into(),
            ..Default::default()
        }]);
        source.hold_fetches();

        let fetcher = source.clone();
        let handle = tokio::spawn(async move { fetcher.subordinate_bundles().await });
        source.fetch_started().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        source.release_fetches();
        let bundles = handle.await.unwrap().unwrap();
        assert_eq!(bundles[0].process_id, "7");
    }
}
