//! File-backed histogram source
//!
//! The main process writes a JSON snapshot of its histograms to one file;
//! each subordinate process writes its own bundle into a directory.
//!
//! Main snapshot:
//! ```json
//! {
//!   "histograms":   { "EVENTLOOP_UI_ACTIVITY_EXP_MS": { "ranges": [..], "counts": [..] } },
//!   "hang_entries": { "Gecko": [ { "stack": ["leaf", "root"], "histogram": { .. } } ] }
//! }
//! ```
//! Subordinate bundle: a `HistogramBundle` per `*.json` file. An empty
//! `process_id` is replaced by the file stem. A listed bundle that cannot be
//! read or parsed fails the whole fetch, so a live process never drops out of
//! a pass; a file removed between listing and reading is a process that exited.

use crate::domain::types::{HangEntry, Histogram, HistogramBundle};
use crate::infra::error::SourceError;
use crate::io::source::HistogramSource;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
struct MainSnapshot {
    #[serde(default)]
    histograms: FxHashMap<String, Histogram>,
    #[serde(default)]
    hang_entries: FxHashMap<String, Vec<HangEntry>>,
}

pub struct SnapshotSource {
    main_snapshot: PathBuf,
    subordinate_dir: PathBuf,
}

impl SnapshotSource {
    pub fn new(main_snapshot: impl Into<PathBuf>, subordinate_dir: impl Into<PathBuf>) -> Self {
        Self { main_snapshot: main_snapshot.into(), subordinate_dir: subordinate_dir.into() }
    }

    /// Read and parse the main snapshot; a missing file means the host
    /// provides nothing under `name`
    fn read_main(&self, name: &str) -> Result<MainSnapshot, SourceError> {
        let content = match std::fs::read_to_string(&self.main_snapshot) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SourceError::unavailable(name));
            }
            Err(e) => {
                return Err(SourceError::FetchFailed(format!(
                    "{}: {}",
                    self.main_snapshot.display(),
                    e
                )));
            }
        };

        serde_json::from_str(&content).map_err(|e| {
            SourceError::Malformed(format!("{}: {}", self.main_snapshot.display(), e))
        })
    }

    async fn read_bundle(path: &Path) -> Result<Option<HistogramBundle>, SourceError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "subordinate_bundle_gone");
                return Ok(None);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "subordinate_bundle_read_failed");
                return Err(SourceError::FetchFailed(format!("{}: {}", path.display(), e)));
            }
        };

        let mut bundle = serde_json::from_str::<HistogramBundle>(&content).map_err(|e| {
            warn!(path = %path.display(), error = %e, "subordinate_bundle_malformed");
            SourceError::Malformed(format!("{}: {}", path.display(), e))
        })?;
        if bundle.process_id.is_empty() {
            bundle.process_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(Some(bundle))
    }
}

#[async_trait]
impl HistogramSource for SnapshotSource {
    fn histogram(&self, name: &str) -> Result<Histogram, SourceError> {
        self.read_main(name)?
            .histograms
            .remove(name)
            .ok_or_else(|| SourceError::unavailable(name))
    }

    fn hang_entries(&self, name: &str) -> Result<Vec<HangEntry>, SourceError> {
        self.read_main(name)?
            .hang_entries
            .remove(name)
            .ok_or_else(|| SourceError::unavailable(name))
    }

    async fn subordinate_bundles(&self) -> Result<Vec<HistogramBundle>, SourceError> {
        let mut dir = match tokio::fs::read_dir(&self.subordinate_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SourceError::unavailable(self.subordinate_dir.display().to_string()));
            }
            Err(e) => return Err(SourceError::FetchFailed(e.to_string())),
        };

        let mut paths = Vec::new();
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(SourceError::FetchFailed(e.to_string())),
            }
        }
        paths.sort();

        let mut bundles = Vec::with_capacity(paths.len());
        for path in &paths {
            if let Some(bundle) = Self::read_bundle(path).await? {
                bundles.push(bundle);
            }
        }
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const MAIN_JSON: &str = r#"{
        "histograms": {
            "EVENTLOOP_UI_ACTIVITY_EXP_MS": { "ranges": [50, 100, 200], "counts": [4, 2, 1] }
        },
        "hang_entries": {
            "Gecko": [
                { "stack": ["leaf", "root"], "histogram": { "ranges": [127, 255], "counts": [0, 3] } }
            ]
        }
    }"#;

    #[test]
    fn test_reads_main_snapshot() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("main.json");
        fs::write(&main, MAIN_JSON).unwrap();

        let source = SnapshotSource::new(&main, dir.path().join("subs"));
        let lag = source.histogram("EVENTLOOP_UI_ACTIVITY_EXP_MS").unwrap();
        assert_eq!(lag.counts, vec![4, 2, 1]);

        let entries = source.hang_entries("Gecko").unwrap();
        assert_eq!(entries[0].stack.key(), "root\nleaf");
        assert_eq!(
            source.histogram("INPUT_EVENT_RESPONSE_MS"),
            Err(SourceError::unavailable("INPUT_EVENT_RESPONSE_MS"))
        );
    }

    #[test]
    fn test_missing_main_snapshot_is_unavailable() {
        let dir = tempdir().unwrap();
        let source = SnapshotSource::new(dir.path().join("absent.json"), dir.path());
        assert!(source.histogram("Gecko").unwrap_err().is_permanent());
    }

    #[test]
    fn test_invalid_main_snapshot_is_malformed() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("main.json");
        fs::write(&main, "{ not json").unwrap();
        let source = SnapshotSource::new(&main, dir.path());
        assert_eq!(source.histogram("Gecko").unwrap_err().kind(), "malformed");
    }

    #[tokio::test]
    async fn test_reads_subordinate_bundles() {
        let dir = tempdir().unwrap();
        let subs = dir.path().join("subs");
        fs::create_dir(&subs).unwrap();
        fs::write(
            subs.join("4242.json"),
            r#"{ "process_id": "", "histograms": { "Gecko": { "ranges": [127], "counts": [2] } } }"#,
        )
        .unwrap();
        fs::write(subs.join("notes.txt"), "ignored").unwrap();

        let source = SnapshotSource::new(dir.path().join("main.json"), &subs);
        let bundles = source.subordinate_bundles().await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].process_id, "4242");
        assert_eq!(bundles[0].histograms["Gecko"].counts, vec![2]);
    }

    #[tokio::test]
    async fn test_half_written_bundle_fails_fetch() {
        let dir = tempdir().unwrap();
        let subs = dir.path().join("subs");
        fs::create_dir(&subs).unwrap();
        fs::write(subs.join("1.json"), r#"{ "process_id": "1" }"#).unwrap();
        fs::write(subs.join("2.json"), r#"{ "process_id": "2", "histo"#).unwrap();

        let source = SnapshotSource::new(dir.path().join("main.json"), &subs);
        let err = source.subordinate_bundles().await.unwrap_err();
        assert_eq!(err.kind(), "malformed");
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_missing_subordinate_dir_is_unavailable() {
        let dir = tempdir().unwrap();
        let source = SnapshotSource::new(dir.path().join("main.json"), dir.path().join("nope"));
        assert!(source.subordinate_bundles().await.unwrap_err().is_permanent());
    }
}
