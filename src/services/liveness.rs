//! Tracks when each subordinate producer last reported
//!
//! Subordinate processes come and go with the host. Their baselines survive a
//! few passes without a reading and are dropped once the producer has been
//! absent for `ABSENT_PASSES_BEFORE_EXPIRY` successful passes. The main
//! process never expires.

use crate::domain::types::SourceId;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

pub const ABSENT_PASSES_BEFORE_EXPIRY: u64 = 25;

#[derive(Debug, Default)]
pub struct Liveness {
    pass: u64,
    last_seen: FxHashMap<SourceId, u64>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `source` as reporting in the current pass
    pub fn seen(&mut self, source: &SourceId) {
        if !matches!(source, SourceId::Subordinate(_)) {
            return;
        }
        match self.last_seen.get_mut(source) {
            Some(last) => *last = self.pass,
            None => {
                self.last_seen.insert(source.clone(), self.pass);
            }
        }
    }

    /// Close the current pass and return the producers that just expired
    pub fn end_pass(&mut self) -> FxHashSet<SourceId> {
        let pass = self.pass;
        self.pass += 1;

        let mut expired = FxHashSet::default();
        self.last_seen.retain(|source, last| {
            if pass - *last >= ABSENT_PASSES_BEFORE_EXPIRY {
                expired.insert(source.clone());
                false
            } else {
                true
            }
        });

        if !expired.is_empty() {
            debug!(expired = %expired.len(), remaining = %self.last_seen.len(), "producers_expired");
        }
        expired
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    /// Number of subordinate producers currently tracked
    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}
