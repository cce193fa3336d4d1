//! Typed errors at the histogram source boundary
//!
//! These never cross the poll boundary: the poll loop converts every variant
//! into an "unavailable" reading or a failed poll outcome.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The requested histogram or metric does not exist on this host
    #[error("histogram source `{name}` is unavailable")]
    Unavailable { name: String },

    /// Fetching subordinate data failed; retried on the next poll
    #[error("subordinate fetch failed: {0}")]
    FetchFailed(String),

    /// Subordinate fetch did not complete in time
    #[error("subordinate fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Data was present but structurally invalid
    #[error("malformed histogram data: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn unavailable(name: impl Into<String>) -> Self {
        SourceError::Unavailable { name: name.into() }
    }

    /// Permanent for the session (as opposed to retry-on-next-poll)
    pub fn is_permanent(&self) -> bool {
        matches!(self, SourceError::Unavailable { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Unavailable { .. } => "unavailable",
            SourceError::FetchFailed(_) => "fetch_failed",
            SourceError::Timeout(_) => "timeout",
            SourceError::Malformed(_) => "malformed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SourceError::unavailable("Gecko").is_permanent());
        assert!(!SourceError::FetchFailed("ipc closed".into()).is_permanent());
        assert!(!SourceError::Timeout(Duration::from_secs(2)).is_permanent());
        assert_eq!(SourceError::Malformed("x".into()).kind(), "malformed");
    }

    #[test]
    fn test_display() {
        let err = SourceError::unavailable("EVENTLOOP_UI_ACTIVITY_EXP_MS");
        assert_eq!(err.to_string(), "histogram source `EVENTLOOP_UI_ACTIVITY_EXP_MS` is unavailable");
    }
}
