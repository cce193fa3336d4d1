//! Domain models - histograms, hang records and engine modes
//!
//! This module contains the plain data types shared by the engine:
//! - `Histogram` / `LowerBound` - bucketed cumulative counts and bucket edges
//! - `Threshold` / `Comparison` - which buckets count as a hang
//! - `HangEntry` / `HangStack` / `HistogramBundle` - what a source reports
//! - `HangRecord` - one reconstructed hang occurrence
//! - `Mode`, `Badge`, `Warning` - user-facing state

pub mod types;

// Re-export commonly used types at module level
pub use types::{
    Badge, ColorClass, Comparison, HangEntry, HangRecord, HangStack, Histogram, HistogramBundle,
    LowerBound, Mode, ProcessOrigin, SourceId, Threshold, Warning,
};
