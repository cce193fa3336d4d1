//! Shared types for the hang monitor

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lower edge of a histogram bucket
///
/// Ranges are inclusive upper bounds with an implicit leading bucket, so bucket
/// `i > 0` covers `[ranges[i-1] + 1, ranges[i]]` and bucket 0 has no lower edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowerBound {
    Unbounded,
    At(u64),
}

impl fmt::Display for LowerBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerBound::Unbounded => write!(f, "-inf"),
            LowerBound::At(v) => write!(f, "{}", v),
        }
    }
}

/// Bucketed cumulative count histogram as read from the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    /// Inclusive bucket upper bounds, ascending
    pub ranges: Vec<u64>,
    /// Cumulative counts, parallel to `ranges`
    pub counts: Vec<u64>,
}

impl Histogram {
    pub fn new(ranges: Vec<u64>, counts: Vec<u64>) -> Self {
        Self { ranges, counts }
    }

    /// Lower and upper bound of bucket `i`
    pub fn bucket_bounds(&self, i: usize) -> (LowerBound, u64) {
        let lower = if i == 0 {
            LowerBound::Unbounded
        } else {
            LowerBound::At(self.ranges[i - 1].saturating_add(1))
        };
        (lower, self.ranges[i])
    }

    /// Check the shape invariants; returns a description of the first violation
    pub fn validate(&self) -> Result<(), String> {
        if self.ranges.len() != self.counts.len() {
            return Err(format!(
                "ranges/counts length mismatch ({} vs {})",
                self.ranges.len(),
                self.counts.len()
            ));
        }
        if self.ranges.windows(2).any(|w| w[0] >= w[1]) {
            return Err("ranges are not strictly ascending".to_string());
        }
        Ok(())
    }
}

/// How a bucket lower bound is compared against the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    /// `lower_bound >= threshold`
    Inclusive,
    /// `lower_bound > threshold`
    Exclusive,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Inclusive => "inclusive",
            Comparison::Exclusive => "exclusive",
        }
    }
}

/// Duration threshold a bucket must start at (or past) to count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    pub value: u64,
    pub comparison: Comparison,
}

impl Threshold {
    pub fn inclusive(value: u64) -> Self {
        Self { value, comparison: Comparison::Inclusive }
    }

    pub fn exclusive(value: u64) -> Self {
        Self { value, comparison: Comparison::Exclusive }
    }

    /// Whether a bucket starting at `lower` qualifies
    #[inline]
    pub fn admits(&self, lower: LowerBound) -> bool {
        match (lower, self.comparison) {
            (LowerBound::Unbounded, _) => false,
            (LowerBound::At(v), Comparison::Inclusive) => v >= self.value,
            (LowerBound::At(v), Comparison::Exclusive) => v > self.value,
        }
    }
}

/// Call stack of a hang site, leaf frame first as delivered by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HangStack(pub Vec<String>);

impl HangStack {
    /// Canonical identity: frames root-first, newline separated
    pub fn key(&self) -> String {
        let mut frames: Vec<&str> = self.0.iter().map(String::as_str).collect();
        frames.reverse();
        frames.join("\n")
    }
}

/// One hang site with its private duration histogram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangEntry {
    pub stack: HangStack,
    pub histogram: Histogram,
}

/// Histograms and hang entries reported by one subordinate process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBundle {
    pub process_id: String,
    #[serde(default)]
    pub histograms: FxHashMap<String, Histogram>,
    #[serde(default)]
    pub hang_entries: FxHashMap<String, Vec<HangEntry>>,
}

/// Which process an observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessOrigin {
    Main,
    Subordinate,
}

impl ProcessOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOrigin::Main => "main",
            ProcessOrigin::Subordinate => "subordinate",
        }
    }
}

/// Identity of a histogram producer across polls
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceId {
    Main,
    Subordinate(String),
}

impl SourceId {
    pub fn origin(&self) -> ProcessOrigin {
        match self {
            SourceId::Main => ProcessOrigin::Main,
            SourceId::Subordinate(_) => ProcessOrigin::Subordinate,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Main => write!(f, "main"),
            SourceId::Subordinate(pid) => write!(f, "subordinate:{}", pid),
        }
    }
}

/// A single observed hang, immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HangRecord {
    pub stack_key: String,
    pub lower_bound: LowerBound,
    pub upper_bound: u64,
    pub timestamp: DateTime<Utc>,
    pub process_origin: ProcessOrigin,
}

/// Which histogram(s) feed the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    MainThreadHangs,
    SubordinateThreadHangs,
    AllThreadHangs,
    EventLoopLag,
    InputResponseLag,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::MainThreadHangs,
        Mode::SubordinateThreadHangs,
        Mode::AllThreadHangs,
        Mode::EventLoopLag,
        Mode::InputResponseLag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::MainThreadHangs => "main-thread-hangs",
            Mode::SubordinateThreadHangs => "subordinate-thread-hangs",
            Mode::AllThreadHangs => "all-thread-hangs",
            Mode::EventLoopLag => "event-loop-lag",
            Mode::InputResponseLag => "input-response-lag",
        }
    }

    pub fn parse(s: &str) -> Option<Mode> {
        Mode::ALL.into_iter().find(|m| m.as_str() == s.trim())
    }

    pub fn is_thread_hangs(&self) -> bool {
        matches!(
            self,
            Mode::MainThreadHangs | Mode::SubordinateThreadHangs | Mode::AllThreadHangs
        )
    }

    pub fn reads_main(&self) -> bool {
        !matches!(self, Mode::SubordinateThreadHangs)
    }

    pub fn reads_subordinates(&self) -> bool {
        matches!(self, Mode::SubordinateThreadHangs | Mode::AllThreadHangs)
    }

    /// Only thread-hang histograms come with per-stack hang entries
    pub fn tracks_hang_entries(&self) -> bool {
        self.is_thread_hangs()
    }

    /// Warning shown when the main-process metric for this mode is missing
    pub fn unavailable_warning(&self) -> Warning {
        if self.is_thread_hangs() {
            Warning::UnavailableMainSource
        } else {
            Warning::UnavailableMetric
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value displayed on the badge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    Known(i64),
    Unknown,
}

/// Serialized as the number itself, or `"?"` when unknown
impl Serialize for Badge {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Badge::Known(n) => serializer.serialize_i64(*n),
            Badge::Unknown => serializer.serialize_str("?"),
        }
    }
}

impl Badge {
    pub fn color(&self) -> ColorClass {
        match self {
            Badge::Unknown => ColorClass::Yellow,
            Badge::Known(n) => ColorClass::CYCLE[n.rem_euclid(ColorClass::CYCLE.len() as i64) as usize],
        }
    }
}

impl fmt::Display for Badge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Badge::Known(n) => write!(f, "{}", n),
            Badge::Unknown => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorClass {
    Red,
    Blue,
    Brown,
    Black,
    Yellow,
}

impl ColorClass {
    /// Colours cycled through as the badge counts up
    pub const CYCLE: [ColorClass; 4] =
        [ColorClass::Red, ColorClass::Blue, ColorClass::Brown, ColorClass::Black];
}

/// User-visible warning banner classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Warning {
    UnavailableMainSource,
    UnavailableSubordinateSource,
    UnavailableMetric,
}

impl Warning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Warning::UnavailableMainSource => "unavailable_main_source",
            Warning::UnavailableSubordinateSource => "unavailable_subordinate_source",
            Warning::UnavailableMetric => "unavailable_metric",
        }
    }
}
