//! Visible hang counter
//!
//! The badge shows `raw_total - baseline - observed_correction`. Clearing moves
//! the baseline up to the current total instead of touching the total itself,
//! so later polls keep counting from where the host is.

use crate::domain::types::Badge;
use tracing::debug;

/// Result of feeding a new total into the counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub badge: Badge,
    /// Badge differs from the last one reported
    pub changed: bool,
    /// Set when the badge went up from a known value
    pub increased_by: Option<u64>,
}

#[derive(Debug)]
pub struct CounterStateMachine {
    raw_total: u64,
    available: bool,
    baseline: u64,
    observed_correction: u64,
    last_badge: Badge,
}

impl Default for CounterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStateMachine {
    pub fn new() -> Self {
        Self {
            raw_total: 0,
            available: false,
            baseline: 0,
            observed_correction: 0,
            last_badge: Badge::Unknown,
        }
    }

    pub fn raw_total(&self) -> u64 {
        self.raw_total
    }

    /// Badge for the current state without recording it as reported
    pub fn observed_badge(&self) -> Badge {
        if !self.available {
            return Badge::Unknown;
        }
        let visible = self.raw_total.saturating_sub(self.baseline) as i64;
        Badge::Known(visible - self.observed_correction as i64)
    }

    /// Feed the latest raw total; `None` means the source is unavailable
    pub fn on_new_total(&mut self, total: Option<u64>) -> CounterUpdate {
        match total {
            Some(total) => {
                self.raw_total = total;
                self.available = true;
            }
            None => self.available = false,
        }
        self.report()
    }

    /// Hangs the user has already seen some other way
    pub fn add_observed(&mut self, count: u64) -> CounterUpdate {
        self.observed_correction = self.observed_correction.saturating_add(count);
        debug!(correction = %self.observed_correction, "observed_correction_added");
        self.report()
    }

    /// Zero the badge at the current total
    pub fn clear(&mut self) -> Badge {
        self.baseline = self.raw_total;
        self.observed_correction = 0;
        self.last_badge = self.observed_badge();
        self.last_badge
    }

    /// Adopt `total` as both the raw total and the baseline
    pub fn reset_to(&mut self, total: u64) -> Badge {
        self.raw_total = total;
        self.available = true;
        self.clear()
    }

    fn report(&mut self) -> CounterUpdate {
        let badge = self.observed_badge();
        let increased_by = match (self.last_badge, badge) {
            (Badge::Known(old), Badge::Known(new)) if new > old => Some((new - old) as u64),
            _ => None,
        };
        let changed = badge != self.last_badge;
        self.last_badge = badge;
        CounterUpdate { badge, changed, increased_by }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unknown() {
        let counter = CounterStateMachine::new();
        assert_eq!(counter.observed_badge(), Badge::Unknown);
    }

    #[test]
    fn test_increase_is_reported() {
        let mut counter = CounterStateMachine::new();
        counter.reset_to(10);

        let update = counter.on_new_total(Some(13));
        assert_eq!(update.badge, Badge::Known(3));
        assert!(update.changed);
        assert_eq!(update.increased_by, Some(3));

        let same = counter.on_new_total(Some(13));
        assert!(!same.changed);
        assert_eq!(same.increased_by, None);
    }

    #[test]
    fn test_clear_zeroes_badge_and_keeps_counting() {
        let mut counter = CounterStateMachine::new();
        counter.reset_to(0);
        counter.on_new_total(Some(4));

        assert_eq!(counter.clear(), Badge::Known(0));
        assert_eq!(counter.raw_total(), 4);

        let update = counter.on_new_total(Some(6));
        assert_eq!(update.badge, Badge::Known(2));
        assert_eq!(update.increased_by, Some(2));
    }

    #[test]
    fn test_unavailable_then_recovered_does_not_blip() {
        let mut counter = CounterStateMachine::new();
        counter.reset_to(0);
        counter.on_new_total(Some(2));

        let lost = counter.on_new_total(None);
        assert_eq!(lost.badge, Badge::Unknown);
        assert!(lost.changed);

        let back = counter.on_new_total(Some(5));
        assert_eq!(back.badge, Badge::Known(5));
        assert!(back.changed);
        assert_eq!(back.increased_by, None);
    }

    #[test]
    fn test_clear_while_unavailable_stays_unknown() {
        let mut counter = CounterStateMachine::new();
        counter.reset_to(3);
        counter.on_new_total(None);
        assert_eq!(counter.clear(), Badge::Unknown);

        // Baseline moved to the last known total
        assert_eq!(counter.on_new_total(Some(3)).badge, Badge::Known(0));
    }

    #[test]
    fn test_observed_correction() {
        let mut counter = CounterStateMachine::new();
        counter.reset_to(0);
        counter.on_new_total(Some(5));

        let update = counter.add_observed(2);
        assert_eq!(update.badge, Badge::Known(3));
        assert_eq!(update.increased_by, None);

        counter.clear();
        assert_eq!(counter.on_new_total(Some(6)).badge, Badge::Known(1));
    }

    #[test]
    fn test_correction_can_go_negative() {
        let mut counter = CounterStateMachine::new();
        counter.reset_to(0);
        assert_eq!(counter.add_observed(2).badge, Badge::Known(-2));
    }
}
