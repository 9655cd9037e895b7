//! Crosswalk visual confirmation from classifier results
//!
//! Active from level 1. One positive frame confirms the crosswalk; a run of
//! negatives drops the participant back to "suspected".

use crate::domain::alert::Trigger;
use crate::domain::types::AlertLevel;
use tracing::debug;

pub struct CrosswalkVisualDetector {
    miss_limit: u32,
    misses: u32,
}

impl CrosswalkVisualDetector {
    pub fn new(miss_limit: u32) -> Self {
        Self { miss_limit: miss_limit.max(1), misses: 0 }
    }

    pub fn is_active(level: AlertLevel) -> bool {
        level >= AlertLevel::SUSPECTED
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// Interpret one classifier result; results while inactive are ignored
    pub fn on_result(&mut self, is_crosswalk: bool, level: AlertLevel) -> Option<Trigger> {
        if !Self::is_active(level) {
            debug!(level = %level, "predict_result_ignored_inactive");
            return None;
        }
        if is_crosswalk {
            self.misses = 0;
            return (level == AlertLevel::SUSPECTED).then_some(Trigger::CrosswalkSeen);
        }
        self.misses += 1;
        if self.misses >= self.miss_limit {
            self.misses = 0;
            return Some(Trigger::CrosswalkLost);
        }
        None
    }

    pub fn reset(&mut self) {
        self.misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_confirms_at_suspected_only() {
        let mut v = CrosswalkVisualDetector::new(5);
        assert_eq!(v.on_result(true, AlertLevel::SUSPECTED), Some(Trigger::CrosswalkSeen));
        assert_eq!(v.on_result(true, AlertLevel::PRESENCE), None);
    }

    #[test]
    fn test_fifth_miss_loses_crosswalk_and_resets() {
        let mut v = CrosswalkVisualDetector::new(5);
        for _ in 0..4 {
            assert_eq!(v.on_result(false, AlertLevel::CROSSWALK), None);
        }
        assert_eq!(v.on_result(false, AlertLevel::CROSSWALK), Some(Trigger::CrosswalkLost));
        assert_eq!(v.misses(), 0);
    }

    #[test]
    fn test_positive_resets_miss_count() {
        let mut v = CrosswalkVisualDetector::new(5);
        for _ in 0..4 {
            v.on_result(false, AlertLevel::CROSSWALK);
        }
        v.on_result(true, AlertLevel::CROSSWALK);
        assert_eq!(v.misses(), 0);
    }

    #[test]
    fn test_ignored_while_inactive() {
        let mut v = CrosswalkVisualDetector::new(1);
        assert_eq!(v.on_result(false, AlertLevel::ACTIVE), None);
        assert_eq!(v.on_result(true, AlertLevel::OFF), None);
        assert_eq!(v.misses(), 0);
    }
}
