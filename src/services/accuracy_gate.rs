//! GPS accuracy gate
//!
//! A distraction claim is only meaningful with a usable fix: a fix worse
//! than the threshold drops the level back to 0, a good fix at 0 lifts it
//! to 1.

use crate::domain::alert::Trigger;
use crate::domain::types::{AlertLevel, Location};

pub struct AccuracyGate {
    max_accuracy_m: f64,
}

impl AccuracyGate {
    pub fn new(max_accuracy_m: f64) -> Self {
        Self { max_accuracy_m }
    }

    /// Propose a trigger for a new fix; `None` when the level is off or no fix exists
    pub fn evaluate(&self, location: Option<&Location>, level: AlertLevel) -> Option<Trigger> {
        let location = location?;
        if !level.is_active() {
            return None;
        }
        if level >= AlertLevel::SUSPECTED && location.accuracy > self.max_accuracy_m {
            return Some(Trigger::AccuracyDrop);
        }
        if level == AlertLevel::ACTIVE && location.accuracy <= self.max_accuracy_m {
            return Some(Trigger::AccuracyRecovered);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(accuracy: f64) -> Location {
        Location { latitude: 47.5, longitude: 19.04, accuracy, speed: None, timestamp: 0 }
    }

    #[test]
    fn test_poor_fix_drops_to_active() {
        let gate = AccuracyGate::new(50.0);
        for level in [AlertLevel::SUSPECTED, AlertLevel::CROSSWALK, AlertLevel::CRITICAL] {
            assert_eq!(gate.evaluate(Some(&fix(51.0)), level), Some(Trigger::AccuracyDrop));
        }
    }

    #[test]
    fn test_good_fix_at_active_recovers() {
        let gate = AccuracyGate::new(50.0);
        assert_eq!(gate.evaluate(Some(&fix(50.0)), AlertLevel::ACTIVE), Some(Trigger::AccuracyRecovered));
        assert_eq!(gate.evaluate(Some(&fix(30.0)), AlertLevel::SUSPECTED), None);
        assert_eq!(gate.evaluate(Some(&fix(80.0)), AlertLevel::ACTIVE), None);
    }

    #[test]
    fn test_no_effect_when_off_or_no_fix() {
        let gate = AccuracyGate::new(50.0);
        assert_eq!(gate.evaluate(Some(&fix(500.0)), AlertLevel::OFF), None);
        assert_eq!(gate.evaluate(Some(&fix(5.0)), AlertLevel::OFF), None);
        assert_eq!(gate.evaluate(None, AlertLevel::SUSPECTED), None);
    }
}
