//! Alert level state machine
//!
//! The level only moves through named triggers. Each trigger carries the
//! level range it requires and the level it moves to, so a trigger that
//! arrives after the level has already moved on is a harmless no-op.

use crate::domain::types::AlertLevel;
use std::ops::RangeInclusive;

/// Named level transition request, attributable to one component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// AccuracyGate: fix too imprecise to claim a distraction
    AccuracyDrop,
    /// AccuracyGate: fix good enough again
    AccuracyRecovered,
    /// WatchingDetector: magnitude average inside the watching band
    WatchingDetected,
    /// WatchingDetector: magnitude average left the band
    WatchingCleared,
    /// CrosswalkVisualDetector: positive frame
    CrosswalkSeen,
    /// CrosswalkVisualDetector: miss limit reached
    CrosswalkLost,
    /// Relevance engine: a reachable crosswalk was found
    CrosswalkRelevant,
    /// Presence coordinator: counterpart role present at the joined crosswalk
    PresenceJoined,
    /// Presence coordinator: counterpart role absent
    PresenceLeft,
    /// Presence coordinator: first critical assertion; `from` is the lowest accepted level
    CriticalEntered { from: AlertLevel },
    /// Presence coordinator: last critical assertion ended
    CriticalCleared,
    /// UI: session start
    ManualStart,
    /// UI: session stop
    ManualStop,
}

impl Trigger {
    /// Levels from which this trigger may fire
    pub fn precondition(&self) -> RangeInclusive<AlertLevel> {
        use AlertLevel as L;
        match self {
            Trigger::AccuracyDrop => L::SUSPECTED..=L::CRITICAL,
            Trigger::AccuracyRecovered => L::ACTIVE..=L::ACTIVE,
            Trigger::WatchingDetected => L::ACTIVE..=L::ACTIVE,
            Trigger::WatchingCleared => L::SUSPECTED..=L::CRITICAL,
            Trigger::CrosswalkSeen => L::SUSPECTED..=L::SUSPECTED,
            Trigger::CrosswalkLost => L::SUSPECTED..=L::CRITICAL,
            Trigger::CrosswalkRelevant => L::ACTIVE..=L::SUSPECTED,
            Trigger::PresenceJoined => L::CROSSWALK..=L::CROSSWALK,
            Trigger::PresenceLeft => L::PRESENCE..=L::CRITICAL,
            Trigger::CriticalEntered { from } => *from..=L::PRESENCE,
            Trigger::CriticalCleared => L::CRITICAL..=L::CRITICAL,
            Trigger::ManualStart => L::OFF..=L::OFF,
            Trigger::ManualStop => L::ACTIVE..=L::CRITICAL,
        }
    }

    pub fn target(&self) -> AlertLevel {
        use AlertLevel as L;
        match self {
            Trigger::AccuracyDrop | Trigger::WatchingCleared | Trigger::ManualStart => L::ACTIVE,
            Trigger::AccuracyRecovered | Trigger::WatchingDetected | Trigger::CrosswalkLost => {
                L::SUSPECTED
            }
            Trigger::CrosswalkSeen | Trigger::CrosswalkRelevant | Trigger::PresenceLeft => {
                L::CROSSWALK
            }
            Trigger::PresenceJoined | Trigger::CriticalCleared => L::PRESENCE,
            Trigger::CriticalEntered { .. } => L::CRITICAL,
            Trigger::ManualStop => L::OFF,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::AccuracyDrop => "accuracy_drop",
            Trigger::AccuracyRecovered => "accuracy_recovered",
            Trigger::WatchingDetected => "watching_detected",
            Trigger::WatchingCleared => "watching_cleared",
            Trigger::CrosswalkSeen => "crosswalk_seen",
            Trigger::CrosswalkLost => "crosswalk_lost",
            Trigger::CrosswalkRelevant => "crosswalk_relevant",
            Trigger::PresenceJoined => "presence_joined",
            Trigger::PresenceLeft => "presence_left",
            Trigger::CriticalEntered { .. } => "critical_entered",
            Trigger::CriticalCleared => "critical_cleared",
            Trigger::ManualStart => "manual_start",
            Trigger::ManualStop => "manual_stop",
        }
    }
}

/// A level change that actually happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AlertLevel,
    pub to: AlertLevel,
    pub trigger: Trigger,
}

/// Authoritative per-participant level
#[derive(Debug, Clone)]
pub struct AlertMachine {
    level: AlertLevel,
}

impl Default for AlertMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertMachine {
    pub fn new() -> Self {
        Self { level: AlertLevel::OFF }
    }

    #[cfg(test)]
    pub fn at(level: AlertLevel) -> Self {
        Self { level }
    }

    #[inline]
    pub fn level(&self) -> AlertLevel {
        self.level
    }

    /// Apply a trigger; returns the transition if the level changed
    pub fn apply(&mut self, trigger: Trigger) -> Option<Transition> {
        if !trigger.precondition().contains(&self.level) {
            return None;
        }
        let to = trigger.target();
        if to == self.level {
            return None;
        }
        let from = self.level;
        self.level = to;
        Some(Transition { from, to, trigger })
    }
}
