//! Cancellable timers keyed by concern
//!
//! At most one timer per concern. Starting an active timer is a no-op and
//! cancelling takes effect before the next poll. The participant loop sleeps
//! until `next_deadline()` and then drains `take_due()`.

use crate::infra::metrics::Metrics;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Frame submission duty cycle
    Predict,
    /// Room membership refresh
    Heartbeat,
    /// Crosswalk relevance lookup
    Relevance,
    /// Driver dangered-set recomputation
    DistanceWatch,
    /// End of a calibration run (one-shot)
    CalibrationCheck,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::Predict,
        TimerKind::Heartbeat,
        TimerKind::Relevance,
        TimerKind::DistanceWatch,
        TimerKind::CalibrationCheck,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::Predict => 0,
            TimerKind::Heartbeat => 1,
            TimerKind::Relevance => 2,
            TimerKind::DistanceWatch => 3,
            TimerKind::CalibrationCheck => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimerKind::Predict => "predict",
            TimerKind::Heartbeat => "heartbeat",
            TimerKind::Relevance => "relevance",
            TimerKind::DistanceWatch => "distance_watch",
            TimerKind::CalibrationCheck => "calibration_check",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline: Instant,
    /// `None` for one-shot timers
    period: Option<Duration>,
}

pub type DueTimers = SmallVec<[TimerKind; 5]>;

pub struct TimerSet {
    entries: [Option<Entry>; 5],
    metrics: Option<Arc<Metrics>>,
}

impl TimerSet {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self { entries: [None; 5], metrics }
    }

    pub fn is_active(&self, kind: TimerKind) -> bool {
        self.entries[kind.index()].is_some()
    }

    /// Start a periodic timer whose first tick is at `first`; no-op if running
    pub fn start(&mut self, kind: TimerKind, period: Duration, first: Instant) -> bool {
        self.insert(kind, Entry { deadline: first, period: Some(period.max(Duration::from_millis(1))) })
    }

    /// Start a one-shot timer; no-op if running
    pub fn start_once(&mut self, kind: TimerKind, deadline: Instant) -> bool {
        self.insert(kind, Entry { deadline, period: None })
    }

    fn insert(&mut self, kind: TimerKind, entry: Entry) -> bool {
        let slot = &mut self.entries[kind.index()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(entry);
        debug!(timer = kind.as_str(), period_ms = ?entry.period.map(|p| p.as_millis()), "timer_started");
        if let Some(ref m) = self.metrics {
            m.record_timer_started();
        }
        true
    }

    /// Cancel a timer; returns false if it was not running
    pub fn stop(&mut self, kind: TimerKind) -> bool {
        if self.entries[kind.index()].take().is_none() {
            return false;
        }
        debug!(timer = kind.as_str(), "timer_stopped");
        if let Some(ref m) = self.metrics {
            m.record_timer_stopped();
        }
        true
    }

    pub fn stop_all(&mut self) {
        for kind in TimerKind::ALL {
            self.stop(kind);
        }
    }

    /// Start or stop `kind` so that it runs iff `wanted`
    pub fn ensure(&mut self, kind: TimerKind, wanted: bool, period: Duration, first: Instant) {
        if wanted {
            self.start(kind, period, first);
        } else {
            self.stop(kind);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().flatten().map(|e| e.deadline).min()
    }

    /// Collect timers due at `now`, rescheduling periodic ones
    ///
    /// A periodic timer that fell several periods behind fires once and
    /// resumes one period from `now`. One-shot timers are removed.
    pub fn take_due(&mut self, now: Instant) -> DueTimers {
        let mut due = DueTimers::new();
        for kind in TimerKind::ALL {
            let slot = &mut self.entries[kind.index()];
            let Some(entry) = slot.as_mut() else { continue };
            if entry.deadline > now {
                continue;
            }
            due.push(kind);
            match entry.period {
                Some(period) => {
                    let next = entry.deadline + period;
                    entry.deadline = if next > now { next } else { now + period };
                }
                None => *slot = None,
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_idempotent() {
        let metrics = Arc::new(Metrics::new());
        let mut timers = TimerSet::new(Some(metrics.clone()));
        let now = Instant::now();
        assert!(timers.start(TimerKind::Heartbeat, Duration::from_secs(1), now));
        assert!(!timers.start(TimerKind::Heartbeat, Duration::from_millis(5), now));
        assert_eq!(metrics.timers_started(), 1);
    }

    #[test]
    fn test_stop_cancels_immediately() {
        let metrics = Arc::new(Metrics::new());
        let mut timers = TimerSet::new(Some(metrics.clone()));
        let now = Instant::now();
        timers.start(TimerKind::Predict, Duration::from_millis(333), now);
        assert!(timers.stop(TimerKind::Predict));
        assert!(!timers.stop(TimerKind::Predict));
        assert!(timers.take_due(now + Duration::from_secs(10)).is_empty());
        assert_eq!(metrics.timers_stopped(), 1);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_periodic_reschedules() {
        let mut timers = TimerSet::new(None);
        let t0 = Instant::now();
        let period = Duration::from_millis(200);
        timers.start(TimerKind::DistanceWatch, period, t0 + period);

        assert!(timers.take_due(t0).is_empty());
        assert_eq!(timers.take_due(t0 + period).as_slice(), &[TimerKind::DistanceWatch]);
        assert_eq!(timers.next_deadline(), Some(t0 + period * 2));

        // fell far behind: fires once, resumes from now
        let late = t0 + Duration::from_secs(5);
        assert_eq!(timers.take_due(late).len(), 1);
        assert_eq!(timers.next_deadline(), Some(late + period));
    }

    #[test]
    fn test_one_shot_is_removed() {
        let mut timers = TimerSet::new(None);
        let t0 = Instant::now();
        timers.start_once(TimerKind::CalibrationCheck, t0 + Duration::from_secs(20));
        let due = timers.take_due(t0 + Duration::from_secs(20));
        assert_eq!(due.as_slice(), &[TimerKind::CalibrationCheck]);
        assert!(!timers.is_active(TimerKind::CalibrationCheck));
    }

    #[test]
    fn test_next_deadline_is_earliest() {
        let mut timers = TimerSet::new(None);
        let t0 = Instant::now();
        timers.start(TimerKind::Heartbeat, Duration::from_secs(1), t0 + Duration::from_secs(1));
        timers.start(TimerKind::Relevance, Duration::from_secs(5), t0);
        assert_eq!(timers.next_deadline(), Some(t0));
        timers.ensure(TimerKind::Relevance, false, Duration::from_secs(5), t0);
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_secs(1)));
    }
}
