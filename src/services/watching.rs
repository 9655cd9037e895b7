//! Phone-watching detection from acceleration magnitude
//!
//! Walking while looking at the phone damps the gait signal: the moving
//! average sits between a small noise floor and a per-user threshold. The
//! threshold comes from a two-phase calibration (walk normally, then walk
//! while watching) or from config.

use crate::domain::alert::Trigger;
use crate::domain::types::AlertLevel;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

pub struct WatchingDetector {
    window: VecDeque<f64>,
    capacity: usize,
    min_magnitude: f64,
    /// 0 means uncalibrated; the detector proposes nothing until set
    threshold: f64,
}

impl WatchingDetector {
    pub fn new(capacity: usize, min_magnitude: f64, threshold: f64) -> Self {
        let capacity = capacity.max(1);
        Self { window: VecDeque::with_capacity(capacity), capacity, min_magnitude, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        info!(threshold = %format!("{threshold:.3}"), "watching_threshold_set");
        self.threshold = threshold;
    }

    pub fn is_calibrated(&self) -> bool {
        self.threshold > 0.0
    }

    /// Moving average over the current window; 0 when empty
    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Record a sample and propose a trigger; samples are ignored while off
    pub fn record(&mut self, magnitude: f64, level: AlertLevel) -> Option<Trigger> {
        if !level.is_active() || !magnitude.is_finite() {
            return None;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(magnitude);
        self.evaluate(level)
    }

    /// Propose a trigger from the current average without recording
    pub fn evaluate(&self, level: AlertLevel) -> Option<Trigger> {
        if !self.is_calibrated() || !level.is_active() {
            return None;
        }
        let avg = self.average();
        let in_band = avg > self.min_magnitude && avg < self.threshold;
        if in_band && level == AlertLevel::ACTIVE {
            Some(Trigger::WatchingDetected)
        } else if !in_band && level >= AlertLevel::SUSPECTED {
            Some(Trigger::WatchingCleared)
        } else {
            None
        }
    }

    /// Forget the window when the participant deactivates
    pub fn clear(&mut self) {
        if !self.window.is_empty() {
            debug!(samples = %self.window.len(), "watching_window_cleared");
        }
        self.window.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CalibrationError {
    #[error("not-watching phase average {average:.2} is at or below {min:.2}; keep walking during calibration")]
    NotWatchingTooLow { average: f64, min: f64 },
    #[error("watching phase average {average:.2} is at or below {min:.2}; keep walking during calibration")]
    WatchingTooLow { average: f64, min: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    NotWatching,
    Watching,
}

#[derive(Debug, Default, Clone, Copy)]
struct PhaseStats {
    sum: f64,
    count: u64,
}

impl PhaseStats {
    fn push(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Two-phase calibration run, driven by sample arrival and `poll`
pub struct Calibration {
    started_at: Instant,
    phase_len: Duration,
    min_average: f64,
    not_watching: PhaseStats,
    watching: PhaseStats,
}

impl Calibration {
    pub fn start(now: Instant, phase_len: Duration, min_average: f64) -> Self {
        info!(phase_secs = %phase_len.as_secs(), "calibration_started");
        Self {
            started_at: now,
            phase_len,
            min_average,
            not_watching: PhaseStats::default(),
            watching: PhaseStats::default(),
        }
    }

    pub fn phase(&self, now: Instant) -> CalibrationPhase {
        if now.saturating_duration_since(self.started_at) < self.phase_len {
            CalibrationPhase::NotWatching
        } else {
            CalibrationPhase::Watching
        }
    }

    /// When the run ends
    pub fn deadline(&self) -> Instant {
        self.started_at + self.phase_len * 2
    }

    pub fn record(&mut self, magnitude: f64, now: Instant) {
        if !magnitude.is_finite() || now >= self.deadline() {
            return;
        }
        match self.phase(now) {
            CalibrationPhase::NotWatching => self.not_watching.push(magnitude),
            CalibrationPhase::Watching => self.watching.push(magnitude),
        }
    }

    /// Finish the run if its time is up
    ///
    /// Returns the new threshold (mean of the two phase averages) or the
    /// reason the run failed; `None` while still collecting.
    pub fn poll(&self, now: Instant) -> Option<Result<f64, CalibrationError>> {
        if now < self.deadline() {
            return None;
        }
        Some(self.finish())
    }

    fn finish(&self) -> Result<f64, CalibrationError> {
        let not_watching = self.not_watching.average();
        let watching = self.watching.average();
        if not_watching <= self.min_average {
            return Err(CalibrationError::NotWatchingTooLow { average: not_watching, min: self.min_average });
        }
        if watching <= self.min_average {
            return Err(CalibrationError::WatchingTooLow { average: watching, min: self.min_average });
        }
        Ok((not_watching + watching) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inert_until_calibrated() {
        let mut d = WatchingDetector::new(100, 0.5, 0.0);
        assert_eq!(d.record(2.0, AlertLevel::ACTIVE), None);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_in_band_detects_at_active() {
        let mut d = WatchingDetector::new(100, 0.5, 3.0);
        assert_eq!(d.record(2.0, AlertLevel::ACTIVE), Some(Trigger::WatchingDetected));
        assert_eq!(d.record(2.0, AlertLevel::SUSPECTED), None);
    }

    #[test]
    fn test_out_of_band_clears_at_suspected_or_above() {
        let mut d = WatchingDetector::new(100, 0.5, 3.0);
        assert_eq!(d.record(5.0, AlertLevel::SUSPECTED), Some(Trigger::WatchingCleared));
        let mut d = WatchingDetector::new(100, 0.5, 3.0);
        assert_eq!(d.record(0.2, AlertLevel::CROSSWALK), Some(Trigger::WatchingCleared));
        let mut d = WatchingDetector::new(100, 0.5, 3.0);
        assert_eq!(d.record(5.0, AlertLevel::ACTIVE), None);
    }

    #[test]
    fn test_band_edges_are_exclusive() {
        let mut d = WatchingDetector::new(1, 0.5, 3.0);
        assert_eq!(d.record(3.0, AlertLevel::ACTIVE), None);
        assert_eq!(d.record(0.5, AlertLevel::ACTIVE), None);
    }

    #[test]
    fn test_average_exact_after_long_session() {
        let mut d = WatchingDetector::new(100, 0.5, 3.0);
        for i in 0..100_000 {
            d.record(if i % 2 == 0 { 1e12 } else { 0.1 }, AlertLevel::ACTIVE);
        }
        for _ in 0..100 {
            d.record(2.0, AlertLevel::SUSPECTED);
        }
        assert_eq!(d.average(), 2.0);
        assert_eq!(d.evaluate(AlertLevel::ACTIVE), Some(Trigger::WatchingDetected));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut d = WatchingDetector::new(3, 0.5, 10.0);
        for v in [1.0, 1.0, 1.0, 4.0, 4.0, 4.0] {
            d.record(v, AlertLevel::ACTIVE);
        }
        assert_eq!(d.len(), 3);
        assert!((d.average() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_samples_ignored_while_off_and_cleared() {
        let mut d = WatchingDetector::new(10, 0.5, 3.0);
        assert_eq!(d.record(2.0, AlertLevel::OFF), None);
        assert!(d.is_empty());
        d.record(2.0, AlertLevel::ACTIVE);
        d.clear();
        assert!(d.is_empty());
        assert_eq!(d.average(), 0.0);
    }

    #[test]
    fn test_calibration_threshold_is_mean_of_phases() {
        let t0 = Instant::now();
        let phase = Duration::from_secs(10);
        let mut c = Calibration::start(t0, phase, 1.0);
        c.record(4.0, t0 + Duration::from_secs(1));
        c.record(6.0, t0 + Duration::from_secs(9));
        c.record(2.0, t0 + Duration::from_secs(11));
        assert_eq!(c.phase(t0 + Duration::from_secs(11)), CalibrationPhase::Watching);
        assert_eq!(c.poll(t0 + Duration::from_secs(19)), None);
        assert_eq!(c.poll(t0 + Duration::from_secs(20)), Some(Ok(3.5)));
    }

    #[test]
    fn test_calibration_fails_on_low_phase() {
        let t0 = Instant::now();
        let phase = Duration::from_secs(10);
        let mut c = Calibration::start(t0, phase, 1.0);
        c.record(4.0, t0 + Duration::from_secs(1));
        c.record(1.0, t0 + Duration::from_secs(12));
        assert!(matches!(
            c.poll(t0 + Duration::from_secs(20)),
            Some(Err(CalibrationError::WatchingTooLow { .. }))
        ));

        let c = Calibration::start(t0, phase, 1.0);
        assert!(matches!(
            c.poll(t0 + Duration::from_secs(25)),
            Some(Err(CalibrationError::NotWatchingTooLow { .. }))
        ));
    }
}
