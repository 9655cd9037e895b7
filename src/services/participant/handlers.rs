//! Event handlers for the participant loop
//!
//! Each handler updates local state and returns the triggers it proposes;
//! `settle` applies them.

use super::Participant;
use crate::domain::alert::Trigger;
use crate::domain::types::{Location, Role};
use crate::io::channel::{DownMessage, PredictRequest};
use crate::io::sensor_feed::Command;
use crate::services::presence::Triggers;
use crate::services::relevance::LookupOutcome;
use crate::services::timers::TimerKind;
use crate::services::watching::Calibration;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl Participant {
    pub(super) fn handle_connected(&mut self) -> Triggers {
        self.connected = true;
        self.presence.on_reconnect();
        Triggers::new()
    }

    pub(super) fn handle_disconnected(&mut self) -> Triggers {
        self.connected = false;
        info!(rooms = %self.presence.joined().len(), "participant_offline_state_kept");
        Triggers::new()
    }

    pub(super) fn handle_down_message(&mut self, msg: DownMessage) -> Triggers {
        match msg {
            DownMessage::PredictResult { pid, result } => self.handle_predict_result(pid.as_deref(), result),
            other => self.presence.on_message(&other),
        }
    }

    fn handle_predict_result(&mut self, pid: Option<&str>, result: bool) -> Triggers {
        let mut triggers = Triggers::new();
        if let Some(pid) = pid {
            if pid != self.config.pid() {
                debug!(pid = %pid, "predict_result_for_other_participant");
                return triggers;
            }
        }
        if self.role != Role::Pedestrian {
            return triggers;
        }
        let level = self.level();
        triggers.extend(self.visual.on_result(result, level));
        triggers
    }

    pub(super) fn handle_location(&mut self, location: Location) -> Triggers {
        let mut triggers = Triggers::new();
        if !location.latitude.is_finite() || !location.longitude.is_finite() {
            warn!("location_not_finite_ignored");
            return triggers;
        }
        let level = self.level();
        triggers.extend(self.accuracy.evaluate(Some(&location), level));
        self.location = Some(location);
        triggers
    }

    pub(super) fn handle_heading(&mut self, degrees: f64) -> Triggers {
        if degrees.is_finite() {
            self.heading = Some(degrees.rem_euclid(360.0));
        }
        Triggers::new()
    }

    pub(super) fn handle_magnitude(&mut self, value: f64, now: Instant) -> Triggers {
        let mut triggers = Triggers::new();
        if self.role != Role::Pedestrian {
            return triggers;
        }
        if let Some(calibration) = self.calibration.as_mut() {
            calibration.record(value, now);
            return triggers;
        }
        let level = self.level();
        triggers.extend(self.watching.record(value, level));
        triggers
    }

    pub(super) fn handle_frame(&mut self, image: String) -> Triggers {
        if self.role == Role::Pedestrian {
            self.frame = Some(image);
        }
        Triggers::new()
    }

    pub(super) fn handle_command(&mut self, cmd: Command, now: Instant) -> Triggers {
        let mut triggers = Triggers::new();
        match cmd {
            Command::Start => triggers.push(Trigger::ManualStart),
            Command::Stop => triggers.push(Trigger::ManualStop),
            Command::Calibrate => self.start_calibration(now),
            Command::CancelCalibration => {
                if self.calibration.take().is_some() {
                    self.timers.stop(TimerKind::CalibrationCheck);
                    info!("calibration_cancelled");
                }
            }
        }
        triggers
    }

    fn start_calibration(&mut self, now: Instant) {
        if self.role != Role::Pedestrian {
            debug!("calibration_ignored_for_driver");
            return;
        }
        let cfg = self.config.watching();
        let calibration =
            Calibration::start(now, Duration::from_secs(cfg.calibration_phase_secs), cfg.calibration_min_average);
        self.timers.stop(TimerKind::CalibrationCheck);
        self.timers.start_once(TimerKind::CalibrationCheck, calibration.deadline());
        self.calibration = Some(calibration);
        self.last_error = None;
    }

    /// Close a calibration run whose time is up
    pub(super) fn finish_calibration(&mut self, now: Instant) -> Triggers {
        let mut triggers = Triggers::new();
        let Some(calibration) = self.calibration.take() else {
            return triggers;
        };
        match calibration.poll(now) {
            Some(Ok(threshold)) => {
                self.metrics.record_calibration(true);
                self.watching.set_threshold(threshold);
                let level = self.level();
                triggers.extend(self.watching.evaluate(level));
            }
            Some(Err(e)) => {
                self.metrics.record_calibration(false);
                warn!(error = %e, kept_threshold = %self.watching.threshold(), "calibration_failed");
                self.last_error = Some(e.to_string());
            }
            None => {
                self.timers.start_once(TimerKind::CalibrationCheck, calibration.deadline());
                self.calibration = Some(calibration);
            }
        }
        triggers
    }

    pub(super) fn handle_lookup_outcome(&mut self, outcome: LookupOutcome) -> Triggers {
        let mut triggers = Triggers::new();
        let level = self.level();
        triggers.extend(self.relevance.apply(outcome, level));
        triggers
    }

    /// Hand the latest camera frame to the classifier
    pub(super) fn submit_frame(&mut self) {
        let Some(image) = self.frame.take() else {
            return;
        };
        self.sender.send_predict(PredictRequest {
            pid: self.config.pid().to_string(),
            image,
            allow_store: self.config.visual().allow_store,
        });
    }
}
