//! Participant event loop
//!
//! One `Participant` owns everything a pedestrian or driver client knows:
//! the alert level, the classifiers, the relevance engine, room membership
//! and the timer set. Sensor feeds, the transport and lookup tasks feed a
//! single inbox; the loop applies each event, settles the resulting
//! triggers and publishes a read-only snapshot.

mod handlers;

use crate::domain::alert::{AlertMachine, Transition, Trigger};
use crate::domain::types::{AlertLevel, CrosswalkId, Location, Role};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::channel::ChannelSender;
use crate::io::lookup::{GeoLookup, RoutingService};
use crate::io::mqtt::ChannelEvent;
use crate::io::sensor_feed::SensorInput;
use crate::services::accuracy_gate::AccuracyGate;
use crate::services::presence::{PresenceCoordinator, Triggers};
use crate::services::relevance::{LookupOutcome, RelevanceEngine};
use crate::services::timers::{TimerKind, TimerSet};
use crate::services::visual::CrosswalkVisualDetector;
use crate::services::watching::{Calibration, WatchingDetector};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Upper bound on trigger/reconcile rounds per event
const MAX_SETTLE_ROUNDS: usize = 8;

/// Everything that can arrive in a participant's inbox
#[derive(Debug)]
pub enum ParticipantEvent {
    Channel(ChannelEvent),
    Sensor(SensorInput),
    Lookup(LookupOutcome),
}

impl From<ChannelEvent> for ParticipantEvent {
    fn from(event: ChannelEvent) -> Self {
        ParticipantEvent::Channel(event)
    }
}

impl From<SensorInput> for ParticipantEvent {
    fn from(input: SensorInput) -> Self {
        ParticipantEvent::Sensor(input)
    }
}

/// Read-only view published after every event
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub level: AlertLevel,
    pub active_crosswalk: CrosswalkId,
    pub joined: Vec<CrosswalkId>,
    pub critical: Vec<CrosswalkId>,
    pub connected: bool,
    pub calibrating: bool,
    pub watching_threshold: f64,
    /// Last classifier error shown to the user
    pub last_error: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            level: AlertLevel::OFF,
            active_crosswalk: CrosswalkId::NONE,
            joined: Vec::new(),
            critical: Vec::new(),
            connected: false,
            calibrating: false,
            watching_threshold: 0.0,
            last_error: None,
        }
    }
}

pub struct Participant {
    pub(crate) config: Config,
    pub(crate) role: Role,
    pub(crate) machine: AlertMachine,
    pub(crate) accuracy: AccuracyGate,
    pub(crate) watching: WatchingDetector,
    pub(crate) calibration: Option<Calibration>,
    pub(crate) visual: CrosswalkVisualDetector,
    pub(crate) relevance: RelevanceEngine,
    pub(crate) presence: PresenceCoordinator,
    pub(crate) timers: TimerSet,
    pub(crate) sender: ChannelSender,
    /// Loopback for lookup tasks
    pub(crate) inbox: mpsc::Sender<ParticipantEvent>,
    pub(crate) location: Option<Location>,
    pub(crate) heading: Option<f64>,
    pub(crate) frame: Option<String>,
    pub(crate) connected: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) metrics: Arc<Metrics>,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl Participant {
    pub fn new(
        config: Config,
        sender: ChannelSender,
        inbox: mpsc::Sender<ParticipantEvent>,
        geo: Arc<dyn GeoLookup>,
        routing: Arc<dyn RoutingService>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let role = config.role();
        let watching_cfg = config.watching();
        let watching =
            WatchingDetector::new(watching_cfg.window, watching_cfg.min_magnitude, watching_cfg.threshold);
        let relevance = RelevanceEngine::new(role, config.relevance().clone(), geo, routing, metrics.clone());
        let presence = PresenceCoordinator::new(role, config.presence_policy(), sender.clone(), metrics.clone());
        let (snapshot_tx, _) = watch::channel(Snapshot::default());

        Self {
            role,
            machine: AlertMachine::new(),
            accuracy: AccuracyGate::new(config.accuracy().max_accuracy_m),
            watching,
            calibration: None,
            visual: CrosswalkVisualDetector::new(config.visual().miss_limit),
            relevance,
            presence,
            timers: TimerSet::new(Some(metrics.clone())),
            sender,
            inbox,
            location: None,
            heading: None,
            frame: None,
            connected: false,
            last_error: None,
            metrics,
            snapshot_tx,
            config,
        }
    }

    #[inline]
    pub fn level(&self) -> AlertLevel {
        self.machine.level()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            level: self.level(),
            active_crosswalk: self.relevance.active_crosswalk(),
            joined: self.presence.joined().iter().copied().collect(),
            critical: self.presence.critical().iter().copied().collect(),
            connected: self.connected,
            calibrating: self.calibration.is_some(),
            watching_threshold: self.watching.threshold(),
            last_error: self.last_error.clone(),
        }
    }

    /// Run until shutdown is signalled, then leave every room
    pub async fn run(&mut self, mut inbox: mpsc::Receiver<ParticipantEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(role = %self.role.as_str(), pid = %self.config.pid(), "participant_started");

        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                event = inbox.recv() => {
                    match event {
                        Some(e) => self.process_event(e),
                        None => break,
                    }
                }
                _ = sleep_until(deadline) => {
                    self.fire_timers(Instant::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    /// Process a single inbox event, then settle level and membership
    pub fn process_event(&mut self, event: ParticipantEvent) {
        let process_start = Instant::now();

        let triggers = match event {
            ParticipantEvent::Channel(ChannelEvent::Connected) => self.handle_connected(),
            ParticipantEvent::Channel(ChannelEvent::Disconnected) => self.handle_disconnected(),
            ParticipantEvent::Channel(ChannelEvent::Message(msg)) => self.handle_down_message(msg),
            ParticipantEvent::Sensor(SensorInput::Location(loc)) => self.handle_location(loc),
            ParticipantEvent::Sensor(SensorInput::Heading(degrees)) => self.handle_heading(degrees),
            ParticipantEvent::Sensor(SensorInput::Magnitude(value)) => self.handle_magnitude(value, process_start),
            ParticipantEvent::Sensor(SensorInput::Frame(image)) => self.handle_frame(image),
            ParticipantEvent::Sensor(SensorInput::Command(cmd)) => self.handle_command(cmd, process_start),
            ParticipantEvent::Lookup(outcome) => self.handle_lookup_outcome(outcome),
        };
        self.settle(triggers, process_start);

        let latency_us = process_start.elapsed().as_micros() as u64;
        self.metrics.record_event_processed(latency_us);
    }

    /// Run every timer due at `now`
    pub fn fire_timers(&mut self, now: Instant) {
        let mut triggers = Triggers::new();
        for kind in self.timers.take_due(now) {
            match kind {
                TimerKind::Predict => self.submit_frame(),
                TimerKind::Heartbeat => self.presence.heartbeat(),
                TimerKind::Relevance => self.spawn_lookup(now),
                TimerKind::DistanceWatch => {
                    self.relevance.recompute_dangered(self.location.as_ref());
                }
                TimerKind::CalibrationCheck => triggers.extend(self.finish_calibration(now)),
            }
        }
        self.settle(triggers, now);
    }

    /// Apply triggers in order until level, components and membership agree
    pub(crate) fn settle(&mut self, triggers: Triggers, now: Instant) {
        let mut queue: VecDeque<Trigger> = triggers.into_iter().collect();
        let mut rounds = 0;

        loop {
            while let Some(trigger) = queue.pop_front() {
                if let Some(transition) = self.machine.apply(trigger) {
                    self.on_transition(transition);
                }
            }

            let level = self.level();
            self.sync_components(level, now);

            let targets =
                self.presence.targets(level, self.relevance.active_crosswalk(), self.relevance.dangered());
            let derived = self.presence.reconcile(level, &targets);
            self.sync_heartbeat(now);

            if derived.is_empty() {
                break;
            }
            rounds += 1;
            if rounds >= MAX_SETTLE_ROUNDS {
                warn!(level = %level, pending = ?derived, "settle_rounds_exhausted");
                break;
            }
            queue.extend(derived);
        }

        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn on_transition(&mut self, t: Transition) {
        info!(from = %t.from, to = %t.to, trigger = t.trigger.as_str(), "alert_level_changed");
        self.metrics.record_transition(t.to);
        if t.to == AlertLevel::OFF {
            self.watching.clear();
            self.visual.reset();
        }
    }

    /// Start and stop level-dependent work
    fn sync_components(&mut self, level: AlertLevel, now: Instant) {
        self.relevance.sync(level);
        let period = self.relevance.refresh_period();
        self.timers.ensure(TimerKind::Relevance, self.relevance.is_active(), period, now);

        let watch_wanted = self.relevance.watch_wanted_at(level);
        if !watch_wanted {
            self.relevance.clear_dangered();
        }
        let period = self.relevance.distance_watch_period();
        self.timers.ensure(TimerKind::DistanceWatch, watch_wanted, period, now);

        let visual_wanted = self.role == Role::Pedestrian && CrosswalkVisualDetector::is_active(level);
        if !visual_wanted && self.timers.is_active(TimerKind::Predict) {
            self.visual.reset();
        }
        let period = Duration::from_millis(self.config.visual().predict_interval_ms);
        self.timers.ensure(TimerKind::Predict, visual_wanted, period, now + period);
    }

    fn sync_heartbeat(&mut self, now: Instant) {
        let period = Duration::from_millis(self.config.presence().heartbeat_ms);
        let wanted = !self.presence.joined().is_empty();
        self.timers.ensure(TimerKind::Heartbeat, wanted, period, now + period);
    }

    fn spawn_lookup(&mut self, now: Instant) {
        let Some(job) = self.relevance.plan(self.location.as_ref(), self.heading, now) else {
            return;
        };
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let outcome = job.run().await;
            if inbox.send(ParticipantEvent::Lookup(outcome)).await.is_err() {
                tracing::debug!("lookup_outcome_dropped_inbox_closed");
            }
        });
    }

    /// Leave every room and stop all timers
    pub fn shutdown(&mut self) {
        let left = self.presence.drain();
        self.timers.stop_all();
        self.snapshot_tx.send_replace(self.snapshot());
        info!(rooms_left = %left, level = %self.level(), "participant_stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}
