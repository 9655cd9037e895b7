//! Crosswalk room membership and presence interpretation
//!
//! The coordinator is the only owner of the joined and critical sets. The
//! participant loop hands it the current level and target set after every
//! event; it emits enter/leave messages to converge and proposes triggers
//! from what the relay reports about the rooms it is in.

use crate::domain::alert::Trigger;
use crate::domain::types::{AlertLevel, CrosswalkId, DangeredCrosswalk, Role};
use crate::infra::config::PresencePolicy;
use crate::infra::metrics::Metrics;
use crate::io::channel::{ChannelSender, DownMessage, UpMessage};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

pub type Triggers = SmallVec<[Trigger; 2]>;

/// A room the participant should be in, with what the driver reports to it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoomTarget {
    pub id: CrosswalkId,
    pub distance: Option<f64>,
    pub speed: Option<f64>,
}

impl RoomTarget {
    pub fn bare(id: CrosswalkId) -> Self {
        Self { id, distance: None, speed: None }
    }
}

impl From<&DangeredCrosswalk> for RoomTarget {
    fn from(d: &DangeredCrosswalk) -> Self {
        Self {
            id: d.id,
            distance: Some(d.distance).filter(|v| v.is_finite()),
            speed: d.speed.filter(|v| v.is_finite()),
        }
    }
}

pub struct PresenceCoordinator {
    role: Role,
    policy: PresencePolicy,
    joined: BTreeSet<CrosswalkId>,
    critical: BTreeSet<CrosswalkId>,
    /// Latest reported distance/speed per joined room (driver)
    reports: BTreeMap<CrosswalkId, RoomTarget>,
    /// Latest counterpart count per joined room, from `presence`
    counterparts: BTreeMap<CrosswalkId, u32>,
    sender: ChannelSender,
    metrics: Arc<Metrics>,
}

impl PresenceCoordinator {
    pub fn new(role: Role, policy: PresencePolicy, sender: ChannelSender, metrics: Arc<Metrics>) -> Self {
        Self {
            role,
            policy,
            joined: BTreeSet::new(),
            critical: BTreeSet::new(),
            reports: BTreeMap::new(),
            counterparts: BTreeMap::new(),
            sender,
            metrics,
        }
    }

    pub fn policy(&self) -> PresencePolicy {
        self.policy
    }

    pub fn joined(&self) -> &BTreeSet<CrosswalkId> {
        &self.joined
    }

    pub fn critical(&self) -> &BTreeSet<CrosswalkId> {
        &self.critical
    }

    pub fn is_member(&self, id: CrosswalkId) -> bool {
        self.joined.contains(&id)
    }

    /// Whether any joined room last reported a counterpart
    pub fn has_counterpart(&self) -> bool {
        self.counterparts.values().any(|&n| n > 0)
    }

    /// Escalation owed to a critical that was recorded below `critical_from`
    pub fn pending_critical(&self, level: AlertLevel) -> Option<Trigger> {
        let owed = !self.critical.is_empty() && level >= self.policy.critical_from && level < AlertLevel::CRITICAL;
        owed.then_some(Trigger::CriticalEntered { from: self.policy.critical_from })
    }

    /// Rooms the participant should hold at `level`
    pub fn targets(
        &self,
        level: AlertLevel,
        active_crosswalk: CrosswalkId,
        dangered: &[DangeredCrosswalk],
    ) -> Vec<RoomTarget> {
        if level < self.policy.join_level {
            return Vec::new();
        }
        match self.role {
            Role::Pedestrian if !active_crosswalk.is_none() => vec![RoomTarget::bare(active_crosswalk)],
            Role::Pedestrian => Vec::new(),
            Role::Driver => dangered.iter().map(RoomTarget::from).collect(),
        }
    }

    /// Converge membership on `targets`: leaves first (ascending), then enters
    pub fn reconcile(&mut self, level: AlertLevel, targets: &[RoomTarget]) -> Triggers {
        let mut triggers = Triggers::new();
        let wanted: BTreeMap<CrosswalkId, RoomTarget> = targets.iter().map(|t| (t.id, *t)).collect();

        let leaving: Vec<CrosswalkId> = self.joined.iter().filter(|id| !wanted.contains_key(id)).copied().collect();
        let had_critical = !self.critical.is_empty();
        let left_any = !leaving.is_empty();
        for id in leaving {
            self.leave(id);
        }

        for (id, target) in &wanted {
            self.reports.insert(*id, *target);
            if self.joined.insert(*id) {
                info!(crosswalk_id = %id, role = %self.role.as_str(), "room_entered");
                self.sender.send_up(self.enter_message(*id));
            }
        }

        if had_critical && self.critical.is_empty() {
            triggers.push(Trigger::CriticalCleared);
        }
        let counterpart_gone = left_any && self.critical.is_empty() && !self.has_counterpart();
        if level >= AlertLevel::PRESENCE && (self.joined.is_empty() || counterpart_gone) {
            triggers.push(Trigger::PresenceLeft);
        }
        triggers.extend(self.pending_critical(level));
        self.update_metrics();
        triggers
    }

    fn leave(&mut self, id: CrosswalkId) {
        self.joined.remove(&id);
        self.reports.remove(&id);
        self.counterparts.remove(&id);
        self.critical.remove(&id);
        info!(crosswalk_id = %id, role = %self.role.as_str(), "room_left");
        let msg = match self.role {
            Role::Pedestrian => UpMessage::PedLeave { crosswalk_id: id },
            Role::Driver => UpMessage::DriverLeave { crosswalk_id: id },
        };
        self.sender.send_up(msg);
    }

    fn enter_message(&self, id: CrosswalkId) -> UpMessage {
        match self.role {
            Role::Pedestrian => UpMessage::PedEnter { crosswalk_id: id },
            Role::Driver => {
                let report = self.reports.get(&id).copied().unwrap_or(RoomTarget::bare(id));
                UpMessage::DriverEnter { crosswalk_id: id, distance: report.distance, speed: report.speed }
            }
        }
    }

    /// Refresh every joined room
    pub fn heartbeat(&self) {
        for &id in &self.joined {
            let msg = match self.role {
                Role::Pedestrian => UpMessage::PedEnter { crosswalk_id: id },
                Role::Driver => {
                    let report = self.reports.get(&id).copied().unwrap_or(RoomTarget::bare(id));
                    UpMessage::DriverUpdate { crosswalk_id: id, distance: report.distance, speed: report.speed }
                }
            };
            self.sender.send_up(msg);
        }
    }

    /// Re-assert membership after the transport reconnects
    pub fn on_reconnect(&self) {
        if self.joined.is_empty() {
            return;
        }
        info!(rooms = %self.joined.len(), "rooms_reasserted");
        for &id in &self.joined {
            self.sender.send_up(self.enter_message(id));
        }
    }

    /// Leave every room and forget every critical assertion
    pub fn drain(&mut self) -> usize {
        let leaving: Vec<CrosswalkId> = self.joined.iter().copied().collect();
        for &id in &leaving {
            self.leave(id);
        }
        self.critical.clear();
        self.counterparts.clear();
        self.update_metrics();
        if !leaving.is_empty() {
            info!(rooms = %leaving.len(), "rooms_drained");
        }
        leaving.len()
    }

    /// Interpret a relay message about one of the rooms
    pub fn on_message(&mut self, msg: &DownMessage) -> Triggers {
        let mut triggers = Triggers::new();
        let id = match msg {
            DownMessage::Presence { crosswalk_id, .. }
            | DownMessage::PedCritical { crosswalk_id, .. }
            | DownMessage::DriverCritical { crosswalk_id, .. }
            | DownMessage::AlertEnd { crosswalk_id, .. } => *crosswalk_id,
            DownMessage::PredictResult { .. } => return triggers,
        };
        if !self.joined.contains(&id) {
            debug!(crosswalk_id = %id, event = msg.event_name(), "stale_room_event_ignored");
            self.metrics.record_stale_event();
            return triggers;
        }

        match (msg, self.role) {
            (DownMessage::Presence { ped_count, .. }, Role::Driver) => {
                self.counterparts.insert(id, *ped_count);
                if self.critical.is_empty() {
                    triggers.push(self.presence_trigger());
                }
            }
            (DownMessage::Presence { driver_count, .. }, Role::Pedestrian) => {
                self.counterparts.insert(id, *driver_count);
                if *driver_count == 0 && self.critical.remove(&id) && self.critical.is_empty() {
                    info!(crosswalk_id = %id, "critical_dropped_no_driver");
                    triggers.push(Trigger::CriticalCleared);
                }
                triggers.push(self.presence_trigger());
            }
            (DownMessage::PedCritical { min_distance, .. }, Role::Pedestrian) => {
                debug!(crosswalk_id = %id, min_distance = %min_distance, "ped_critical_received");
                self.enter_critical(id, &mut triggers);
            }
            (DownMessage::DriverCritical { .. }, Role::Driver) => {
                self.enter_critical(id, &mut triggers);
            }
            (DownMessage::AlertEnd { .. }, _) => {
                if self.critical.remove(&id) {
                    info!(crosswalk_id = %id, "critical_ended");
                    if self.critical.is_empty() {
                        triggers.push(Trigger::CriticalCleared);
                    }
                }
            }
            (other, role) => {
                debug!(event = other.event_name(), role = %role.as_str(), "room_event_for_other_role_ignored");
            }
        }
        self.update_metrics();
        triggers
    }

    /// Joined while any room has a counterpart, left otherwise
    fn presence_trigger(&self) -> Trigger {
        if self.has_counterpart() {
            Trigger::PresenceJoined
        } else {
            Trigger::PresenceLeft
        }
    }

    fn enter_critical(&mut self, id: CrosswalkId, triggers: &mut Triggers) {
        let first = self.critical.is_empty();
        if self.critical.insert(id) {
            info!(crosswalk_id = %id, "critical_asserted");
        }
        if first {
            triggers.push(Trigger::CriticalEntered { from: self.policy.critical_from });
        }
    }

    fn update_metrics(&self) {
        self.metrics.set_rooms(self.joined.len(), self.critical.len());
    }
}
