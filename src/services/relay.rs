//! Relay: per-crosswalk rooms and distance-based notifications
//!
//! Participants publish enter/leave/update events; the relay keeps one room
//! per crosswalk, prunes silent members and tells pedestrians and drivers
//! when a vehicle is close enough to matter. All state is owned by the
//! single relay task, so no locking is needed.

use crate::domain::types::{CrosswalkId, Role};
use crate::infra::config::RelayConfig;
use crate::infra::metrics::Metrics;
use crate::io::channel::{DownMessage, UpMessage};
use crate::io::mqtt::{RelayInbound, RelayOutbound};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct DriverEntry {
    distance: Option<f64>,
    updated_at: Instant,
}

#[derive(Debug, Default)]
struct Room {
    /// pid -> last enter/refresh
    peds: FxHashMap<String, Instant>,
    drivers: FxHashMap<String, DriverEntry>,
    /// Distance carried by the last ped_critical, if one is outstanding
    ped_critical: Option<f64>,
    /// pid -> distance carried by the last driver_critical
    driver_critical: FxHashMap<String, f64>,
}

impl Room {
    fn is_empty(&self) -> bool {
        self.peds.is_empty() && self.drivers.is_empty()
    }

    fn remove(&mut self, pid: &str) -> bool {
        let ped = self.peds.remove(pid).is_some();
        let driver = self.drivers.remove(pid).is_some();
        self.driver_critical.remove(pid);
        ped || driver
    }

    fn ped_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peds.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn driver_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Room state for every crosswalk with at least one member
pub struct RoomRegistry {
    config: RelayConfig,
    rooms: FxHashMap<CrosswalkId, Room>,
    /// Learned from the first enter of each pid
    roles: FxHashMap<String, Role>,
    metrics: Arc<Metrics>,
}

impl RoomRegistry {
    pub fn new(config: RelayConfig, metrics: Arc<Metrics>) -> Self {
        Self { config, rooms: FxHashMap::default(), roles: FxHashMap::default(), metrics }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn role_of(&self, pid: &str) -> Option<Role> {
        self.roles.get(pid).copied()
    }

    /// (pedestrians, drivers) currently in a room
    pub fn counts(&self, id: CrosswalkId) -> (usize, usize) {
        self.rooms.get(&id).map(|r| (r.peds.len(), r.drivers.len())).unwrap_or((0, 0))
    }

    /// Apply one participant event and return the notifications it causes
    pub fn handle_up(&mut self, inbound: RelayInbound, now: Instant) -> Vec<RelayOutbound> {
        let RelayInbound { pid, msg } = inbound;
        debug!(pid = %pid, event = msg.event_name(), "relay_event");

        let affected: Vec<CrosswalkId> = match msg {
            UpMessage::PedEnter { crosswalk_id } => {
                self.roles.entry(pid.clone()).or_insert(Role::Pedestrian);
                let room = self.rooms.entry(crosswalk_id).or_default();
                room.drivers.remove(&pid);
                room.peds.insert(pid, now);
                vec![crosswalk_id]
            }
            UpMessage::DriverEnter { crosswalk_id, distance, .. } => {
                self.roles.entry(pid.clone()).or_insert(Role::Driver);
                let room = self.rooms.entry(crosswalk_id).or_default();
                room.peds.remove(&pid);
                room.drivers.insert(pid, DriverEntry { distance, updated_at: now });
                vec![crosswalk_id]
            }
            UpMessage::DriverUpdate { crosswalk_id, distance, .. } => {
                let Some(entry) = self.rooms.get_mut(&crosswalk_id).and_then(|r| r.drivers.get_mut(&pid)) else {
                    debug!(pid = %pid, crosswalk = %crosswalk_id, "driver_update_not_member");
                    return Vec::new();
                };
                entry.distance = distance;
                entry.updated_at = now;
                vec![crosswalk_id]
            }
            UpMessage::PedLeave { crosswalk_id } | UpMessage::DriverLeave { crosswalk_id } => {
                match self.rooms.get_mut(&crosswalk_id).map(|room| room.remove(&pid)) {
                    Some(true) => vec![crosswalk_id],
                    _ => Vec::new(),
                }
            }
            UpMessage::Disconnect => {
                self.roles.remove(&pid);
                let mut ids: Vec<CrosswalkId> =
                    self.rooms.iter_mut().filter_map(|(id, room)| room.remove(&pid).then_some(*id)).collect();
                ids.sort();
                if !ids.is_empty() {
                    info!(pid = %pid, rooms = ids.len(), "relay_participant_disconnected");
                }
                ids
            }
        };

        let mut out = Vec::new();
        for id in affected {
            out.extend(self.evaluate(id, now));
        }
        self.metrics.set_relay_rooms(self.rooms.len());
        out
    }

    /// Prune expired members of one room, then send criticals, ends and presence
    pub fn evaluate(&mut self, id: CrosswalkId, now: Instant) -> Vec<RelayOutbound> {
        let driver_ttl = Duration::from_millis(self.config.driver_ttl_ms);
        let ped_ttl = Duration::from_millis(self.config.ped_ttl_ms);
        let cfg = &self.config;
        let mut out = Vec::new();

        let Some(room) = self.rooms.get_mut(&id) else {
            return out;
        };

        let expired: Vec<String> = room
            .drivers
            .iter()
            .filter(|(_, d)| now.saturating_duration_since(d.updated_at) > driver_ttl)
            .map(|(pid, _)| pid.clone())
            .collect();
        for pid in expired {
            debug!(pid = %pid, crosswalk = %id, "relay_driver_expired");
            room.drivers.remove(&pid);
            room.driver_critical.remove(&pid);
        }
        room.peds.retain(|_, seen| now.saturating_duration_since(*seen) <= ped_ttl);

        if room.is_empty() {
            self.rooms.remove(&id);
            debug!(crosswalk = %id, "relay_room_closed");
            return out;
        }

        let peds = room.ped_ids();
        let drivers = room.driver_ids();
        let min_distance = room.drivers.values().filter_map(|d| d.distance).fold(None, |acc: Option<f64>, d| {
            Some(acc.map_or(d, |m| m.min(d)))
        });

        // Pedestrian side
        match min_distance {
            Some(d) if d <= cfg.ped_critical_distance_m && !peds.is_empty() => {
                let resend = room.ped_critical.map_or(true, |prev| (prev - d).abs() >= cfg.debounce_m);
                if resend {
                    room.ped_critical = Some(d);
                    for pid in &peds {
                        out.push(RelayOutbound { pid: pid.clone(), msg: DownMessage::ped_critical(id, d) });
                    }
                }
            }
            _ => {
                if room.ped_critical.take().is_some() {
                    for pid in &peds {
                        out.push(RelayOutbound { pid: pid.clone(), msg: DownMessage::alert_end(id) });
                    }
                }
            }
        }

        // Driver side
        for pid in &drivers {
            let distance = room.drivers.get(pid).and_then(|d| d.distance);
            match distance {
                Some(d) if d <= cfg.driver_critical_distance_m && !peds.is_empty() => {
                    let resend =
                        room.driver_critical.get(pid).map_or(true, |prev| (prev - d).abs() >= cfg.debounce_m);
                    if resend {
                        room.driver_critical.insert(pid.clone(), d);
                        out.push(RelayOutbound { pid: pid.clone(), msg: DownMessage::driver_critical(id) });
                    }
                }
                _ => {
                    if room.driver_critical.remove(pid).is_some() {
                        out.push(RelayOutbound { pid: pid.clone(), msg: DownMessage::alert_end(id) });
                    }
                }
            }
        }

        for pid in peds.iter().chain(drivers.iter()) {
            out.push(RelayOutbound { pid: pid.clone(), msg: DownMessage::presence(id, peds.len(), drivers.len()) });
        }

        for _ in &out {
            self.metrics.record_relay_notification();
        }
        out
    }

    /// Evaluate every room; rooms whose members all expired are dropped
    pub fn prune_all(&mut self, now: Instant) -> Vec<RelayOutbound> {
        let mut ids: Vec<CrosswalkId> = self.rooms.keys().copied().collect();
        ids.sort();
        let mut out = Vec::new();
        for id in ids {
            out.extend(self.evaluate(id, now));
        }
        self.metrics.set_relay_rooms(self.rooms.len());
        out
    }
}

/// Run the relay until shutdown
pub async fn run_relay(
    config: RelayConfig,
    mut inbox: mpsc::Receiver<RelayInbound>,
    outbound: mpsc::Sender<RelayOutbound>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let prune_every = Duration::from_millis(config.prune_interval_ms.max(1));
    let mut registry = RoomRegistry::new(config, metrics.clone());
    let mut prune = tokio::time::interval(prune_every);
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(prune_interval_ms = %prune_every.as_millis(), "relay_started");

    loop {
        let out = tokio::select! {
            event = inbox.recv() => {
                let Some(inbound) = event else { break };
                let start = Instant::now();
                let out = registry.handle_up(inbound, start);
                metrics.record_event_processed(start.elapsed().as_micros() as u64);
                out
            }
            _ = prune.tick() => registry.prune_all(Instant::now()),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        for msg in out {
            if let Err(e) = outbound.try_send(msg) {
                metrics.record_channel_dropped();
                warn!(error = %e, "relay_outbound_dropped");
            }
        }
    }

    info!(rooms = registry.room_count(), "relay_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const CW: CrosswalkId = CrosswalkId(42);

    fn registry() -> RoomRegistry {
        RoomRegistry::new(RelayConfig::default(), Arc::new(Metrics::new()))
    }

    fn up(pid: &str, msg: UpMessage) -> RelayInbound {
        RelayInbound { pid: pid.to_string(), msg }
    }

    fn driver_enter(distance: f64) -> UpMessage {
        UpMessage::DriverEnter { crosswalk_id: CW, distance: Some(distance), speed: Some(8.0) }
    }

    fn driver_update(distance: f64) -> UpMessage {
        UpMessage::DriverUpdate { crosswalk_id: CW, distance: Some(distance), speed: Some(8.0) }
    }

    fn events<'a>(out: &'a [RelayOutbound], pid: &str) -> Vec<&'a str> {
        out.iter().filter(|o| o.pid == pid).map(|o| o.msg.event_name()).collect()
    }

    #[test]
    fn test_ped_enter_sends_presence() {
        let mut reg = registry();
        let now = Instant::now();
        let out = reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), now);

        assert_eq!(out.len(), 1);
        match &out[0].msg {
            DownMessage::Presence { crosswalk_id, ped_count, driver_count, .. } => {
                assert_eq!((*crosswalk_id, *ped_count, *driver_count), (CW, 1, 0));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(reg.counts(CW), (1, 0));
        assert_eq!(reg.role_of("p1"), Some(Role::Pedestrian));
        assert_eq!(reg.room_count(), 1);
    }

    #[test]
    fn test_close_driver_alerts_both_sides() {
        let mut reg = registry();
        let now = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), now);
        let out = reg.handle_up(up("d1", driver_enter(40.0)), now);

        assert_eq!(events(&out, "p1"), vec!["ped_critical", "presence"]);
        assert_eq!(events(&out, "d1"), vec!["driver_critical", "presence"]);
        match &out[0].msg {
            DownMessage::PedCritical { min_distance, .. } => assert_eq!(*min_distance, 40.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_pedestrian_only_threshold() {
        let mut reg = registry();
        let now = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), now);
        let out = reg.handle_up(up("d1", driver_enter(80.0)), now);

        assert_eq!(events(&out, "p1"), vec!["ped_critical", "presence"]);
        assert_eq!(events(&out, "d1"), vec!["presence"]);
    }

    #[test]
    fn test_no_pedestrians_no_critical() {
        let mut reg = registry();
        let now = Instant::now();
        let out = reg.handle_up(up("d1", driver_enter(10.0)), now);
        assert_eq!(events(&out, "d1"), vec!["presence"]);
    }

    #[test]
    fn test_debounce_small_moves() {
        let mut reg = registry();
        let now = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), now);
        reg.handle_up(up("d1", driver_enter(40.0)), now);

        let out = reg.handle_up(up("d1", driver_update(38.5)), now);
        assert_eq!(events(&out, "p1"), vec!["presence"]);
        assert_eq!(events(&out, "d1"), vec!["presence"]);

        let out = reg.handle_up(up("d1", driver_update(36.0)), now);
        assert_eq!(events(&out, "p1"), vec!["ped_critical", "presence"]);
        assert_eq!(events(&out, "d1"), vec!["driver_critical", "presence"]);
    }

    #[test]
    fn test_driver_moving_away_ends_alerts() {
        let mut reg = registry();
        let now = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), now);
        reg.handle_up(up("d1", driver_enter(40.0)), now);

        // Still inside the pedestrian radius; the new distance is re-sent
        let out = reg.handle_up(up("d1", driver_update(70.0)), now);
        assert_eq!(events(&out, "p1"), vec!["ped_critical", "presence"]);
        assert_eq!(events(&out, "d1"), vec!["alert_end", "presence"]);

        let out = reg.handle_up(up("d1", driver_update(150.0)), now);
        assert_eq!(events(&out, "p1"), vec!["alert_end", "presence"]);
        assert_eq!(events(&out, "d1"), vec!["presence"]);
    }

    #[test]
    fn test_last_pedestrian_leaving_ends_driver_alert() {
        let mut reg = registry();
        let now = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), now);
        reg.handle_up(up("d1", driver_enter(20.0)), now);

        let out = reg.handle_up(up("p1", UpMessage::PedLeave { crosswalk_id: CW }), now);
        assert!(events(&out, "p1").is_empty());
        assert_eq!(events(&out, "d1"), vec!["alert_end", "presence"]);
        assert_eq!(reg.counts(CW), (0, 1));
    }

    #[test]
    fn test_leave_only_touches_that_room() {
        let mut reg = registry();
        let now = Instant::now();
        let other = CrosswalkId(7);
        reg.handle_up(up("d1", driver_enter(80.0)), now);
        reg.handle_up(up("d1", UpMessage::DriverEnter { crosswalk_id: other, distance: Some(90.0), speed: None }), now);

        let out = reg.handle_up(up("d1", UpMessage::DriverLeave { crosswalk_id: other }), now);
        assert!(out.is_empty());
        assert_eq!(reg.counts(CW), (0, 1));
        assert_eq!(reg.counts(other), (0, 0));

        // leaving a room it is not in changes nothing
        let out = reg.handle_up(up("d1", UpMessage::DriverLeave { crosswalk_id: other }), now);
        assert!(out.is_empty());
        assert_eq!(reg.room_count(), 1);
    }

    #[test]
    fn test_update_from_non_member_ignored() {
        let mut reg = registry();
        let now = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), now);
        let out = reg.handle_up(up("d9", driver_update(5.0)), now);
        assert!(out.is_empty());
        assert_eq!(reg.counts(CW), (1, 0));
    }

    #[test]
    fn test_disconnect_removes_from_every_room() {
        let mut reg = registry();
        let now = Instant::now();
        let other = CrosswalkId(7);
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), now);
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: other }), now);
        reg.handle_up(up("p2", UpMessage::PedEnter { crosswalk_id: other }), now);

        let out = reg.handle_up(up("p1", UpMessage::Disconnect), now);
        assert_eq!(events(&out, "p2"), vec!["presence"]);
        assert_eq!(reg.room_count(), 1);
        assert_eq!(reg.counts(other), (1, 0));
        assert_eq!(reg.role_of("p1"), None);
    }

    #[test]
    fn test_prune_expires_silent_driver() {
        let mut reg = registry();
        let start = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), start);
        reg.handle_up(up("d1", driver_enter(30.0)), start);

        let out = reg.prune_all(start + Duration::from_millis(2_000));
        assert_eq!(reg.counts(CW), (1, 1));
        assert_eq!(events(&out, "p1"), vec!["presence"]);

        let out = reg.prune_all(start + Duration::from_millis(3_500));
        assert_eq!(reg.counts(CW), (1, 0));
        assert_eq!(events(&out, "p1"), vec!["alert_end", "presence"]);
    }

    #[test]
    fn test_prune_closes_empty_room() {
        let mut reg = registry();
        let start = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), start);

        let out = reg.prune_all(start + Duration::from_secs(16));
        assert!(out.is_empty());
        assert_eq!(reg.room_count(), 0);
        assert_eq!(reg.metrics.relay_rooms(), 0);
    }

    #[test]
    fn test_ped_refresh_keeps_membership() {
        let mut reg = registry();
        let start = Instant::now();
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), start);
        reg.handle_up(up("p1", UpMessage::PedEnter { crosswalk_id: CW }), start + Duration::from_secs(10));

        reg.prune_all(start + Duration::from_secs(20));
        assert_eq!(reg.counts(CW), (1, 0));
    }

    #[tokio::test]
    async fn test_run_relay_forwards_notifications() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(Metrics::new());

        let handle = tokio::spawn(run_relay(RelayConfig::default(), in_rx, out_tx, metrics.clone(), shutdown_rx));

        in_tx.send(up("p1", UpMessage::PedEnter { crosswalk_id: CW })).await.unwrap();
        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.pid, "p1");
        assert_eq!(first.msg.event_name(), "presence");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(metrics.relay_notifications() >= 1);
        assert_eq!(metrics.relay_rooms(), 1);
    }
}
