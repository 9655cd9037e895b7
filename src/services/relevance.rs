//! Crosswalk relevance engine
//!
//! Pedestrians look for the single crosswalk they are most likely about to
//! cross; drivers look for every crosswalk they can reach within a short
//! drive and then watch the live distance to those points.
//!
//! Lookups never run on the participant loop. `plan()` hands out a
//! `LookupJob` which the loop spawns; the job's `LookupOutcome` comes back
//! through the inbox and is folded in by `apply()`. At most one job is in
//! flight, and outcomes from an earlier activation are discarded by
//! generation.

use crate::domain::alert::Trigger;
use crate::domain::geo::{distance_m, undirected_difference};
use crate::domain::types::{
    AlertLevel, CrosswalkId, CrosswalkPoint, CrosswalkSet, DangeredCrosswalk, GeoPoint, Location, Role,
};
use crate::infra::config::RelevanceConfig;
use crate::infra::metrics::Metrics;
use crate::io::lookup::{GeoLookup, LookupError, RoutingService};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pick the crosswalk a pedestrian is heading into
///
/// Ways are kept only when aligned with `heading` (strictly within
/// `tolerance_deg`, direction ignored); ways without an orientation are
/// dropped once a heading is known. Free-standing nodes are never
/// heading-filtered. The nearest way wins unless the nearest node is more
/// than `node_factor` times closer. Returns `CrosswalkId::NONE` when
/// nothing qualifies.
pub fn select_endangered(
    set: &CrosswalkSet,
    position: GeoPoint,
    heading: Option<f64>,
    tolerance_deg: f64,
    node_factor: f64,
) -> CrosswalkId {
    let aligned = |angle: Option<f64>| match (heading, angle) {
        (None, _) => true,
        (Some(h), Some(a)) => undirected_difference(a, h) < tolerance_deg,
        (Some(_), None) => false,
    };

    let best_way = set
        .ways
        .iter()
        .filter(|w| aligned(w.angle))
        .filter_map(|w| {
            let d = w.nodes.iter().map(|&n| distance_m(position, n)).fold(f64::INFINITY, f64::min);
            d.is_finite().then_some((w.id, d))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1));

    let best_node = set
        .nodes
        .iter()
        .map(|n| (n.id, distance_m(position, n.position)))
        .min_by(|a, b| a.1.total_cmp(&b.1));

    match (best_way, best_node) {
        (None, None) => CrosswalkId::NONE,
        (Some((id, _)), None) | (None, Some((id, _))) => id,
        (Some((way_id, way_d)), Some((node_id, node_d))) => {
            if way_d / node_factor < node_d {
                way_id
            } else {
                node_id
            }
        }
    }
}

/// Points whose routed duration is within `max_duration_secs`
pub fn reachable(points: &[CrosswalkPoint], durations: &[Option<f64>], max_duration_secs: f64) -> Vec<CrosswalkPoint> {
    points
        .iter()
        .zip(durations)
        .filter(|(_, d)| matches!(d, Some(secs) if *secs <= max_duration_secs))
        .map(|(p, _)| *p)
        .collect()
}

/// One entry per crosswalk id: the closest of its points, if within `radius_m`
pub fn dangered(points: &[CrosswalkPoint], location: &Location, radius_m: f64) -> Vec<DangeredCrosswalk> {
    let here = location.point();
    let mut nearest: BTreeMap<CrosswalkId, f64> = BTreeMap::new();
    for p in points {
        let d = distance_m(here, p.position);
        nearest.entry(p.id).and_modify(|best| *best = best.min(d)).or_insert(d);
    }
    nearest
        .into_iter()
        .filter(|&(_, d)| d <= radius_m)
        .map(|(id, distance)| DangeredCrosswalk { id, distance, speed: location.speed })
        .collect()
}

/// What a lookup resolved to, per role
#[derive(Debug, Clone, PartialEq)]
pub enum Candidates {
    Pedestrian(CrosswalkId),
    Driver(Vec<CrosswalkPoint>),
}

#[derive(Debug, Clone, Copy)]
struct Selection {
    heading: Option<f64>,
    tolerance_deg: f64,
    node_factor: f64,
    max_duration_secs: f64,
}

/// A lookup ready to run off the participant loop
pub struct LookupJob {
    generation: u64,
    role: Role,
    origin: GeoPoint,
    radius_m: f64,
    requested_at: Instant,
    cached: Option<Arc<CrosswalkSet>>,
    selection: Selection,
    geo: Arc<dyn GeoLookup>,
    routing: Arc<dyn RoutingService>,
}

/// Result of a `LookupJob`, delivered back to the loop
#[derive(Debug)]
pub struct LookupOutcome {
    pub generation: u64,
    origin: GeoPoint,
    radius_m: f64,
    requested_at: Instant,
    /// Fresh geo result to cache; `None` when the cache was used or the fetch failed
    fetched: Option<Arc<CrosswalkSet>>,
    result: Result<Candidates, LookupError>,
    elapsed_ms: u64,
}

impl LookupOutcome {
    pub fn result(&self) -> &Result<Candidates, LookupError> {
        &self.result
    }
}

impl LookupJob {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn run(self) -> LookupOutcome {
        let started = Instant::now();
        let mut fetched = None;
        let set = match self.cached.clone() {
            Some(set) => Ok(set),
            None => match self.geo.crosswalks_around(self.origin, self.radius_m).await {
                Ok(set) => {
                    let set = Arc::new(set);
                    fetched = Some(set.clone());
                    Ok(set)
                }
                Err(e) => Err(e),
            },
        };
        let result = match set {
            Ok(set) => self.resolve(&set).await,
            Err(e) => Err(e),
        };
        LookupOutcome {
            generation: self.generation,
            origin: self.origin,
            radius_m: self.radius_m,
            requested_at: self.requested_at,
            fetched,
            result,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn resolve(&self, set: &CrosswalkSet) -> Result<Candidates, LookupError> {
        let s = self.selection;
        match self.role {
            Role::Pedestrian => Ok(Candidates::Pedestrian(select_endangered(
                set,
                self.origin,
                s.heading,
                s.tolerance_deg,
                s.node_factor,
            ))),
            Role::Driver => {
                let points = set.points();
                if points.is_empty() {
                    return Ok(Candidates::Driver(Vec::new()));
                }
                let destinations: Vec<GeoPoint> = points.iter().map(|p| p.position).collect();
                let durations = self.routing.durations(self.origin, &destinations).await?;
                Ok(Candidates::Driver(reachable(&points, &durations, s.max_duration_secs)))
            }
        }
    }
}

struct GeoCache {
    origin: GeoPoint,
    radius_m: f64,
    fetched_at: Instant,
    set: Arc<CrosswalkSet>,
}

pub struct RelevanceEngine {
    role: Role,
    config: RelevanceConfig,
    geo: Arc<dyn GeoLookup>,
    routing: Arc<dyn RoutingService>,
    metrics: Arc<Metrics>,
    cache: Option<GeoCache>,
    active: bool,
    in_flight: bool,
    generation: u64,
    /// Pedestrian: chosen crosswalk, NONE when inactive or nothing found
    active_crosswalk: CrosswalkId,
    /// Driver: reachable points from the last successful lookup
    relevant: Vec<CrosswalkPoint>,
    /// Driver: live per-id distances within the danger radius
    dangered: Vec<DangeredCrosswalk>,
}

impl RelevanceEngine {
    pub fn new(
        role: Role,
        config: RelevanceConfig,
        geo: Arc<dyn GeoLookup>,
        routing: Arc<dyn RoutingService>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            role,
            config,
            geo,
            routing,
            metrics,
            cache: None,
            active: false,
            in_flight: false,
            generation: 0,
            active_crosswalk: CrosswalkId::NONE,
            relevant: Vec::new(),
            dangered: Vec::new(),
        }
    }

    /// Whether lookups should run at `level`
    pub fn wanted_at(&self, level: AlertLevel) -> bool {
        match self.role {
            Role::Pedestrian => level >= AlertLevel::SUSPECTED,
            Role::Driver => level >= AlertLevel::ACTIVE,
        }
    }

    /// Whether the driver distance watch should run at `level`
    pub fn watch_wanted_at(&self, level: AlertLevel) -> bool {
        self.role == Role::Driver && level >= AlertLevel::CROSSWALK
    }

    pub fn refresh_period(&self) -> Duration {
        match self.role {
            Role::Pedestrian => Duration::from_secs(self.config.ped_refresh_secs),
            Role::Driver => Duration::from_secs(self.config.driver_refresh_secs),
        }
    }

    pub fn distance_watch_period(&self) -> Duration {
        Duration::from_millis(self.config.distance_watch_ms)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active_crosswalk(&self) -> CrosswalkId {
        self.active_crosswalk
    }

    pub fn relevant(&self) -> &[CrosswalkPoint] {
        &self.relevant
    }

    pub fn dangered(&self) -> &[DangeredCrosswalk] {
        &self.dangered
    }

    /// Bring the engine's activity in line with `level`
    ///
    /// Returns true if the engine changed state.
    pub fn sync(&mut self, level: AlertLevel) -> bool {
        let wanted = self.wanted_at(level);
        if wanted == self.active {
            return false;
        }
        self.active = wanted;
        self.generation += 1;
        self.in_flight = false;
        if wanted {
            info!(role = %self.role.as_str(), generation = %self.generation, "relevance_activated");
        } else {
            self.active_crosswalk = CrosswalkId::NONE;
            self.relevant.clear();
            self.dangered.clear();
            info!(role = %self.role.as_str(), generation = %self.generation, "relevance_deactivated");
        }
        true
    }

    /// Prepare the next lookup, if one should start now
    pub fn plan(&mut self, location: Option<&Location>, heading: Option<f64>, now: Instant) -> Option<LookupJob> {
        if !self.active {
            return None;
        }
        if self.in_flight {
            debug!(generation = %self.generation, "relevance_lookup_in_flight_skip");
            return None;
        }
        let Some(location) = location else {
            debug!("relevance_lookup_no_location");
            return None;
        };

        let radius_m = match self.role {
            Role::Pedestrian => {
                if location.accuracy > self.config.ped_max_radius_m {
                    warn!(accuracy = %location.accuracy, max = %self.config.ped_max_radius_m, "relevance_lookup_refused_imprecise");
                    return None;
                }
                location.accuracy.max(self.config.ped_min_radius_m)
            }
            Role::Driver => self.config.driver_fetch_radius_m,
        };

        let origin = location.point();
        let cached = self.cached_set(origin, radius_m, now);
        self.in_flight = true;

        Some(LookupJob {
            generation: self.generation,
            role: self.role,
            origin,
            radius_m,
            requested_at: now,
            cached,
            selection: Selection {
                heading,
                tolerance_deg: self.config.heading_tolerance_deg,
                node_factor: self.config.node_preference_factor,
                max_duration_secs: self.config.max_duration_secs,
            },
            geo: self.geo.clone(),
            routing: self.routing.clone(),
        })
    }

    fn cached_set(&self, origin: GeoPoint, radius_m: f64, now: Instant) -> Option<Arc<CrosswalkSet>> {
        let cache = self.cache.as_ref()?;
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if now.saturating_duration_since(cache.fetched_at) > ttl {
            return None;
        }
        if distance_m(cache.origin, origin) > self.config.refetch_distance_m {
            return None;
        }
        if cache.radius_m < radius_m {
            return None;
        }
        Some(cache.set.clone())
    }

    /// Fold a finished lookup into the engine
    ///
    /// Returns `CrosswalkRelevant` when the result should escalate `level`.
    pub fn apply(&mut self, outcome: LookupOutcome, level: AlertLevel) -> Option<Trigger> {
        self.metrics.record_lookup(outcome.result.is_ok(), outcome.elapsed_ms);

        if outcome.generation != self.generation || !self.active {
            debug!(
                generation = %outcome.generation,
                current = %self.generation,
                "relevance_outcome_discarded_stale"
            );
            return None;
        }
        self.in_flight = false;

        if let Some(set) = outcome.fetched {
            self.cache = Some(GeoCache {
                origin: outcome.origin,
                radius_m: outcome.radius_m,
                fetched_at: outcome.requested_at,
                set,
            });
        }

        match outcome.result {
            Ok(Candidates::Pedestrian(id)) => {
                if id != self.active_crosswalk {
                    info!(crosswalk_id = %id, previous = %self.active_crosswalk, "active_crosswalk_changed");
                }
                self.active_crosswalk = id;
                (!id.is_none() && level == AlertLevel::SUSPECTED).then_some(Trigger::CrosswalkRelevant)
            }
            Ok(Candidates::Driver(points)) => {
                debug!(relevant = %points.len(), elapsed_ms = %outcome.elapsed_ms, "relevant_crosswalks_updated");
                self.relevant = points;
                (!self.relevant.is_empty() && level <= AlertLevel::SUSPECTED).then_some(Trigger::CrosswalkRelevant)
            }
            Err(e) => {
                warn!(error = %e, elapsed_ms = %outcome.elapsed_ms, "relevance_lookup_failed");
                None
            }
        }
    }

    /// Recompute the driver's dangered set from the current fix
    pub fn recompute_dangered(&mut self, location: Option<&Location>) -> &[DangeredCrosswalk] {
        if let Some(location) = location {
            self.dangered = dangered(&self.relevant, location, self.config.danger_radius_m);
        }
        &self.dangered
    }

    pub fn clear_dangered(&mut self) {
        self.dangered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CrosswalkNode, CrosswalkWay};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ORIGIN: GeoPoint = GeoPoint { lat: 47.5, lon: 19.04 };

    /// Offset north by `m` meters
    fn north(m: f64) -> GeoPoint {
        GeoPoint::new(ORIGIN.lat + m / 111_195.0, ORIGIN.lon)
    }

    fn way(id: i64, angle: Option<f64>, at: &[GeoPoint]) -> CrosswalkWay {
        CrosswalkWay { id: CrosswalkId(id), nodes: at.to_vec(), angle }
    }

    fn node(id: i64, at: GeoPoint) -> CrosswalkNode {
        CrosswalkNode { id: CrosswalkId(id), position: at }
    }

    fn fix(point: GeoPoint, accuracy: f64) -> Location {
        Location { latitude: point.lat, longitude: point.lon, accuracy, speed: Some(8.0), timestamp: 0 }
    }

    struct FakeGeo {
        set: CrosswalkSet,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl GeoLookup for FakeGeo {
        async fn crosswalks_around(&self, _center: GeoPoint, _radius_m: f64) -> Result<CrosswalkSet, LookupError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(LookupError::Malformed("boom".to_string()));
            }
            Ok(self.set.clone())
        }
    }

    struct FakeRouting {
        secs: f64,
    }

    #[async_trait]
    impl RoutingService for FakeRouting {
        async fn durations(&self, _origin: GeoPoint, destinations: &[GeoPoint]) -> Result<Vec<Option<f64>>, LookupError> {
            Ok(destinations.iter().map(|_| Some(self.secs)).collect())
        }
    }

    fn engine(role: Role, set: CrosswalkSet, fail: bool) -> (RelevanceEngine, Arc<FakeGeo>, Arc<Metrics>) {
        let geo = Arc::new(FakeGeo { set, calls: AtomicUsize::new(0), fail });
        let metrics = Arc::new(Metrics::new());
        let engine = RelevanceEngine::new(
            role,
            RelevanceConfig::default(),
            geo.clone(),
            Arc::new(FakeRouting { secs: 10.0 }),
            metrics.clone(),
        );
        (engine, geo, metrics)
    }

    #[test]
    fn test_way_preferred_unless_node_much_closer() {
        let set = CrosswalkSet {
            ways: vec![way(1, Some(0.0), &[north(30.0), north(40.0)])],
            nodes: vec![node(2, north(12.0))],
        };
        // 30 / 3 = 10 < 12: way wins
        assert_eq!(select_endangered(&set, ORIGIN, Some(0.0), 20.0, 3.0), CrosswalkId(1));

        let set = CrosswalkSet { nodes: vec![node(2, north(9.0))], ..set };
        assert_eq!(select_endangered(&set, ORIGIN, Some(0.0), 20.0, 3.0), CrosswalkId(2));
    }

    #[test]
    fn test_heading_filter_ignores_direction() {
        let set = CrosswalkSet {
            ways: vec![way(1, Some(190.0), &[north(5.0)]), way(3, Some(90.0), &[north(1.0)])],
            nodes: vec![],
        };
        assert_eq!(select_endangered(&set, ORIGIN, Some(10.0), 20.0, 3.0), CrosswalkId(1));
        // exactly at tolerance is excluded
        assert_eq!(select_endangered(&set, ORIGIN, Some(70.0), 20.0, 3.0), CrosswalkId::NONE);
    }

    #[test]
    fn test_nodes_not_heading_filtered_and_empty_is_none() {
        let set = CrosswalkSet { ways: vec![way(1, None, &[north(1.0)])], nodes: vec![node(4, north(50.0))] };
        assert_eq!(select_endangered(&set, ORIGIN, Some(123.0), 20.0, 3.0), CrosswalkId(4));
        assert_eq!(select_endangered(&CrosswalkSet::default(), ORIGIN, None, 20.0, 3.0), CrosswalkId::NONE);
    }

    #[test]
    fn test_reachable_and_dangered() {
        let points = [
            CrosswalkPoint { id: CrosswalkId(1), position: north(100.0) },
            CrosswalkPoint { id: CrosswalkId(1), position: north(60.0) },
            CrosswalkPoint { id: CrosswalkId(2), position: north(400.0) },
            CrosswalkPoint { id: CrosswalkId(3), position: north(20.0) },
        ];
        let relevant = reachable(&points, &[Some(20.0), Some(25.0), Some(12.0), None], 25.0);
        assert_eq!(relevant.len(), 3);

        let d = dangered(&relevant, &fix(ORIGIN, 5.0), 150.0);
        let ids: Vec<i64> = d.iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![1]);
        assert!((d[0].distance - 60.0).abs() < 0.5);
        assert_eq!(d[0].speed, Some(8.0));
    }

    #[tokio::test]
    async fn test_pedestrian_lookup_fires_relevant_at_one() {
        let set = CrosswalkSet { ways: vec![], nodes: vec![node(123, north(8.0))] };
        let (mut engine, _geo, metrics) = engine(Role::Pedestrian, set, false);
        assert!(engine.sync(AlertLevel::SUSPECTED));

        let job = engine.plan(Some(&fix(ORIGIN, 30.0)), Some(0.0), Instant::now()).unwrap();
        assert!(engine.in_flight());
        let outcome = job.run().await;
        assert_eq!(engine.apply(outcome, AlertLevel::SUSPECTED), Some(Trigger::CrosswalkRelevant));
        assert_eq!(engine.active_crosswalk(), CrosswalkId(123));
        assert!(!engine.in_flight());
        assert_eq!(metrics.lookups_ok(), 1);

        engine.sync(AlertLevel::ACTIVE);
        assert_eq!(engine.active_crosswalk(), CrosswalkId::NONE);
    }

    #[tokio::test]
    async fn test_pedestrian_refuses_imprecise_fix() {
        let (mut engine, geo, _) = engine(Role::Pedestrian, CrosswalkSet::default(), false);
        engine.sync(AlertLevel::SUSPECTED);
        assert!(engine.plan(Some(&fix(ORIGIN, 501.0)), None, Instant::now()).is_none());
        assert!(!engine.in_flight());
        assert_eq!(geo.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_one_lookup_in_flight() {
        let (mut engine, _, _) = engine(Role::Driver, CrosswalkSet::default(), false);
        engine.sync(AlertLevel::ACTIVE);
        let now = Instant::now();
        assert!(engine.plan(Some(&fix(ORIGIN, 5.0)), None, now).is_some());
        assert!(engine.plan(Some(&fix(ORIGIN, 5.0)), None, now).is_none());
    }

    #[tokio::test]
    async fn test_cache_reused_until_moved_or_expired() {
        let set = CrosswalkSet { ways: vec![], nodes: vec![node(5, north(50.0))] };
        let (mut engine, geo, _) = engine(Role::Driver, set, false);
        engine.sync(AlertLevel::ACTIVE);
        let t0 = Instant::now();

        let outcome = engine.plan(Some(&fix(ORIGIN, 5.0)), None, t0).unwrap().run().await;
        engine.apply(outcome, AlertLevel::ACTIVE);
        let outcome = engine.plan(Some(&fix(north(20.0), 5.0)), None, t0).unwrap().run().await;
        engine.apply(outcome, AlertLevel::CROSSWALK);
        assert_eq!(geo.calls.load(Ordering::Relaxed), 1);

        let outcome = engine.plan(Some(&fix(north(31.0), 5.0)), None, t0).unwrap().run().await;
        engine.apply(outcome, AlertLevel::CROSSWALK);
        assert_eq!(geo.calls.load(Ordering::Relaxed), 2);

        let later = t0 + Duration::from_secs(31);
        let outcome = engine.plan(Some(&fix(north(31.0), 5.0)), None, later).unwrap().run().await;
        engine.apply(outcome, AlertLevel::CROSSWALK);
        assert_eq!(geo.calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_driver_relevant_only_at_or_below_one() {
        let set = CrosswalkSet { ways: vec![], nodes: vec![node(7, north(50.0))] };
        let (mut engine, _, _) = engine(Role::Driver, set, false);
        engine.sync(AlertLevel::ACTIVE);

        let outcome = engine.plan(Some(&fix(ORIGIN, 5.0)), None, Instant::now()).unwrap().run().await;
        assert_eq!(engine.apply(outcome, AlertLevel::ACTIVE), Some(Trigger::CrosswalkRelevant));
        assert_eq!(engine.relevant().len(), 1);

        let outcome = engine.plan(Some(&fix(ORIGIN, 5.0)), None, Instant::now()).unwrap().run().await;
        assert_eq!(engine.apply(outcome, AlertLevel::CROSSWALK), None);

        let d = engine.recompute_dangered(Some(&fix(ORIGIN, 5.0)));
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].id, CrosswalkId(7));
    }

    #[tokio::test]
    async fn test_failure_keeps_last_known() {
        let (mut engine, _, metrics) = engine(Role::Driver, CrosswalkSet::default(), true);
        engine.sync(AlertLevel::ACTIVE);
        engine.relevant = vec![CrosswalkPoint { id: CrosswalkId(9), position: north(10.0) }];

        let outcome = engine.plan(Some(&fix(ORIGIN, 5.0)), None, Instant::now()).unwrap().run().await;
        assert!(outcome.result().is_err());
        assert_eq!(engine.apply(outcome, AlertLevel::CROSSWALK), None);
        assert_eq!(engine.relevant().len(), 1);
        assert!(!engine.in_flight());
        assert_eq!(metrics.lookups_failed(), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_discarded() {
        let set = CrosswalkSet { ways: vec![], nodes: vec![node(123, north(8.0))] };
        let (mut engine, _, _) = engine(Role::Pedestrian, set, false);
        engine.sync(AlertLevel::SUSPECTED);
        let job = engine.plan(Some(&fix(ORIGIN, 20.0)), None, Instant::now()).unwrap();

        engine.sync(AlertLevel::ACTIVE);
        engine.sync(AlertLevel::SUSPECTED);
        let outcome = job.run().await;
        assert_eq!(engine.apply(outcome, AlertLevel::SUSPECTED), None);
        assert_eq!(engine.active_crosswalk(), CrosswalkId::NONE);
    }
}
