//! Shared types for crosswalk guard

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Get current epoch seconds (relay timestamps)
#[inline]
pub fn epoch_secs() -> u64 {
    epoch_ms() / 1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("alert level {0} outside -1..=4")]
pub struct LevelOutOfRange(pub i8);

/// Per-participant danger level
///
/// -1 off, 0 active, 1 distraction suspected, 2 crosswalk confirmed,
/// 3 counterpart present, 4 critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub struct AlertLevel(i8);

impl AlertLevel {
    pub const OFF: AlertLevel = AlertLevel(-1);
    pub const ACTIVE: AlertLevel = AlertLevel(0);
    pub const SUSPECTED: AlertLevel = AlertLevel(1);
    pub const CROSSWALK: AlertLevel = AlertLevel(2);
    pub const PRESENCE: AlertLevel = AlertLevel(3);
    pub const CRITICAL: AlertLevel = AlertLevel(4);

    #[inline]
    pub fn value(self) -> i8 {
        self.0
    }

    #[inline]
    pub fn is_active(self) -> bool {
        self >= AlertLevel::ACTIVE
    }
}

impl TryFrom<i8> for AlertLevel {
    type Error = LevelOutOfRange;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        if (-1..=4).contains(&value) {
            Ok(AlertLevel(value))
        } else {
            Err(LevelOutOfRange(value))
        }
    }
}

impl From<AlertLevel> for i8 {
    fn from(level: AlertLevel) -> Self {
        level.0
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the crosswalk a participant is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "ped")]
    Pedestrian,
    Driver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pedestrian => "pedestrian",
            Role::Driver => "driver",
        }
    }
}

/// Newtype wrapper for crosswalk IDs (OSM way or node id). 0 means none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CrosswalkId(pub i64);

impl CrosswalkId {
    pub const NONE: CrosswalkId = CrosswalkId(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for CrosswalkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// GPS fix as delivered by the sensor layer
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters (lower is better)
    pub accuracy: f64,
    /// Ground speed in m/s
    #[serde(default)]
    pub speed: Option<f64>,
    /// Fix time (epoch ms)
    #[serde(default)]
    pub timestamp: u64,
}

impl Location {
    #[inline]
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Multi-point crossing (OSM footway=crossing way)
#[derive(Debug, Clone, PartialEq)]
pub struct CrosswalkWay {
    pub id: CrosswalkId,
    pub nodes: Vec<GeoPoint>,
    /// Orientation in degrees [0, 360), absent for ways with fewer than 2 nodes
    pub angle: Option<f64>,
}

/// Free-standing crossing node (not part of any way)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrosswalkNode {
    pub id: CrosswalkId,
    pub position: GeoPoint,
}

/// Result of one geo lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrosswalkSet {
    pub ways: Vec<CrosswalkWay>,
    pub nodes: Vec<CrosswalkNode>,
}

impl CrosswalkSet {
    pub fn is_empty(&self) -> bool {
        self.ways.is_empty() && self.nodes.is_empty()
    }

    /// Flatten to one point per way node and per free-standing node
    pub fn points(&self) -> Vec<CrosswalkPoint> {
        let mut points = Vec::with_capacity(self.nodes.len() + self.ways.len() * 2);
        for way in &self.ways {
            points.extend(way.nodes.iter().map(|&position| CrosswalkPoint { id: way.id, position }));
        }
        points.extend(self.nodes.iter().map(|n| CrosswalkPoint { id: n.id, position: n.position }));
        points
    }
}

/// A single routable point belonging to a crosswalk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrosswalkPoint {
    pub id: CrosswalkId,
    pub position: GeoPoint,
}

/// Crosswalk near enough to the participant to be announced to its room
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DangeredCrosswalk {
    pub id: CrosswalkId,
    /// Distance to the participant in meters
    pub distance: f64,
    /// Participant speed in m/s
    pub speed: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_level_range() {
        assert_eq!(AlertLevel::try_from(-1), Ok(AlertLevel::OFF));
        assert_eq!(AlertLevel::try_from(4), Ok(AlertLevel::CRITICAL));
        assert_eq!(AlertLevel::try_from(5), Err(LevelOutOfRange(5)));
        assert_eq!(AlertLevel::try_from(-2), Err(LevelOutOfRange(-2)));
    }

    #[test]
    fn test_alert_level_serde() {
        let level: AlertLevel = serde_json::from_str("3").unwrap();
        assert_eq!(level, AlertLevel::PRESENCE);
        assert!(serde_json::from_str::<AlertLevel>("7").is_err());
        assert_eq!(serde_json::to_string(&AlertLevel::OFF).unwrap(), "-1");
    }

    #[test]
    fn test_role_alias() {
        let role: Role = serde_json::from_str("\"ped\"").unwrap();
        assert_eq!(role, Role::Pedestrian);
        let role: Role = serde_json::from_str("\"driver\"").unwrap();
        assert_eq!(role, Role::Driver);
    }

    #[test]
    fn test_points_flatten() {
        let set = CrosswalkSet {
            ways: vec![CrosswalkWay {
                id: CrosswalkId(10),
                nodes: vec![GeoPoint::new(47.0, 19.0), GeoPoint::new(47.0001, 19.0)],
                angle: Some(0.0),
            }],
            nodes: vec![CrosswalkNode { id: CrosswalkId(20), position: GeoPoint::new(47.1, 19.1) }],
        };
        let points = set.points();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].id, CrosswalkId(10));
        assert_eq!(points[2].id, CrosswalkId(20));
    }
}
