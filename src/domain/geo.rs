//! Great-circle helpers

use crate::domain::types::GeoPoint;

/// Mean Earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two points in meters
pub fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial bearing from `a` to `b` in degrees [0, 360)
pub fn bearing_deg(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let y = d_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lon.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Orientation of a polyline from its first to last point
pub fn polyline_angle(points: &[GeoPoint]) -> Option<f64> {
    match points {
        [first, .., last] => Some(bearing_deg(*first, *last)),
        _ => None,
    }
}

/// Angular difference ignoring direction of travel
///
/// A crossing is the same line whichever end you walk from, so 10° and 190° count as aligned.
pub fn undirected_difference(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() % 180.0;
    diff.min(180.0 - diff)
}
