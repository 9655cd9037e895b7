//! Overpass API client for crosswalk geodata
//!
//! Queries `footway=crossing` ways and zebra crossing nodes around a point.
//! Nodes referenced by a returned way belong to that way; the rest are
//! free-standing crossings.

use crate::domain::geo::polyline_angle;
use crate::domain::types::{CrosswalkId, CrosswalkNode, CrosswalkSet, CrosswalkWay, GeoPoint};
use crate::io::lookup::{GeoLookup, LookupError};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Element {
    Node {
        id: i64,
        lat: f64,
        lon: f64,
    },
    Way {
        id: i64,
        #[serde(default)]
        nodes: Vec<i64>,
    },
    #[serde(other)]
    Other,
}

pub struct OverpassClient {
    http: reqwest::Client,
    url: String,
}

impl OverpassClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url: url.to_string() })
    }
}

fn build_query(center: GeoPoint, radius_m: f64) -> String {
    let around = format!("(around:{:.1},{:.7},{:.7})", radius_m, center.lat, center.lon);
    format!(
        "[out:json];(way[\"highway\"=\"footway\"][\"footway\"=\"crossing\"]{around};\
         node[\"highway\"=\"crossing\"][\"crossing:markings\"=\"zebra\"]{around};);\
         out body;>;out skel qt;"
    )
}

/// Assemble ways and free-standing nodes from raw Overpass elements
fn build_crosswalk_set(elements: Vec<Element>) -> CrosswalkSet {
    let mut positions: FxHashMap<i64, GeoPoint> = FxHashMap::default();
    let mut node_order = Vec::new();
    let mut raw_ways = Vec::new();

    for element in elements {
        match element {
            Element::Node { id, lat, lon } => {
                if positions.insert(id, GeoPoint::new(lat, lon)).is_none() {
                    node_order.push(id);
                }
            }
            Element::Way { id, nodes } => raw_ways.push((id, nodes)),
            Element::Other => {}
        }
    }

    let mut in_way: FxHashSet<i64> = FxHashSet::default();
    let mut ways = Vec::with_capacity(raw_ways.len());
    for (id, node_ids) in raw_ways {
        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            in_way.insert(node_id);
            match positions.get(&node_id) {
                Some(p) => nodes.push(*p),
                None => debug!(way_id = %id, node_id = %node_id, "overpass_way_node_missing"),
            }
        }
        let angle = polyline_angle(&nodes);
        ways.push(CrosswalkWay { id: CrosswalkId(id), nodes, angle });
    }

    let nodes = node_order
        .into_iter()
        .filter(|id| !in_way.contains(id))
        .filter_map(|id| positions.get(&id).map(|p| CrosswalkNode { id: CrosswalkId(id), position: *p }))
        .collect();

    CrosswalkSet { ways, nodes }
}

#[async_trait]
impl GeoLookup for OverpassClient {
    async fn crosswalks_around(&self, center: GeoPoint, radius_m: f64) -> Result<CrosswalkSet, LookupError> {
        let resp = self
            .http
            .post(&self.url)
            .form(&[("data", build_query(center, radius_m))])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(LookupError::ServerError(resp.status()));
        }

        let body = resp.bytes().await?;
        let parsed: OverpassResponse =
            serde_json::from_slice(&body).map_err(|e| LookupError::Malformed(e.to_string()))?;
        Ok(build_crosswalk_set(parsed.elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> CrosswalkSet {
        let resp: OverpassResponse = serde_json::from_str(json).unwrap();
        build_crosswalk_set(resp.elements)
    }

    #[test]
    fn test_way_nodes_are_not_free_standing() {
        let set = parse(
            r#"{"elements": [
                {"type": "way", "id": 100, "nodes": [1, 2]},
                {"type": "node", "id": 3, "lat": 47.001, "lon": 19.001},
                {"type": "node", "id": 1, "lat": 47.0, "lon": 19.0},
                {"type": "node", "id": 2, "lat": 47.0, "lon": 19.0001}
            ]}"#,
        );
        assert_eq!(set.ways.len(), 1);
        assert_eq!(set.ways[0].id, CrosswalkId(100));
        assert_eq!(set.ways[0].nodes.len(), 2);
        assert!((set.ways[0].angle.unwrap() - 90.0).abs() < 0.01);
        assert_eq!(set.nodes.len(), 1);
        assert_eq!(set.nodes[0].id, CrosswalkId(3));
    }

    #[test]
    fn test_single_node_way_has_no_angle() {
        let set = parse(
            r#"{"elements": [
                {"type": "way", "id": 5, "nodes": [1, 9]},
                {"type": "node", "id": 1, "lat": 47.0, "lon": 19.0}
            ]}"#,
        );
        assert_eq!(set.ways[0].nodes.len(), 1);
        assert_eq!(set.ways[0].angle, None);
        assert!(set.nodes.is_empty());
    }

    #[test]
    fn test_ignores_other_elements() {
        let set = parse(r#"{"elements": [{"type": "relation", "id": 1}]}"#);
        assert!(set.is_empty());
        let set = parse(r#"{"version": 0.6}"#);
        assert!(set.is_empty());
    }

    #[test]
    fn test_query_contains_radius_and_filters() {
        let q = build_query(GeoPoint::new(47.5, 19.04), 200.0);
        assert!(q.contains("around:200.0,47.5000000,19.0400000"));
        assert!(q.contains("\"footway\"=\"crossing\""));
        assert!(q.contains("\"crossing:markings\"=\"zebra\""));
    }
}
