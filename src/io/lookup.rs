//! Geo lookup and routing collaborators
//!
//! The relevance engine only sees these traits; `overpass` and `osrm`
//! provide the HTTP implementations.

use crate::domain::types::{CrosswalkSet, GeoPoint};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned status {0}")]
    ServerError(reqwest::StatusCode),
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Crosswalk geodata around a point
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn crosswalks_around(&self, center: GeoPoint, radius_m: f64) -> Result<CrosswalkSet, LookupError>;
}

/// Travel durations from an origin to each destination
#[async_trait]
pub trait RoutingService: Send + Sync {
    /// One entry per destination, in order; `None` where no route exists
    async fn durations(
        &self,
        origin: GeoPoint,
        destinations: &[GeoPoint],
    ) -> Result<Vec<Option<f64>>, LookupError>;
}
