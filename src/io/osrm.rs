//! OSRM table API client
//!
//! `GET {base}{lon},{lat};{lon},{lat};...?sources=0` returns a duration
//! matrix whose first row holds origin -> destination seconds.

use crate::domain::types::GeoPoint;
use crate::io::lookup::{LookupError, RoutingService};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct TableResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    durations: Vec<Vec<Option<f64>>>,
}

pub struct OsrmClient {
    http: reqwest::Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self { http, base_url })
    }
}

fn build_url(base: &str, origin: GeoPoint, destinations: &[GeoPoint]) -> String {
    let mut url = format!("{}{:.6},{:.6}", base, origin.lon, origin.lat);
    for d in destinations {
        url.push_str(&format!(";{:.6},{:.6}", d.lon, d.lat));
    }
    url.push_str("?sources=0");
    url
}

/// Drop the origin column and check the row covers every destination
fn parse_table(resp: TableResponse, expected: usize) -> Result<Vec<Option<f64>>, LookupError> {
    if let Some(code) = resp.code.as_deref() {
        if code != "Ok" {
            return Err(LookupError::Malformed(format!("osrm code {code}")));
        }
    }
    let row = resp
        .durations
        .into_iter()
        .next()
        .ok_or_else(|| LookupError::Malformed("empty duration matrix".to_string()))?;
    if row.len() != expected + 1 {
        return Err(LookupError::Malformed(format!(
            "expected {} durations, got {}",
            expected + 1,
            row.len()
        )));
    }
    Ok(row.into_iter().skip(1).collect())
}

#[async_trait]
impl RoutingService for OsrmClient {
    async fn durations(
        &self,
        origin: GeoPoint,
        destinations: &[GeoPoint],
    ) -> Result<Vec<Option<f64>>, LookupError> {
        if destinations.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self.http.get(build_url(&self.base_url, origin, destinations)).send().await?;
        if !resp.status().is_success() {
            return Err(LookupError::ServerError(resp.status()));
        }
        let body = resp.bytes().await?;
        let table: TableResponse =
            serde_json::from_slice(&body).map_err(|e| LookupError::Malformed(e.to_string()))?;
        parse_table(table, destinations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_lon_first() {
        let url = build_url(
            "https://router.example/table/v1/driving/",
            GeoPoint::new(47.5, 19.04),
            &[GeoPoint::new(47.501, 19.041)],
        );
        assert_eq!(
            url,
            "https://router.example/table/v1/driving/19.040000,47.500000;19.041000,47.501000?sources=0"
        );
    }

    #[test]
    fn test_parse_table_skips_origin() {
        let resp: TableResponse =
            serde_json::from_str(r#"{"code":"Ok","durations":[[0.0, 12.5, null, 40.1]]}"#).unwrap();
        assert_eq!(parse_table(resp, 3).unwrap(), vec![Some(12.5), None, Some(40.1)]);
    }

    #[test]
    fn test_parse_table_rejects_mismatch() {
        let resp: TableResponse = serde_json::from_str(r#"{"code":"Ok","durations":[[0.0, 1.0]]}"#).unwrap();
        assert!(parse_table(resp, 3).is_err());

        let resp: TableResponse = serde_json::from_str(r#"{"code":"NoRoute"}"#).unwrap();
        assert!(parse_table(resp, 1).is_err());
    }
}
