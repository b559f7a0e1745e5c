use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::GatewayError;
use crate::models::Coordinates;

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub place_id: String,
    pub display_name: String,
    pub centroid: Coordinates,
}

/// Forward geocoding of a free-text place name.
///
/// `Ok(None)` means the service answered but knows no such place.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, token: &str, query: &str) -> Result<Option<GeocodeHit>, GatewayError>;
}

/// Client for Nominatim-compatible search endpoints. A non-empty token is
/// sent as the `key` parameter for hosted variants that require one.
pub struct NominatimGeocoder {
    http: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("disaster-incident-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build geocoder HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Deserialize)]
struct SearchResult {
    place_id: serde_json::Value,
    lat: String,
    lon: String,
    display_name: String,
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, token: &str, query: &str) -> Result<Option<GeocodeHit>, GatewayError> {
        let mut request = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("format", "json"), ("limit", "1")]);
        if !token.is_empty() {
            request = request.query(&[("key", token)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, &body));
        }

        let results: Vec<SearchResult> = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let Some(first) = results.into_iter().next() else {
            debug!(query, "Geocoder returned no results");
            return Ok(None);
        };

        parse_hit(first).map(Some)
    }
}

fn parse_hit(result: SearchResult) -> Result<GeocodeHit, GatewayError> {
    let lat: f64 = result
        .lat
        .parse()
        .map_err(|_| GatewayError::Malformed(format!("bad latitude '{}'", result.lat)))?;
    let lng: f64 = result
        .lon
        .parse()
        .map_err(|_| GatewayError::Malformed(format!("bad longitude '{}'", result.lon)))?;
    let centroid = Coordinates::new(lat, lng);
    if !centroid.is_valid() {
        return Err(GatewayError::Malformed(format!(
            "coordinates out of range: {lat}, {lng}"
        )));
    }

    let place_id = match result.place_id {
        serde_json::Value::String(id) => id,
        other => other.to_string(),
    };

    Ok(GeocodeHit {
        place_id: format!("nominatim:{place_id}"),
        display_name: result.display_name,
        centroid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nominatim_payload() {
        let payload = r#"[{"place_id": 282301239, "lat": "35.6768601", "lon": "139.7638947",
            "display_name": "Tokyo, Japan", "class": "boundary"}]"#;
        let results: Vec<SearchResult> = serde_json::from_str(payload).unwrap();
        let hit = parse_hit(results.into_iter().next().unwrap()).unwrap();

        assert_eq!(hit.place_id, "nominatim:282301239");
        assert_eq!(hit.display_name, "Tokyo, Japan");
        assert_eq!(hit.centroid, Coordinates::new(35.6768601, 139.7638947));
    }

    #[test]
    fn rejects_unparseable_coordinates() {
        let result = SearchResult {
            place_id: serde_json::json!("x"),
            lat: "north".into(),
            lon: "0".into(),
            display_name: "Nowhere".into(),
        };
        assert!(matches!(
            parse_hit(result),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let geocoder =
            NominatimGeocoder::new("https://nominatim.openstreetmap.org/", Duration::from_secs(5))
                .unwrap();
        assert_eq!(geocoder.base_url, "https://nominatim.openstreetmap.org");
    }
}
