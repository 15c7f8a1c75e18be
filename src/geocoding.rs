//! Address-to-coordinate resolution via Nominatim.
//!
//! The geocoder is a black box to the pipeline: one attempt, and a miss is
//! a normal outcome (`Ok(None)`), not an error. Only genuine transport or
//! protocol failures surface as errors. Resolved addresses are memoized
//! in-process so repeated runs over the same address do not re-query the
//! service.

use anyhow::{Context, Result};
use moka::future::Cache;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const CACHE_TTL: Duration = Duration::from_secs(3600);
const CACHE_CAPACITY: u64 = 1000;

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    lat: String,
    lon: String,
    display_name: String,
}

/// A resolved address.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodedPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
}

pub struct Geocoder {
    client: reqwest::Client,
    base_url: String,
    cache: Cache<String, Option<GeocodedPoint>>,
}

impl Default for Geocoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Geocoder {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("derelict/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    /// Resolve a free-form address. Returns `Ok(None)` when the service has
    /// no match; the caller decides whether that is fatal.
    pub async fn geocode_address(&self, address: &str) -> Result<Option<GeocodedPoint>> {
        let address = address.trim();
        if address.is_empty() {
            anyhow::bail!("address must not be empty");
        }

        if let Some(cached) = self.cache.get(address).await {
            metrics::counter!("geocoding.cache.hit").increment(1);
            return Ok(cached);
        }

        let resolved = self.lookup(address).await?;
        self.cache
            .insert(address.to_string(), resolved.clone())
            .await;
        Ok(resolved)
    }

    async fn lookup(&self, address: &str) -> Result<Option<GeocodedPoint>> {
        debug!("geocoding address: {address}");

        let url = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .context("geocoding request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("geocoding service returned {}", response.status());
        }

        let results: Vec<NominatimResponse> = response
            .json()
            .await
            .context("failed to parse geocoding response")?;

        let Some(first) = results.into_iter().next() else {
            info!("no geocoding result for address: {address}");
            return Ok(None);
        };

        let latitude: f64 = first.lat.parse().context("unparseable latitude")?;
        let longitude: f64 = first.lon.parse().context("unparseable longitude")?;
        info!(
            latitude,
            longitude,
            "geocoded '{address}' to '{}'",
            first.display_name
        );
        Ok(Some(GeocodedPoint {
            latitude,
            longitude,
            display_name: first.display_name,
        }))
    }
}
