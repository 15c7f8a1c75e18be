//! HTTP client for XYZ tile providers.
//!
//! The provider serves JPEG/PNG tiles at a templated URL; authentication is
//! a pre-shared API key sent either as a query parameter or a header.
//! Transient failures (timeouts, 5xx) are retried with exponential backoff
//! and jitter; permanent failures (404, auth) are surfaced immediately so
//! the caller can substitute a placeholder tile.

use image::RgbImage;
use rand::Rng;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ApiKeyPlacement;
use crate::tiles::TileCoord;

const PER_TILE_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_FACTOR: u32 = 2;
const RETRY_JITTER: f64 = 0.20;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum TileError {
    /// Retries exhausted on timeouts / 5xx responses.
    #[error("transient tile failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },
    /// 4xx and similar; never retried.
    #[error("permanent tile failure ({status}): {url}")]
    Permanent { status: StatusCode, url: String },
    /// Body received but not decodable as an image.
    #[error("tile decode failure: {0}")]
    Decode(String),
}

/// One imagery source: a URL template with `{z}`/`{x}`/`{y}` placeholders
/// plus optional API-key auth.
#[derive(Debug, Clone)]
pub struct TileSource {
    /// Identifier folded into cache keys so two sources never collide.
    pub id: String,
    pub url_template: String,
    pub api_key: Option<String>,
    pub api_key_placement: ApiKeyPlacement,
}

impl TileSource {
    pub fn new(id: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url_template: url_template.into(),
            api_key: None,
            api_key_placement: ApiKeyPlacement::Query,
        }
    }

    pub fn with_api_key(mut self, key: Option<String>, placement: ApiKeyPlacement) -> Self {
        self.api_key = key;
        self.api_key_placement = placement;
        self
    }

    fn tile_url(&self, tile: TileCoord) -> String {
        self.url_template
            .replace("{z}", &tile.zoom.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
    }
}

/// Shared HTTP client for tile downloads.
#[derive(Clone)]
pub struct TileClient {
    client: Client,
}

impl TileClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(PER_TILE_TIMEOUT)
            .user_agent(concat!("derelict/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Download and decode one tile, retrying transient failures.
    pub async fn fetch_tile(&self, source: &TileSource, tile: TileCoord) -> Result<RgbImage, TileError> {
        let url = source.tile_url(tile);
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.fetch_once(source, &url).await {
                Ok(bytes) => {
                    metrics::counter!("tiles.fetch.ok").increment(1);
                    return decode_tile(&bytes);
                }
                Err(FetchAttemptError::Permanent { status }) => {
                    metrics::counter!("tiles.fetch.permanent_error").increment(1);
                    return Err(TileError::Permanent { status, url });
                }
                Err(FetchAttemptError::Transient { message }) => {
                    metrics::counter!("tiles.fetch.transient_error").increment(1);
                    debug!(%url, attempt, "transient tile fetch failure: {message}");
                    last_error = message;
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        warn!(%url, "tile fetch failed after {MAX_ATTEMPTS} attempts");
        Err(TileError::Transient {
            attempts: MAX_ATTEMPTS,
            message: last_error,
        })
    }

    async fn fetch_once(&self, source: &TileSource, url: &str) -> Result<Vec<u8>, FetchAttemptError> {
        let mut request = self.client.get(url);
        if let Some(key) = &source.api_key {
            request = match source.api_key_placement {
                ApiKeyPlacement::Query => request.query(&[("key", key.as_str())]),
                ApiKeyPlacement::Header => request.header("x-api-key", key.as_str()),
            };
        }

        let response = request.send().await.map_err(|e| FetchAttemptError::Transient {
            message: e.to_string(),
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchAttemptError::Transient {
                message: format!("server error {status}"),
            });
        }
        if !status.is_success() {
            return Err(FetchAttemptError::Permanent { status });
        }

        let bytes = response.bytes().await.map_err(|e| FetchAttemptError::Transient {
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

enum FetchAttemptError {
    Transient { message: String },
    Permanent { status: StatusCode },
}

fn decode_tile(bytes: &[u8]) -> Result<RgbImage, TileError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| TileError::Decode(e.to_string()))?;
    Ok(decoded.to_rgb8())
}

/// Exponential backoff with +/-20% jitter: 250ms, 500ms, ...
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE.as_millis() as f64 * f64::from(RETRY_FACTOR.pow(attempt - 1));
    let jitter = rand::thread_rng().gen_range(-RETRY_JITTER..=RETRY_JITTER);
    Duration::from_millis((base * (1.0 + jitter)).max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_substitution() {
        let source = TileSource::new("y2020", "https://tiles.example/{z}/{y}/{x}.jpeg");
        let url = source.tile_url(TileCoord {
            zoom: 17,
            x: 70400,
            y: 42980,
        });
        assert_eq!(url, "https://tiles.example/17/42980/70400.jpeg");
    }

    #[test]
    fn backoff_grows_with_attempts() {
        for _ in 0..20 {
            let first = backoff_delay(1);
            let third = backoff_delay(3);
            assert!(first >= Duration::from_millis(200));
            assert!(first <= Duration::from_millis(300));
            assert!(third >= Duration::from_millis(800));
            assert!(third <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_tile(&[0u8; 16]),
            Err(TileError::Decode(_))
        ));
    }
}
