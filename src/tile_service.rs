//! Stitched-imagery service: cache-through fetch of a tile block.
//!
//! For a geographic window the service checks the disk cache, and on a miss
//! downloads the `(2r+1)^2` tile block with a bounded worker pool, stitches
//! it, and persists the result. Requests for the same cache key serialize on
//! a per-key lock, so concurrent callers trigger at most one network fetch;
//! the later caller is served from the cache the first one populated.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::tile_cache::TileCache;
use crate::tile_client::{TileClient, TileError, TileSource};
use crate::tiles::{StitchedImage, TileCoord, placeholder_tile, stitch};

/// Whole-block fetch budget; individual tiles time out much earlier.
const STITCHED_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Fraction of the tile block that may fail before the result is unusable.
const MAX_FAILED_TILE_RATIO: f64 = 0.25;

/// Normal outcomes of a stitched fetch. Unexpected failures (disk I/O)
/// surface as errors instead.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(Arc<StitchedImage>),
    /// Too many tiles failed; reported, not thrown.
    NotAvailable { failed_tiles: usize, total_tiles: usize },
}

/// Seam for tile downloads so the service is testable without a provider.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    async fn fetch_tile(&self, source: &TileSource, tile: TileCoord) -> Result<RgbImage, TileError>;
}

#[async_trait]
impl TileFetcher for TileClient {
    async fn fetch_tile(&self, source: &TileSource, tile: TileCoord) -> Result<RgbImage, TileError> {
        TileClient::fetch_tile(self, source, tile).await
    }
}

/// Seam the abandonment engine fetches imagery through.
#[async_trait]
pub trait ImageryProvider: Send + Sync {
    async fn fetch_stitched(
        &self,
        source: &TileSource,
        latitude: f64,
        longitude: f64,
        zoom: u8,
        radius: u32,
    ) -> Result<FetchOutcome>;
}

#[async_trait]
impl<F: TileFetcher> ImageryProvider for TileService<F> {
    async fn fetch_stitched(
        &self,
        source: &TileSource,
        latitude: f64,
        longitude: f64,
        zoom: u8,
        radius: u32,
    ) -> Result<FetchOutcome> {
        self.fetch(source, latitude, longitude, zoom, radius).await
    }
}

pub struct TileService<F: TileFetcher = TileClient> {
    fetcher: F,
    cache: Arc<TileCache>,
    fetch_concurrency: usize,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl<F: TileFetcher> TileService<F> {
    pub fn new(fetcher: F, cache: Arc<TileCache>, fetch_concurrency: usize) -> Self {
        Self {
            fetcher,
            cache,
            fetch_concurrency: fetch_concurrency.max(1),
            inflight: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    /// Fetch the stitched block covering `(2*radius+1)^2` tiles around the
    /// center point, through the cache.
    pub async fn fetch(
        &self,
        source: &TileSource,
        latitude: f64,
        longitude: f64,
        zoom: u8,
        radius: u32,
    ) -> Result<FetchOutcome> {
        let center = TileCoord::from_lat_lon(latitude, longitude, zoom);
        let key = TileCache::entry_key(&source.id, center, radius);

        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let outcome = {
            // Per-key serialization: the second caller blocks here, then
            // finds the entry the first caller just wrote.
            let _guard = lock.lock().await;
            self.fetch_through_cache(source, &key, center, radius, latitude, longitude)
                .await
        };

        // The map holds one strong reference and we hold another; anything
        // beyond that is a waiting caller. Dropping idle entries keeps the
        // map bounded by in-flight keys rather than all keys ever seen.
        self.inflight
            .remove_if(&key, |_, holder| Arc::strong_count(holder) <= 2);

        outcome
    }

    async fn fetch_through_cache(
        &self,
        source: &TileSource,
        key: &str,
        center: TileCoord,
        radius: u32,
        latitude: f64,
        longitude: f64,
    ) -> Result<FetchOutcome> {
        if let Some(cached) = self.cache.lookup(key) {
            debug!(%key, "stitched fetch served from cache");
            return Ok(FetchOutcome::Fetched(Arc::new(cached)));
        }

        let outcome = tokio::time::timeout(
            STITCHED_FETCH_TIMEOUT,
            self.fetch_block(source, center, radius, latitude, longitude),
        )
        .await
        .map_err(|_| anyhow::anyhow!("stitched fetch timed out after {STITCHED_FETCH_TIMEOUT:?}"))??;

        if let FetchOutcome::Fetched(stitched) = &outcome {
            self.cache
                .store(key, stitched)
                .context("failed to persist stitched image to cache")?;
        }
        Ok(outcome)
    }

    async fn fetch_block(
        &self,
        source: &TileSource,
        center: TileCoord,
        radius: u32,
        latitude: f64,
        longitude: f64,
    ) -> Result<FetchOutcome> {
        let side = 2 * radius + 1;
        let r = radius as i64;
        let max_index = (1i64 << center.zoom) - 1;

        let mut coords = Vec::with_capacity((side * side) as usize);
        for dy in -r..=r {
            for dx in -r..=r {
                coords.push(TileCoord {
                    zoom: center.zoom,
                    x: (i64::from(center.x) + dx).clamp(0, max_index) as u32,
                    y: (i64::from(center.y) + dy).clamp(0, max_index) as u32,
                });
            }
        }
        let total_tiles = coords.len();

        // `buffered` keeps row-major order for stitching while running up to
        // `fetch_concurrency` downloads at once.
        let results: Vec<Result<RgbImage, TileError>> = stream::iter(coords)
            .map(|tile| self.fetcher.fetch_tile(source, tile))
            .buffered(self.fetch_concurrency)
            .collect()
            .await;

        let mut failed_tiles = 0usize;
        let tiles: Vec<RgbImage> = results
            .into_iter()
            .map(|result| match result {
                Ok(tile) => tile,
                Err(e) => {
                    warn!("tile failed permanently, substituting gray: {e}");
                    failed_tiles += 1;
                    placeholder_tile()
                }
            })
            .collect();

        if (failed_tiles as f64) > (total_tiles as f64) * MAX_FAILED_TILE_RATIO {
            info!(
                failed_tiles,
                total_tiles, "too many tile failures, imagery not available"
            );
            metrics::counter!("tile_service.not_available").increment(1);
            return Ok(FetchOutcome::NotAvailable {
                failed_tiles,
                total_tiles,
            });
        }

        let stitched = stitch(center, radius, &tiles, latitude, longitude);
        metrics::counter!("tile_service.stitched").increment(1);
        Ok(FetchOutcome::Fetched(Arc::new(stitched)))
    }
}
