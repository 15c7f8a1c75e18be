//! Shared helpers for integration tests.
//!
//! `TestDatabase` creates an isolated PostgreSQL database per test (dropped
//! on `Drop`) and is skipped gracefully when `TEST_DATABASE_URL` is unset,
//! so the logic-level tests still run without a database server. The
//! in-memory store implementations mirror the aggregate semantics of the
//! real repositories for pipeline tests that should not need Postgres.

#![allow(dead_code)]

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use image::RgbImage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use derelict::analysis_logs_repo::{AnalysisLog, AnalysisLogStore};
use derelict::embedder::Embedder;
use derelict::tile_client::TileSource;
use derelict::tile_service::{FetchOutcome, ImageryProvider};
use derelict::tiles::{GeoTransform, StitchedImage};
use derelict::vehicles::{
    StatusUpdate, UpsertOutcome, VehicleObservation, VehicleStatus, VehicleStore,
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/");

type PgPool = Pool<ConnectionManager<PgConnection>>;

/// An isolated database, created from the server at `TEST_DATABASE_URL`
/// and dropped when the handle goes out of scope.
pub struct TestDatabase {
    admin_url: String,
    name: String,
    pool: PgPool,
}

impl TestDatabase {
    /// Returns `None` (and the caller should skip) when no test server is
    /// configured.
    pub async fn try_new() -> Option<Result<Self>> {
        let admin_url = std::env::var("TEST_DATABASE_URL").ok()?;
        Some(Self::create(admin_url).await)
    }

    async fn create(admin_url: String) -> Result<Self> {
        let name = format!("derelict_test_{}", uuid::Uuid::new_v4().simple());
        {
            let mut conn = PgConnection::establish(&admin_url)
                .context("failed to connect to TEST_DATABASE_URL")?;
            diesel::sql_query(format!("CREATE DATABASE {name}"))
                .execute(&mut conn)
                .context("failed to create test database")?;
        }

        let db_url = replace_database(&admin_url, &name);
        let manager = ConnectionManager::<PgConnection>::new(db_url);
        let pool = Pool::builder().max_size(5).build(manager)?;

        let mut conn = pool.get()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow!("failed to run migrations: {e}"))?;

        Ok(Self {
            admin_url,
            name,
            pool,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        if let Ok(mut conn) = PgConnection::establish(&self.admin_url) {
            let _ = diesel::sql_query(format!(
                "DROP DATABASE IF EXISTS {} WITH (FORCE)",
                self.name
            ))
            .execute(&mut conn);
        }
    }
}

/// Swap the database segment of a postgres URL.
fn replace_database(url: &str, database: &str) -> String {
    match url.rfind('/') {
        Some(idx) => format!("{}/{}", &url[..idx], database),
        None => format!("{url}/{database}"),
    }
}

/// In-memory `VehicleStore` with the same aggregate semantics as the
/// Postgres upsert.
#[derive(Default)]
pub struct MemoryVehicleStore {
    pub rows: Mutex<HashMap<String, MemoryVehicle>>,
}

#[derive(Debug, Clone)]
pub struct MemoryVehicle {
    pub observation: VehicleObservation,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
    pub detection_count: i32,
    pub avg_similarity: f64,
    pub max_similarity: f64,
    pub status: VehicleStatus,
    pub verification_notes: Option<String>,
}

#[async_trait]
impl VehicleStore for MemoryVehicleStore {
    async fn upsert_observation(&self, observation: &VehicleObservation) -> Result<UpsertOutcome> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();
        match rows.get_mut(&observation.vehicle_id) {
            Some(row) => {
                row.last_detected = now;
                row.detection_count += 1;
                row.avg_similarity = (row.avg_similarity * f64::from(row.detection_count - 1)
                    + observation.similarity_score)
                    / f64::from(row.detection_count);
                row.max_similarity = row.max_similarity.max(observation.similarity_score);
                row.observation = observation.clone();
                Ok(UpsertOutcome { created: false })
            }
            None => {
                rows.insert(
                    observation.vehicle_id.clone(),
                    MemoryVehicle {
                        observation: observation.clone(),
                        first_detected: now,
                        last_detected: now,
                        detection_count: 1,
                        avg_similarity: observation.similarity_score,
                        max_similarity: observation.similarity_score,
                        status: VehicleStatus::Detected,
                        verification_notes: None,
                    },
                );
                Ok(UpsertOutcome { created: true })
            }
        }
    }

    async fn update_status(
        &self,
        vehicle_id: &str,
        new_status: VehicleStatus,
        note: Option<&str>,
    ) -> Result<StatusUpdate> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(vehicle_id) else {
            return Ok(StatusUpdate::NotFound);
        };
        if row.status != new_status && !row.status.can_transition_to(new_status) {
            return Ok(StatusUpdate::InvalidTransition);
        }
        row.status = new_status;
        if let Some(note) = note {
            row.verification_notes = Some(note.to_string());
        }
        Ok(StatusUpdate::Updated)
    }
}

/// In-memory analysis-log sink.
#[derive(Default)]
pub struct MemoryLogStore {
    pub logs: Mutex<Vec<AnalysisLog>>,
}

#[async_trait]
impl AnalysisLogStore for MemoryLogStore {
    async fn record(&self, log: &AnalysisLog) -> Result<()> {
        self.logs.lock().await.push(log.clone());
        Ok(())
    }
}

/// Imagery provider serving canned rasters keyed by source id, or a
/// simulated outage.
pub struct StubImagery {
    pub images: HashMap<String, RgbImage>,
    pub unavailable: bool,
}

impl StubImagery {
    pub fn new(images: HashMap<String, RgbImage>) -> Self {
        Self {
            images,
            unavailable: false,
        }
    }

    pub fn outage() -> Self {
        Self {
            images: HashMap::new(),
            unavailable: true,
        }
    }
}

/// ~0.12 m/px at mid latitude; car-sized blobs come out around 38x15 px.
pub fn test_transform() -> GeoTransform {
    GeoTransform {
        origin_lat: 37.0,
        origin_lon: 127.0,
        degrees_per_pixel_x: 1.35e-6,
        degrees_per_pixel_y: -1.35e-6,
    }
}

#[async_trait]
impl ImageryProvider for StubImagery {
    async fn fetch_stitched(
        &self,
        source: &TileSource,
        latitude: f64,
        longitude: f64,
        zoom: u8,
        _radius: u32,
    ) -> Result<FetchOutcome> {
        if self.unavailable {
            return Ok(FetchOutcome::NotAvailable {
                failed_tiles: 9,
                total_tiles: 9,
            });
        }
        let image = self
            .images
            .get(&source.id)
            .cloned()
            .ok_or_else(|| anyhow!("no stub image for source {}", source.id))?;
        Ok(FetchOutcome::Fetched(Arc::new(StitchedImage::new(
            image,
            latitude,
            longitude,
            zoom,
            test_transform(),
        ))))
    }
}

/// Deterministic toy embedder: normalized channel statistics. Identical
/// crops embed identically; differently colored crops diverge sharply.
pub struct ColorStatsEmbedder;

impl Embedder for ColorStatsEmbedder {
    fn dim(&self) -> usize {
        8
    }

    fn embed(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        let n = (crop.width() * crop.height()) as f32;
        let mut sums = [0f32; 3];
        let mut sq = [0f32; 3];
        for pixel in crop.pixels() {
            for c in 0..3 {
                let v = f32::from(pixel.0[c]);
                sums[c] += v;
                sq[c] += v * v;
            }
        }
        let mut v = Vec::with_capacity(8);
        for c in 0..3 {
            v.push(sums[c] / n);
        }
        for c in 0..3 {
            v.push((sq[c] / n - (sums[c] / n).powi(2)).max(0.0).sqrt());
        }
        v.push(crop.width() as f32);
        v.push(crop.height() as f32);

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

/// Paint an axis-aligned block; the heuristic proposer sees it as a
/// vehicle-sized blob when its size matches the ground sample distance.
pub fn paint_block(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
    for py in y..(y + h).min(image.height()) {
        for px in x..(x + w).min(image.width()) {
            image.put_pixel(px, py, image::Rgb(color));
        }
    }
}
