//! End-to-end pipeline scenarios over stub imagery and an in-memory store.
//!
//! These exercise the full analyze path: stitched fetch, registration,
//! region proposal, cross-year pairing, embedding, classification and
//! persistence, without a tile provider or Postgres.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbImage;
use tokio_util::sync::CancellationToken;

use common::{
    ColorStatsEmbedder, MemoryLogStore, MemoryVehicleStore, StubImagery, paint_block,
};
use derelict::config::DetectionConfig;
use derelict::embedder::EmbeddingWorker;
use derelict::engine::{AbandonmentEngine, AnalysisError, AnalysisRequest};
use derelict::regions::HeuristicProposer;
use derelict::tile_client::TileSource;
use derelict::tile_service::ImageryProvider;
use derelict::vehicles::VehicleStatus;

const BG: [u8; 3] = [40, 40, 40];
// Colors chosen with strong luminance contrast against the background so
// the heuristic proposer sees the blob in grayscale, and with distinct
// channel profiles so the stub embedder separates them.
const RED_CAR: [u8; 3] = [220, 60, 60];
const GREEN_CAR: [u8; 3] = [60, 220, 60];

/// Car-sized blob at ~0.12 m/px: 38 x 15 px.
const CAR: (u32, u32, u32, u32) = (100, 120, 38, 15);

fn blank_scene() -> RgbImage {
    RgbImage::from_pixel(256, 256, image::Rgb(BG))
}

fn scene_with_car(color: [u8; 3]) -> RgbImage {
    let mut scene = blank_scene();
    let (x, y, w, h) = CAR;
    paint_block(&mut scene, x, y, w, h, color);
    scene
}

fn build_engine(
    imagery: Arc<dyn ImageryProvider>,
    store: Arc<MemoryVehicleStore>,
    logs: Arc<MemoryLogStore>,
) -> AbandonmentEngine {
    AbandonmentEngine::new(
        imagery,
        store,
        logs,
        Arc::new(HeuristicProposer::default()),
        EmbeddingWorker::spawn(Box::new(ColorStatsEmbedder)),
        TileSource::new("y2020", "https://tiles.example/{z}/{y}/{x}.jpeg"),
        TileSource::new("y2023", "https://tiles.example/{z}/{y}/{x}.jpeg"),
        DetectionConfig::default(),
    )
}

fn request() -> AnalysisRequest {
    AnalysisRequest {
        center_lat: 37.0,
        center_lon: 127.0,
        zoom: 17,
        tile_radius: 1,
        year1: 2020,
        year2: 2023,
        region_label: Some("test lot".to_string()),
        city: Some("Seoul".to_string()),
        district: None,
        address: None,
    }
}

fn imagery_for(year1_scene: RgbImage, year2_scene: RgbImage) -> Arc<StubImagery> {
    let mut images = HashMap::new();
    images.insert("y2020".to_string(), year1_scene);
    images.insert("y2023".to_string(), year2_scene);
    Arc::new(StubImagery::new(images))
}

#[tokio::test]
async fn clean_repeat_creates_one_critical_vehicle() {
    let store = Arc::new(MemoryVehicleStore::default());
    let logs = Arc::new(MemoryLogStore::default());
    let imagery = imagery_for(scene_with_car(RED_CAR), scene_with_car(RED_CAR));
    let engine = build_engine(imagery, Arc::clone(&store), Arc::clone(&logs));

    let result = engine
        .analyze(&request(), CancellationToken::new())
        .await
        .expect("run should succeed");

    assert_eq!(result.comparisons_done, 1);
    assert_eq!(result.abandoned_found, 1);
    assert_eq!(result.new_vehicles, 1);
    assert_eq!(result.updated_vehicles, 0);

    let rows = store.rows.lock().await;
    assert_eq!(rows.len(), 1);
    let row = rows.values().next().unwrap();
    assert_eq!(row.detection_count, 1);
    assert!(row.observation.similarity_score > 0.999, "identical crops");
    // 3-year gap at full similarity is CRITICAL.
    assert_eq!(row.observation.risk_level.to_string(), "CRITICAL");
    assert_eq!(row.status, VehicleStatus::Detected);
    assert!((row.avg_similarity - row.max_similarity).abs() < 1e-12);
    assert!(row.first_detected <= row.last_detected);

    let logs = logs.logs.lock().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].new_vehicles, 1);
    assert!(logs[0].error.is_none());
    assert!(logs[0].finished_at.is_some());
}

#[tokio::test]
async fn repeated_run_is_idempotent_on_identity() {
    let store = Arc::new(MemoryVehicleStore::default());
    let logs = Arc::new(MemoryLogStore::default());
    let imagery = imagery_for(scene_with_car(RED_CAR), scene_with_car(RED_CAR));
    let engine = build_engine(imagery, Arc::clone(&store), Arc::clone(&logs));

    let first = engine
        .analyze(&request(), CancellationToken::new())
        .await
        .unwrap();
    let second = engine
        .analyze(&request(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.new_vehicles, 1);
    assert_eq!(second.new_vehicles, 0, "same scene maps to the same identity");
    assert_eq!(second.updated_vehicles, 1);

    let rows = store.rows.lock().await;
    assert_eq!(rows.len(), 1, "no duplicate records across runs");
    let row = rows.values().next().unwrap();
    assert_eq!(row.detection_count, 2);
    assert!(row.max_similarity >= row.avg_similarity);
}

#[tokio::test]
async fn changed_vehicle_is_compared_but_not_stored() {
    let store = Arc::new(MemoryVehicleStore::default());
    let logs = Arc::new(MemoryLogStore::default());
    // Same parking spot, visibly different vehicle in year 2.
    let imagery = imagery_for(scene_with_car(RED_CAR), scene_with_car(GREEN_CAR));
    let engine = build_engine(imagery, Arc::clone(&store), Arc::clone(&logs));

    let result = engine
        .analyze(&request(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.comparisons_done, 1, "the pair is still compared");
    assert_eq!(result.abandoned_found, 0);
    assert_eq!(result.new_vehicles, 0);
    assert!(store.rows.lock().await.is_empty(), "below threshold, no write");

    let logs = logs.logs.lock().await;
    assert_eq!(logs[0].new_vehicles, 0);
    assert_eq!(logs[0].comparisons_done, 1);
}

#[tokio::test]
async fn vacated_spot_produces_no_comparison() {
    let store = Arc::new(MemoryVehicleStore::default());
    let logs = Arc::new(MemoryLogStore::default());
    // Year 2 shows bare asphalt: no candidate, so the year-1 candidate has
    // no partner and is dropped silently.
    let imagery = imagery_for(scene_with_car(RED_CAR), blank_scene());
    let engine = build_engine(imagery, Arc::clone(&store), Arc::clone(&logs));

    let result = engine
        .analyze(&request(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.comparisons_done, 0);
    assert_eq!(result.new_vehicles, 0);
    assert!(store.rows.lock().await.is_empty());
}

#[tokio::test]
async fn tile_outage_fails_run_and_logs_error() {
    let store = Arc::new(MemoryVehicleStore::default());
    let logs = Arc::new(MemoryLogStore::default());
    let engine = build_engine(
        Arc::new(StubImagery::outage()),
        Arc::clone(&store),
        Arc::clone(&logs),
    );

    let error = engine
        .analyze(&request(), CancellationToken::new())
        .await
        .expect_err("outage must fail the run");
    assert!(matches!(error, AnalysisError::Upstream(_)), "{error}");

    assert!(store.rows.lock().await.is_empty(), "no vehicle rows mutated");
    let logs = logs.logs.lock().await;
    assert_eq!(logs.len(), 1, "failed runs still leave a log row");
    assert!(logs[0].error.is_some());
}

#[tokio::test]
async fn invalid_coordinates_are_rejected_immediately() {
    let store = Arc::new(MemoryVehicleStore::default());
    let logs = Arc::new(MemoryLogStore::default());
    let imagery = imagery_for(scene_with_car(RED_CAR), scene_with_car(RED_CAR));
    let engine = build_engine(imagery, Arc::clone(&store), Arc::clone(&logs));

    let mut bad = request();
    bad.center_lat = 95.0;
    let error = engine
        .analyze(&bad, CancellationToken::new())
        .await
        .expect_err("latitude 95 is invalid");
    assert!(matches!(error, AnalysisError::Input(_)));
    assert!(logs.logs.lock().await.is_empty(), "rejected before any work");
}

#[tokio::test]
async fn concurrent_runs_on_same_region_serialize_at_the_store() {
    let store = Arc::new(MemoryVehicleStore::default());
    let logs = Arc::new(MemoryLogStore::default());
    let imagery = imagery_for(scene_with_car(RED_CAR), scene_with_car(RED_CAR));
    let engine = Arc::new(build_engine(imagery, Arc::clone(&store), Arc::clone(&logs)));

    let a = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.analyze(&request(), CancellationToken::new()).await })
    };
    let b = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.analyze(&request(), CancellationToken::new()).await })
    };

    let a = a.await.unwrap().expect("first run succeeds");
    let b = b.await.unwrap().expect("second run succeeds");

    // Exactly one run created the record; together they contributed two
    // observations.
    assert_eq!(a.new_vehicles + b.new_vehicles, 1);
    assert_eq!(
        a.new_vehicles + a.updated_vehicles + b.new_vehicles + b.updated_vehicles,
        2
    );

    let rows = store.rows.lock().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows.values().next().unwrap().detection_count, 2);
}

#[tokio::test]
async fn cancelled_run_is_abandoned_and_logged() {
    let store = Arc::new(MemoryVehicleStore::default());
    let logs = Arc::new(MemoryLogStore::default());
    let imagery = imagery_for(scene_with_car(RED_CAR), scene_with_car(RED_CAR));
    let engine = build_engine(imagery, Arc::clone(&store), Arc::clone(&logs));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = engine
        .analyze(&request(), cancel)
        .await
        .expect_err("pre-cancelled token must abandon the run");
    assert!(matches!(error, AnalysisError::Cancelled));

    let logs = logs.logs.lock().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].error.is_some());
}
