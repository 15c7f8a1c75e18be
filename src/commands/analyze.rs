//! `derelict analyze` - run one comparison over a geographic window.

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analysis_logs_repo::AnalysisLogsRepository;
use crate::config::{DetectionConfig, ProposerMode};
use crate::db;
use crate::embedder::{EmbeddingWorker, OnnxEmbedder};
use crate::engine::{AbandonmentEngine, AnalysisError, AnalysisRequest};
use crate::geocoding::Geocoder;
use crate::regions::{HeuristicProposer, OnnxDetectorProposer, RegionProposer};
use crate::tile_cache::TileCache;
use crate::tile_client::{TileClient, TileSource};
use crate::tile_service::TileService;
use crate::vehicles_repo::VehiclesRepository;

#[allow(clippy::too_many_arguments)]
pub async fn handle_analyze(
    mut config: DetectionConfig,
    lat: Option<f64>,
    lon: Option<f64>,
    address: Option<String>,
    year1: i32,
    year2: i32,
    zoom: Option<u8>,
    radius: Option<u32>,
    threshold: Option<f64>,
    region_label: Option<String>,
    city: Option<String>,
    district: Option<String>,
) -> Result<(), AnalysisError> {
    if let Some(threshold) = threshold {
        config.similarity_threshold = threshold;
    }
    config
        .validate()
        .map_err(|e| AnalysisError::Input(e.to_string()))?;

    // Resolve the center: explicit coordinates win, otherwise geocode.
    let (center_lat, center_lon, resolved_address) = match (lat, lon, &address) {
        (Some(lat), Some(lon), _) => (lat, lon, address.clone()),
        (None, None, Some(query)) => {
            let geocoder = Geocoder::new();
            let point = geocoder
                .geocode_address(query)
                .await
                .map_err(|e| AnalysisError::Upstream(e.to_string()))?
                .ok_or_else(|| {
                    AnalysisError::Input(format!("address not found: {query}"))
                })?;
            (point.latitude, point.longitude, Some(point.display_name))
        }
        _ => {
            return Err(AnalysisError::Input(
                "provide either --lat and --lon, or --address".to_string(),
            ));
        }
    };

    if config.year1_tile_url.is_empty() || config.year2_tile_url.is_empty() {
        return Err(AnalysisError::Input(
            "DERELICT_YEAR1_TILE_URL and DERELICT_YEAR2_TILE_URL must be set".to_string(),
        ));
    }

    let database_url = env::var("DATABASE_URL")
        .map_err(|_| AnalysisError::Input("DATABASE_URL must be set".to_string()))?;
    let pool = db::build_pool(&database_url).map_err(|e| AnalysisError::Store(e.to_string()))?;

    let cache = Arc::new(
        TileCache::new(
            config.cache_dir.clone(),
            config.cache_ttl(),
            config.cache_max_bytes,
        )
        .map_err(AnalysisError::Internal)?,
    );
    let client = TileClient::new().map_err(AnalysisError::Internal)?;
    let imagery = Arc::new(TileService::new(client, cache, config.fetch_concurrency));

    let proposer: Arc<dyn RegionProposer> = match config.proposer_mode {
        ProposerMode::Heuristic => Arc::new(HeuristicProposer::default()),
        ProposerMode::Detector => {
            let path = config
                .detector_model_path
                .clone()
                .context("detector mode requires a model path")
                .map_err(|e| AnalysisError::Input(e.to_string()))?;
            Arc::new(
                OnnxDetectorProposer::load(&path, config.detector_confidence, config.nms_iou)
                    .map_err(AnalysisError::Internal)?,
            )
        }
    };

    let embedder = OnnxEmbedder::load(&config.embedder_model_path, config.embedding_dim)
        .map_err(AnalysisError::Internal)?;
    let embedder = EmbeddingWorker::spawn(Box::new(embedder));

    let year1_source = TileSource::new(format!("y{year1}"), config.year1_tile_url.clone())
        .with_api_key(config.tile_api_key.clone(), config.api_key_placement);
    let year2_source = TileSource::new(format!("y{year2}"), config.year2_tile_url.clone())
        .with_api_key(config.tile_api_key.clone(), config.api_key_placement);

    let default_zoom = config.zoom;
    let default_radius = config.tile_radius;

    let engine = AbandonmentEngine::new(
        imagery,
        Arc::new(VehiclesRepository::new(pool.clone())),
        Arc::new(AnalysisLogsRepository::new(pool)),
        proposer,
        embedder,
        year1_source,
        year2_source,
        config,
    );

    let request = AnalysisRequest {
        center_lat,
        center_lon,
        zoom: zoom.unwrap_or(default_zoom),
        tile_radius: radius.unwrap_or(default_radius),
        year1,
        year2,
        region_label,
        city,
        district,
        address: resolved_address,
    };

    // Ctrl-C cancels cooperatively between pipeline stages.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling analysis");
                cancel.cancel();
            }
        });
    }

    let result = engine.analyze(&request, cancel).await?;
    info!(
        run_id = %result.run_id,
        aligned = result.aligned,
        candidates = result.candidates_considered,
        comparisons = result.comparisons_done,
        abandoned = result.abandoned_found,
        new = result.new_vehicles,
        updated = result.updated_vehicles,
        "analysis finished"
    );
    println!(
        "run {}: {} candidates, {} comparisons, {} abandoned ({} new, {} updated)",
        result.run_id,
        result.candidates_considered,
        result.comparisons_done,
        result.abandoned_found,
        result.new_vehicles,
        result.updated_vehicles,
    );
    Ok(())
}
