//! The abandonment engine: orchestrates one comparison run end to end.
//!
//! For a geographic window and a pair of years the engine fetches stitched
//! imagery for both years, registers the two rasters, proposes candidate
//! parking regions, pairs them across years, embeds each paired crop and
//! classifies the pair by cosine similarity. Confirmed pairs are folded
//! into durable vehicle records keyed by a location-stable identity, and
//! every run (including failed ones) leaves one analysis-log row behind.

use anyhow::Result;
use chrono::Utc;
use image::{RgbImage, imageops};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::alignment::{AlignmentResult, ImageAligner};
use crate::analysis_logs_repo::{AnalysisLog, AnalysisLogStore};
use crate::config::DetectionConfig;
use crate::embedder::{EmbeddingWorker, Priority, cosine_similarity};
use crate::geometry::valid_wgs84;
use crate::regions::{BBox, CandidatePair, RegionProposer, pair_candidates};
use crate::tile_client::TileSource;
use crate::tile_service::{FetchOutcome, ImageryProvider};
use crate::tiles::{GeoTransform, StitchedImage};
use crate::vehicles::{RiskLevel, VehicleObservation, VehicleStore, derive_vehicle_id};

/// Candidate pairs embedded per batch; cancellation is checked between
/// batches.
const EMBED_BATCH_PAIRS: usize = 16;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Bad coordinates or parameters; surfaced immediately, never retried.
    #[error("invalid input: {0}")]
    Input(String),
    /// Imagery could not be produced for one of the years.
    #[error("imagery unavailable: {0}")]
    Upstream(String),
    /// The persistent store failed after retries.
    #[error("store failure: {0}")]
    Store(String),
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),
    #[error("analysis cancelled")]
    Cancelled,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Parameters of one `analyze` call. Location labels are caller-supplied
/// best-effort context and are stored untrusted.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom: u8,
    pub tile_radius: u32,
    pub year1: i32,
    pub year2: i32,
    pub region_label: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub run_id: Uuid,
    pub aligned: bool,
    pub candidates_considered: usize,
    pub comparisons_done: usize,
    pub abandoned_found: usize,
    pub new_vehicles: usize,
    pub updated_vehicles: usize,
}

pub struct AbandonmentEngine {
    imagery: Arc<dyn ImageryProvider>,
    store: Arc<dyn VehicleStore>,
    logs: Arc<dyn AnalysisLogStore>,
    proposer: Arc<dyn RegionProposer>,
    embedder: EmbeddingWorker,
    aligner: ImageAligner,
    year1_source: TileSource,
    year2_source: TileSource,
    config: DetectionConfig,
}

impl AbandonmentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        imagery: Arc<dyn ImageryProvider>,
        store: Arc<dyn VehicleStore>,
        logs: Arc<dyn AnalysisLogStore>,
        proposer: Arc<dyn RegionProposer>,
        embedder: EmbeddingWorker,
        year1_source: TileSource,
        year2_source: TileSource,
        config: DetectionConfig,
    ) -> Self {
        let aligner = ImageAligner::new(config.min_matches, config.ransac_reproj_px);
        Self {
            imagery,
            store,
            logs,
            proposer,
            embedder,
            aligner,
            year1_source,
            year2_source,
            config,
        }
    }

    /// Run one comparison. An `AnalysisLog` row is written whether the run
    /// succeeds or fails; vehicle records are only touched by confirmed
    /// pairs that were fully processed before any failure.
    #[instrument(skip(self, cancel), fields(year1 = request.year1, year2 = request.year2))]
    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        if !valid_wgs84(request.center_lat, request.center_lon) {
            return Err(AnalysisError::Input(format!(
                "coordinates out of range: ({}, {})",
                request.center_lat, request.center_lon
            )));
        }
        if request.year1 == request.year2 {
            return Err(AnalysisError::Input(
                "year1 and year2 must differ".to_string(),
            ));
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut result = AnalysisResult {
            run_id,
            ..Default::default()
        };
        info!(%run_id, "starting analysis run");

        let budget = Duration::from_secs(self.config.analyze_timeout_secs);
        let outcome = tokio::time::timeout(budget, self.run(request, &mut result, cancel))
            .await
            .unwrap_or(Err(AnalysisError::Timeout(budget)));

        let error_text = outcome.as_ref().err().map(|e| e.to_string());
        let log = AnalysisLog {
            run_id,
            region_label: request.region_label.clone(),
            center_latitude: request.center_lat,
            center_longitude: request.center_lon,
            zoom: i32::from(request.zoom),
            tile_radius: request.tile_radius as i32,
            year1: request.year1,
            year2: request.year2,
            started_at,
            finished_at: Some(Utc::now()),
            candidates_considered: result.candidates_considered as i32,
            comparisons_done: result.comparisons_done as i32,
            new_vehicles: result.new_vehicles as i32,
            updated_vehicles: result.updated_vehicles as i32,
            error: error_text,
        };
        if let Err(e) = self.logs.record(&log).await {
            warn!(%run_id, "failed to write analysis log: {e}");
        }

        outcome.map(|_| {
            info!(
                %run_id,
                new = result.new_vehicles,
                updated = result.updated_vehicles,
                "analysis run complete"
            );
            result
        })
    }

    async fn run(
        &self,
        request: &AnalysisRequest,
        result: &mut AnalysisResult,
        cancel: CancellationToken,
    ) -> Result<(), AnalysisError> {
        // Tile fetches for the two years proceed concurrently and may
        // complete in either order; alignment is the synchronization point.
        let (fetch1, fetch2) = tokio::join!(
            self.imagery.fetch_stitched(
                &self.year1_source,
                request.center_lat,
                request.center_lon,
                request.zoom,
                request.tile_radius,
            ),
            self.imagery.fetch_stitched(
                &self.year2_source,
                request.center_lat,
                request.center_lon,
                request.zoom,
                request.tile_radius,
            ),
        );
        let stitched1 = unwrap_imagery(fetch1, request.year1)?;
        let stitched2 = unwrap_imagery(fetch2, request.year2)?;

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let alignment = self.align(&stitched1, &stitched2).await?;
        result.aligned = alignment.aligned;
        let transform = offset_transform(&stitched1.transform, alignment.offset);

        let (candidates1, candidates2) = self.propose_both(&alignment, &transform).await?;
        result.candidates_considered = candidates1.len() + candidates2.len();

        let pairs = pair_candidates(&candidates1, &candidates2, &transform);
        debug!(
            candidates1 = candidates1.len(),
            candidates2 = candidates2.len(),
            pairs = pairs.len(),
            "candidate pairing complete"
        );

        for batch in pairs.chunks(EMBED_BATCH_PAIRS) {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            self.process_batch(request, &stitched1, &stitched2, &alignment, batch, result)
                .await?;
        }

        Ok(())
    }

    async fn align(
        &self,
        stitched1: &StitchedImage,
        stitched2: &StitchedImage,
    ) -> Result<AlignmentResult, AnalysisError> {
        let img1 = stitched1.image.clone();
        let img2 = stitched2.image.clone();
        let aligner = self.aligner.clone();

        let alignment = tokio::task::spawn_blocking(move || aligner.align(&img1, &img2))
            .await
            .map_err(|e| AnalysisError::Internal(e.into()))?;
        if !alignment.aligned {
            // Unaligned pairs still flow through the pipeline; they just
            // produce noisier similarities.
            warn!("image registration fell back to unaligned crop");
            metrics::counter!("engine.alignment_fallback").increment(1);
        }
        Ok(alignment)
    }

    async fn propose_both(
        &self,
        alignment: &AlignmentResult,
        transform: &GeoTransform,
    ) -> Result<(Vec<crate::regions::Candidate>, Vec<crate::regions::Candidate>), AnalysisError>
    {
        let gsd = transform.ground_sample_distance_m();
        let proposer = Arc::clone(&self.proposer);
        let img1 = alignment.img1.clone();
        let img2 = alignment.img2.clone();

        tokio::task::spawn_blocking(move || {
            let c1 = proposer.propose(&img1, gsd)?;
            let c2 = proposer.propose(&img2, gsd)?;
            Ok((c1, c2))
        })
        .await
        .map_err(|e| AnalysisError::Internal(e.into()))?
        .map_err(AnalysisError::Internal)
    }

    async fn process_batch(
        &self,
        request: &AnalysisRequest,
        stitched1: &StitchedImage,
        stitched2: &StitchedImage,
        alignment: &AlignmentResult,
        batch: &[CandidatePair],
        result: &mut AnalysisResult,
    ) -> Result<(), AnalysisError> {
        // Interleaved crops: year1 then year2 for each pair, order preserved
        // by the embedding contract.
        let mut crops = Vec::with_capacity(batch.len() * 2);
        for pair in batch {
            crops.push(crop_region(&alignment.img1, pair.bbox1));
            crops.push(crop_region(&alignment.img2, pair.bbox2));
        }

        let embeddings = self
            .embedder
            .embed_batch(Priority::Background, crops)
            .await
            .map_err(AnalysisError::Internal)?;

        for (pair, chunk) in batch.iter().zip(embeddings.chunks_exact(2)) {
            let (first, second) = (&chunk[0], &chunk[1]);
            if let Some(error) = first.error.as_ref().or(second.error.as_ref()) {
                // Per-crop isolation: a failed embedding skips the pair,
                // never the run.
                warn!(region_id = pair.region_id, "skipping pair, embedding failed: {error}");
                metrics::counter!("engine.pair_skipped").increment(1);
                continue;
            }

            result.comparisons_done += 1;
            let similarity = cosine_similarity(&first.vector, &second.vector).max(0.0);
            let years_difference = (request.year2 - request.year1).abs();
            let risk_level = RiskLevel::classify(
                similarity * 100.0,
                years_difference,
                &self.config.risk_thresholds,
            );
            debug!(
                region_id = pair.region_id,
                similarity,
                %risk_level,
                "pair compared"
            );

            if similarity < self.config.similarity_threshold {
                continue;
            }
            result.abandoned_found += 1;

            let observation = self.build_observation(
                request,
                stitched1,
                stitched2,
                alignment,
                pair,
                similarity,
                risk_level,
                years_difference,
            );
            let outcome = self
                .store
                .upsert_observation(&observation)
                .await
                .map_err(|e| AnalysisError::Store(e.to_string()))?;
            if outcome.created {
                result.new_vehicles += 1;
            } else {
                result.updated_vehicles += 1;
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_observation(
        &self,
        request: &AnalysisRequest,
        stitched1: &StitchedImage,
        stitched2: &StitchedImage,
        alignment: &AlignmentResult,
        pair: &CandidatePair,
        similarity: f64,
        risk_level: RiskLevel,
        years_difference: i32,
    ) -> VehicleObservation {
        let earlier_year = request.year1.min(request.year2);
        let vehicle_id = derive_vehicle_id(
            pair.centroid_lat,
            pair.centroid_lon,
            earlier_year,
            self.config.spatial_bin_degrees,
            self.config.year_bucket_years,
        );

        VehicleObservation {
            vehicle_id,
            latitude: pair.centroid_lat,
            longitude: pair.centroid_lon,
            city: request.city.clone(),
            district: request.district.clone(),
            address: request.address.clone(),
            vehicle_type: pair
                .label
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            similarity_score: similarity,
            risk_level,
            years_difference,
            bbox: pair.bbox2,
            extra_metadata: serde_json::json!({
                "year1": request.year1,
                "year2": request.year2,
                "region_id": pair.region_id,
                "aligned": alignment.aligned,
                "inlier_ratio": alignment.inlier_ratio,
                "image_hash_year1": stitched1.content_hash,
                "image_hash_year2": stitched2.content_hash,
            }),
        }
    }
}

fn unwrap_imagery(
    fetch: Result<FetchOutcome>,
    year: i32,
) -> Result<Arc<StitchedImage>, AnalysisError> {
    match fetch {
        Ok(FetchOutcome::Fetched(stitched)) => Ok(stitched),
        Ok(FetchOutcome::NotAvailable {
            failed_tiles,
            total_tiles,
        }) => Err(AnalysisError::Upstream(format!(
            "imagery for {year} not available ({failed_tiles}/{total_tiles} tiles failed)"
        ))),
        Err(e) => Err(AnalysisError::Upstream(format!(
            "imagery fetch for {year} failed: {e}"
        ))),
    }
}

/// Shift a stitched transform by the alignment crop offset so pixel
/// coordinates of the aligned frame still map to the right geography.
fn offset_transform(transform: &GeoTransform, offset: (u32, u32)) -> GeoTransform {
    let (dx, dy) = offset;
    GeoTransform {
        origin_lat: transform.origin_lat + f64::from(dy) * transform.degrees_per_pixel_y,
        origin_lon: transform.origin_lon + f64::from(dx) * transform.degrees_per_pixel_x,
        degrees_per_pixel_x: transform.degrees_per_pixel_x,
        degrees_per_pixel_y: transform.degrees_per_pixel_y,
    }
}

/// Clamp the bbox to the image and crop it; an out-of-frame bbox produces a
/// zero-area crop that the embedder flags downstream.
fn crop_region(image: &RgbImage, bbox: BBox) -> RgbImage {
    let x = bbox.x.min(image.width());
    let y = bbox.y.min(image.height());
    let w = bbox.w.min(image.width().saturating_sub(x));
    let h = bbox.h.min(image.height().saturating_sub(y));
    imageops::crop_imm(image, x, y, w, h).to_image()
}
