//! Runtime configuration for the detection pipeline.
//!
//! Settings come from environment variables (loaded through `dotenvy` in
//! `main`) with built-in defaults; per-run parameters such as the analysis
//! center and year pair come from CLI arguments instead. Out-of-range
//! values are rejected at startup so a bad deployment fails fast rather
//! than mid-run.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// How the tile provider expects its API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyPlacement {
    /// Appended as a query parameter (`?key=...`)
    Query,
    /// Sent as a request header
    Header,
}

/// Which region-proposal implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposerMode {
    Heuristic,
    Detector,
}

/// Similarity/age pairs that drive risk classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub critical_similarity: f64,
    pub critical_min_years: i32,
    pub high_similarity: f64,
    pub high_min_years: i32,
    pub medium_similarity: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical_similarity: 0.95,
            critical_min_years: 3,
            high_similarity: 0.90,
            high_min_years: 2,
            medium_similarity: 0.85,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Classification cutoff: a pair is reported abandoned iff
    /// cosine similarity >= this value.
    pub similarity_threshold: f64,
    pub risk_thresholds: RiskThresholds,

    /// Tile block radius: a fetch stitches (2r+1)^2 tiles.
    pub tile_radius: u32,
    pub zoom: u8,

    /// Templated tile URL for the older imagery source.
    /// `{z}`, `{x}`, `{y}` are substituted per tile.
    pub year1_tile_url: String,
    /// Templated tile URL for the newer imagery source.
    pub year2_tile_url: String,
    pub tile_api_key: Option<String>,
    pub api_key_placement: ApiKeyPlacement,

    pub cache_dir: PathBuf,
    pub cache_ttl_hours: u64,
    pub cache_max_bytes: u64,
    pub fetch_concurrency: usize,

    pub proposer_mode: ProposerMode,
    /// ONNX detector model, required when `proposer_mode` is `Detector`.
    pub detector_model_path: Option<PathBuf>,
    pub detector_confidence: f32,
    pub nms_iou: f32,

    /// ONNX embedding backbone with classification head removed.
    pub embedder_model_path: PathBuf,
    /// Output dimension of the backbone; fixed per deployment.
    pub embedding_dim: usize,

    pub ransac_reproj_px: f64,
    pub min_matches: usize,

    /// Grid size for identity binning, degrees (~1.1 m at 1e-5).
    pub spatial_bin_degrees: f64,
    pub year_bucket_years: i32,

    /// Wall-clock budget for one analyze run, seconds.
    pub analyze_timeout_secs: u64,

    /// Static CCTV registry (JSON array), optional.
    pub cctv_registry_path: Option<PathBuf>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.90,
            risk_thresholds: RiskThresholds::default(),
            tile_radius: 1,
            zoom: 17,
            year1_tile_url: String::new(),
            year2_tile_url: String::new(),
            tile_api_key: None,
            api_key_placement: ApiKeyPlacement::Query,
            cache_dir: PathBuf::from("tile-cache"),
            cache_ttl_hours: 24,
            cache_max_bytes: 5_000_000_000,
            fetch_concurrency: 8,
            proposer_mode: ProposerMode::Heuristic,
            detector_model_path: None,
            detector_confidence: 0.25,
            nms_iou: 0.45,
            embedder_model_path: PathBuf::from("models/embedder.onnx"),
            embedding_dim: 1280,
            ransac_reproj_px: 3.0,
            min_matches: 10,
            spatial_bin_degrees: 1e-5,
            year_bucket_years: 1,
            analyze_timeout_secs: 300,
            cctv_registry_path: None,
        }
    }
}

impl DetectionConfig {
    /// Build the configuration from environment variables, falling back to
    /// built-in defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<f64>("DERELICT_SIMILARITY_THRESHOLD")? {
            config.similarity_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("DERELICT_RISK_CRITICAL_SIMILARITY")? {
            config.risk_thresholds.critical_similarity = v;
        }
        if let Some(v) = env_parse::<i32>("DERELICT_RISK_CRITICAL_MIN_YEARS")? {
            config.risk_thresholds.critical_min_years = v;
        }
        if let Some(v) = env_parse::<f64>("DERELICT_RISK_HIGH_SIMILARITY")? {
            config.risk_thresholds.high_similarity = v;
        }
        if let Some(v) = env_parse::<i32>("DERELICT_RISK_HIGH_MIN_YEARS")? {
            config.risk_thresholds.high_min_years = v;
        }
        if let Some(v) = env_parse::<f64>("DERELICT_RISK_MEDIUM_SIMILARITY")? {
            config.risk_thresholds.medium_similarity = v;
        }
        if let Some(v) = env_parse::<u32>("DERELICT_TILE_RADIUS")? {
            config.tile_radius = v;
        }
        if let Some(v) = env_parse::<u8>("DERELICT_ZOOM")? {
            config.zoom = v;
        }
        if let Ok(v) = env::var("DERELICT_YEAR1_TILE_URL") {
            config.year1_tile_url = v;
        }
        if let Ok(v) = env::var("DERELICT_YEAR2_TILE_URL") {
            config.year2_tile_url = v;
        }
        if let Ok(v) = env::var("DERELICT_TILE_API_KEY") {
            if !v.trim().is_empty() {
                config.tile_api_key = Some(v);
            }
        }
        if let Ok(v) = env::var("DERELICT_API_KEY_PLACEMENT") {
            config.api_key_placement = match v.to_ascii_lowercase().as_str() {
                "query" => ApiKeyPlacement::Query,
                "header" => ApiKeyPlacement::Header,
                other => bail!("unknown API key placement: {other}"),
            };
        }
        if let Ok(v) = env::var("DERELICT_CACHE_DIR") {
            config.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<u64>("DERELICT_CACHE_TTL_HOURS")? {
            config.cache_ttl_hours = v;
        }
        if let Some(v) = env_parse::<u64>("DERELICT_CACHE_MAX_BYTES")? {
            config.cache_max_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("DERELICT_FETCH_CONCURRENCY")? {
            config.fetch_concurrency = v;
        }
        if let Ok(v) = env::var("DERELICT_PROPOSER_MODE") {
            config.proposer_mode = match v.to_ascii_lowercase().as_str() {
                "heuristic" => ProposerMode::Heuristic,
                "detector" => ProposerMode::Detector,
                other => bail!("unknown proposer mode: {other}"),
            };
        }
        if let Ok(v) = env::var("DERELICT_DETECTOR_MODEL") {
            config.detector_model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse::<f32>("DERELICT_DETECTOR_CONFIDENCE")? {
            config.detector_confidence = v;
        }
        if let Some(v) = env_parse::<f32>("DERELICT_NMS_IOU")? {
            config.nms_iou = v;
        }
        if let Ok(v) = env::var("DERELICT_EMBEDDER_MODEL") {
            config.embedder_model_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse::<usize>("DERELICT_EMBEDDING_DIM")? {
            config.embedding_dim = v;
        }
        if let Some(v) = env_parse::<f64>("DERELICT_RANSAC_REPROJ_PX")? {
            config.ransac_reproj_px = v;
        }
        if let Some(v) = env_parse::<usize>("DERELICT_MIN_MATCHES")? {
            config.min_matches = v;
        }
        if let Some(v) = env_parse::<f64>("DERELICT_SPATIAL_BIN_DEGREES")? {
            config.spatial_bin_degrees = v;
        }
        if let Some(v) = env_parse::<i32>("DERELICT_YEAR_BUCKET_YEARS")? {
            config.year_bucket_years = v;
        }
        if let Some(v) = env_parse::<u64>("DERELICT_ANALYZE_TIMEOUT_SECS")? {
            config.analyze_timeout_secs = v;
        }
        if let Ok(v) = env::var("DERELICT_CCTV_REGISTRY") {
            config.cctv_registry_path = Some(PathBuf::from(v));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range settings before any work starts.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            );
        }
        for (name, value) in [
            ("critical", self.risk_thresholds.critical_similarity),
            ("high", self.risk_thresholds.high_similarity),
            ("medium", self.risk_thresholds.medium_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("risk {name} similarity must be within [0, 1], got {value}");
            }
        }
        if self.zoom == 0 || self.zoom > 22 {
            bail!("zoom must be within 1..=22, got {}", self.zoom);
        }
        if self.embedding_dim != 1280 && self.embedding_dim != 2048 {
            bail!(
                "embedding_dim must be 1280 or 2048, got {}",
                self.embedding_dim
            );
        }
        if self.fetch_concurrency == 0 {
            bail!("fetch_concurrency must be at least 1");
        }
        if !(0.0..=1.0).contains(&(self.detector_confidence as f64)) {
            bail!(
                "detector_confidence must be within [0, 1], got {}",
                self.detector_confidence
            );
        }
        if !(0.0..=1.0).contains(&(self.nms_iou as f64)) {
            bail!("nms_iou must be within [0, 1], got {}", self.nms_iou);
        }
        if self.spatial_bin_degrees <= 0.0 {
            bail!(
                "spatial_bin_degrees must be positive, got {}",
                self.spatial_bin_degrees
            );
        }
        if self.year_bucket_years < 1 {
            bail!(
                "year_bucket_years must be at least 1, got {}",
                self.year_bucket_years
            );
        }
        if self.ransac_reproj_px <= 0.0 {
            bail!(
                "ransac_reproj_px must be positive, got {}",
                self.ransac_reproj_px
            );
        }
        if self.proposer_mode == ProposerMode::Detector && self.detector_model_path.is_none() {
            bail!("detector proposer mode requires DERELICT_DETECTOR_MODEL");
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_hours * 3600)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(e) => bail!("invalid value for {name}: {e}"),
        },
        Err(_) => Ok(None),
    }
}
