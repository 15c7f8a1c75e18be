//! `derelict cctv nearest` - k-nearest cameras to a point.

use anyhow::{Context, Result};

use crate::cctv::CctvRegistry;
use crate::config::DetectionConfig;
use crate::geometry::valid_wgs84;

pub async fn handle_cctv_nearest(
    config: &DetectionConfig,
    lat: f64,
    lon: f64,
    k: usize,
) -> Result<()> {
    if !valid_wgs84(lat, lon) {
        anyhow::bail!("coordinates out of range: ({lat}, {lon})");
    }

    let path = config
        .cctv_registry_path
        .as_ref()
        .context("DERELICT_CCTV_REGISTRY is not configured")?;
    let registry = CctvRegistry::load(path)?;

    for nearby in registry.nearest(lat, lon, k) {
        println!(
            "{:>8.1} m  {}  {}  {}",
            nearby.distance_m,
            nearby.cctv.id,
            nearby.cctv.name,
            if nearby.cctv.is_public {
                &nearby.cctv.stream_url
            } else {
                "(restricted)"
            }
        );
    }
    Ok(())
}
