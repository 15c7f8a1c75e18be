//! Static CCTV registry with nearest-neighbor lookup.
//!
//! The registry is a fixed point set loaded once from a JSON file; queries
//! reduce to k-nearest by great-circle distance over that set.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::geometry::haversine_distance;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cctv {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub stream_url: String,
    pub is_public: bool,
}

/// A registry entry with its distance to the query point, meters.
#[derive(Debug, Clone, Serialize)]
pub struct NearbyCctv {
    pub cctv: Cctv,
    pub distance_m: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CctvRegistry {
    cameras: Vec<Cctv>,
}

impl CctvRegistry {
    pub fn new(cameras: Vec<Cctv>) -> Self {
        Self { cameras }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read CCTV registry {}", path.display()))?;
        let cameras: Vec<Cctv> = serde_json::from_str(&raw)
            .with_context(|| format!("malformed CCTV registry {}", path.display()))?;
        Ok(Self::new(cameras))
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// The `k` registered cameras closest to the point, nearest first.
    pub fn nearest(&self, latitude: f64, longitude: f64, k: usize) -> Vec<NearbyCctv> {
        let mut scored: Vec<NearbyCctv> = self
            .cameras
            .iter()
            .map(|cctv| NearbyCctv {
                distance_m: haversine_distance(latitude, longitude, cctv.lat, cctv.lon),
                cctv: cctv.clone(),
            })
            .collect();
        scored.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        scored.truncate(k);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CctvRegistry {
        CctvRegistry::new(vec![
            Cctv {
                id: "c1".into(),
                name: "lot north".into(),
                lat: 37.5665,
                lon: 126.9780,
                stream_url: "rtsp://example/1".into(),
                is_public: true,
            },
            Cctv {
                id: "c2".into(),
                name: "lot south".into(),
                lat: 37.5600,
                lon: 126.9780,
                stream_url: "rtsp://example/2".into(),
                is_public: false,
            },
            Cctv {
                id: "c3".into(),
                name: "far away".into(),
                lat: 35.1796,
                lon: 129.0756,
                stream_url: "rtsp://example/3".into(),
                is_public: true,
            },
        ])
    }

    #[test]
    fn nearest_orders_by_distance() {
        let nearby = registry().nearest(37.5660, 126.9780, 2);
        assert_eq!(nearby.len(), 2);
        assert_eq!(nearby[0].cctv.id, "c1");
        assert_eq!(nearby[1].cctv.id, "c2");
        assert!(nearby[0].distance_m < nearby[1].distance_m);
    }

    #[test]
    fn k_larger_than_registry_returns_all() {
        let nearby = registry().nearest(37.5660, 126.9780, 10);
        assert_eq!(nearby.len(), 3);
    }
}
