//! On-disk cache for stitched imagery.
//!
//! Layout: the cache directory is sharded by the first two hex characters of
//! the entry key; each entry is a `{key}.image` (PNG) plus a `{key}.meta`
//! (JSON sidecar with timestamps, footprint and size). Writes go to a temp
//! file and are renamed into place, so a crashed writer never leaves a
//! half-written entry visible; the meta file is renamed last and readers
//! treat a missing meta as a cache miss. The cache directory may be shared
//! across processes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::tiles::{GeoTransform, StitchedImage, TileCoord};

/// Sidecar metadata persisted next to each cached raster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom: u8,
    pub transform: GeoTransform,
    pub content_hash: String,
}

/// Counters reported by `cache stats`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub total_bytes: u64,
    pub entries: u64,
}

pub struct TileCache {
    root: PathBuf,
    ttl: Duration,
    max_bytes: u64,
    requests: AtomicU64,
    hits: AtomicU64,
}

impl TileCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache dir {}", root.display()))?;
        Ok(Self {
            root,
            ttl,
            max_bytes,
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        })
    }

    /// Deterministic entry key for a stitched fetch.
    pub fn entry_key(source_id: &str, center: TileCoord, radius: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(center.zoom.to_le_bytes());
        hasher.update(center.x.to_le_bytes());
        hasher.update(center.y.to_le_bytes());
        hasher.update(radius.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a fresh entry. Expired or unreadable entries count as misses.
    pub fn lookup(&self, key: &str) -> Option<StitchedImage> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let meta = match self.read_meta(key) {
            Some(meta) => meta,
            None => {
                metrics::counter!("tile_cache.miss").increment(1);
                return None;
            }
        };

        let age = Utc::now().signed_duration_since(meta.created_at);
        if age.num_seconds() < 0 || age.to_std().map(|a| a > self.ttl).unwrap_or(true) {
            metrics::counter!("tile_cache.expired").increment(1);
            return None;
        }

        let image_path = self.image_path(key);
        let image = match image::open(&image_path) {
            Ok(decoded) => decoded.to_rgb8(),
            Err(e) => {
                warn!(key, "cached image unreadable, treating as miss: {e}");
                return None;
            }
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tile_cache.hit").increment(1);
        Some(StitchedImage {
            image,
            center_lat: meta.center_lat,
            center_lon: meta.center_lon,
            zoom: meta.zoom,
            transform: meta.transform,
            content_hash: meta.content_hash,
        })
    }

    /// Persist an entry atomically, then enforce the byte cap.
    pub fn store(&self, key: &str, stitched: &StitchedImage) -> Result<()> {
        let shard = self.shard_dir(key);
        fs::create_dir_all(&shard)
            .with_context(|| format!("failed to create shard dir {}", shard.display()))?;

        let mut encoded = Vec::new();
        stitched
            .image
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .context("failed to encode cached image")?;

        let image_path = self.image_path(key);
        write_atomic(&image_path, &encoded)?;

        let meta = CacheMeta {
            key: key.to_string(),
            created_at: Utc::now(),
            size_bytes: encoded.len() as u64,
            center_lat: stitched.center_lat,
            center_lon: stitched.center_lon,
            zoom: stitched.zoom,
            transform: stitched.transform,
            content_hash: stitched.content_hash.clone(),
        };
        let meta_bytes = serde_json::to_vec(&meta)?;
        // Meta goes last: its presence marks the entry complete.
        write_atomic(&self.meta_path(key), &meta_bytes)?;

        debug!(key, bytes = encoded.len(), "cached stitched image");
        self.evict_over_cap()?;
        Ok(())
    }

    /// Remove entries older than the TTL. Returns bytes reclaimed.
    pub fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut reclaimed = 0u64;
        for meta in self.scan_metas() {
            let age = now.signed_duration_since(meta.created_at);
            let expired = age.num_seconds() < 0 || age.to_std().map(|a| a > self.ttl).unwrap_or(true);
            if expired {
                reclaimed += self.remove_entry(&meta.key);
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "cleaned up expired cache entries");
        }
        Ok(reclaimed)
    }

    /// Remove every entry. Returns the number of entries removed.
    pub fn clear(&self) -> Result<u64> {
        let mut removed = 0u64;
        for meta in self.scan_metas() {
            self.remove_entry(&meta.key);
            removed += 1;
        }
        info!(removed, "cleared tile cache");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let metas = self.scan_metas();
        CacheStats {
            total_requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.hits.load(Ordering::Relaxed),
            total_bytes: metas.iter().map(|m| m.size_bytes).sum(),
            entries: metas.len() as u64,
        }
    }

    /// Oldest-first eviction until total size fits under the cap.
    fn evict_over_cap(&self) -> Result<()> {
        let mut metas = self.scan_metas();
        let mut total: u64 = metas.iter().map(|m| m.size_bytes).sum();
        if total <= self.max_bytes {
            return Ok(());
        }

        metas.sort_by_key(|m| m.created_at);
        for meta in metas {
            if total <= self.max_bytes {
                break;
            }
            let freed = self.remove_entry(&meta.key);
            total = total.saturating_sub(freed);
            metrics::counter!("tile_cache.evicted").increment(1);
        }
        Ok(())
    }

    fn remove_entry(&self, key: &str) -> u64 {
        let mut freed = 0u64;
        // Meta first so a concurrent reader can't see an image-less entry as valid.
        let meta_path = self.meta_path(key);
        if let Ok(stat) = fs::metadata(&meta_path) {
            freed += stat.len();
        }
        let _ = fs::remove_file(&meta_path);

        let image_path = self.image_path(key);
        if let Ok(stat) = fs::metadata(&image_path) {
            freed += stat.len();
        }
        let _ = fs::remove_file(&image_path);
        freed
    }

    fn scan_metas(&self) -> Vec<CacheMeta> {
        let mut metas = Vec::new();
        let shards = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return metas,
        };
        for shard in shards.flatten() {
            let path = shard.path();
            if !path.is_dir() {
                continue;
            }
            let Ok(entries) = fs::read_dir(&path) else {
                continue;
            };
            for entry in entries.flatten() {
                let file = entry.path();
                if file.extension().and_then(|e| e.to_str()) != Some("meta") {
                    continue;
                }
                match fs::read(&file)
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<CacheMeta>(&bytes).ok())
                {
                    Some(meta) => metas.push(meta),
                    None => warn!(path = %file.display(), "unreadable cache meta, skipping"),
                }
            }
        }
        metas
    }

    fn read_meta(&self, key: &str) -> Option<CacheMeta> {
        let bytes = fs::read(self.meta_path(key)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2])
    }

    fn image_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(format!("{key}.image"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(format!("{key}.meta"))
    }
}

/// Write via temp file + rename so readers never observe partial content.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .context("cache path has no parent directory")?;
    let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}
