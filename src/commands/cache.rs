//! `derelict cache` - operator maintenance of the on-disk tile cache.

use anyhow::Result;

use crate::config::DetectionConfig;
use crate::tile_cache::TileCache;

fn open_cache(config: &DetectionConfig) -> Result<TileCache> {
    TileCache::new(
        config.cache_dir.clone(),
        config.cache_ttl(),
        config.cache_max_bytes,
    )
}

pub async fn handle_cache_stats(config: &DetectionConfig) -> Result<()> {
    let cache = open_cache(config)?;
    let stats = cache.stats();
    println!("entries:        {}", stats.entries);
    println!("total bytes:    {}", stats.total_bytes);
    println!("requests:       {}", stats.total_requests);
    println!("cache hits:     {}", stats.cache_hits);
    Ok(())
}

pub async fn handle_cache_cleanup(config: &DetectionConfig) -> Result<()> {
    let cache = open_cache(config)?;
    let reclaimed = cache.cleanup_expired()?;
    println!("reclaimed {reclaimed} bytes of expired entries");
    Ok(())
}

pub async fn handle_cache_clear(config: &DetectionConfig) -> Result<()> {
    let cache = open_cache(config)?;
    let removed = cache.clear()?;
    println!("removed {removed} cache entries");
    Ok(())
}
