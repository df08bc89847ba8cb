//! In-process memory cache backed by `moka`.
//!
//! Moka uses lock-free data structures internally, so the cache is safe to
//! hit from many Tokio tasks without starving the runtime. Capacity is
//! counted in bytes of encoded tile data via a weigher, with optional
//! time-to-live eviction on top.

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use moka::future::Cache;
use tracing::trace;

use super::{flat_key, BoxFuture, CacheBackend, CacheError, CachedTile, TileData};
use crate::tileset::Tile;

#[derive(Clone)]
struct Entry {
    data: Bytes,
    mtime: SystemTime,
}

/// Volatile tile cache for low-latency tiers and tests.
pub struct MemoryCache {
    cache: Cache<String, Entry>,
}

impl MemoryCache {
    /// Create a cache holding at most `max_bytes` of encoded tile data.
    ///
    /// With a `ttl`, entries expire that long after insertion regardless
    /// of capacity pressure.
    pub fn new(max_bytes: u64, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, entry: &Entry| {
                // moka weights are u32; cap oversized entries
                (key.len() + entry.data.len()).min(u32::MAX as usize) as u32
            });
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
        }
    }

    /// Number of resident entries. Approximate until pending maintenance
    /// runs.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl CacheBackend for MemoryCache {
    fn exists<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move { Ok(self.cache.contains_key(&flat_key(tile))) })
    }

    fn get<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<Option<CachedTile>, CacheError>> {
        Box::pin(async move {
            let key = flat_key(tile);
            match self.cache.get(&key).await {
                Some(entry) => {
                    trace!(key, "memory cache hit");
                    Ok(Some(CachedTile {
                        data: entry.data,
                        mtime: entry.mtime,
                    }))
                }
                None => Ok(None),
            }
        })
    }

    fn set<'a>(
        &'a self,
        tile: &'a Tile,
        data: &'a TileData,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let encoded = data.to_encoded(tile.tileset().format())?;
            let entry = Entry {
                data: encoded,
                mtime: SystemTime::now(),
            };
            self.cache.insert(flat_key(tile), entry).await;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.cache.invalidate(&flat_key(tile)).await;
            Ok(())
        })
    }
}
