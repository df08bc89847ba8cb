//! Storage backends for encoded tiles.
//!
//! The [`CacheBackend`] trait is the seam between the metatile coordinator
//! and storage technology. Backends store encoded bytes plus a modification
//! time under a key derived deterministically from the tile identity; a
//! lookup for absent data is a miss (`Ok(None)`), never an error.
//!
//! # Dyn compatibility
//!
//! Async methods use `Pin<Box<dyn Future>>` so backends can be held as
//! `Arc<dyn CacheBackend>` behind configuration.

mod disk;
mod key;
mod memory;
mod pool;
mod remote;

pub use disk::{DiskCache, DiskCacheConfig};
pub use key::{flat_key, hashed_path_segments, sanitize, KeyTemplate, KeyTemplateError};
pub use memory::MemoryCache;
pub use pool::{Pool, PoolGuard, ResourceFactory};
pub use remote::{RemoteCache, RemoteCacheConfig};

use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use image::RgbaImage;
use thiserror::Error;

use crate::raster::{ImageFormat, RasterError};
use crate::tileset::Tile;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from cache storage operations.
///
/// A miss is not represented here; `get` returns `Ok(None)` for absent
/// tiles and `delete` treats "not found" as success.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O failure talking to the storage medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes were persisted than the tile contains.
    #[error("short write to {path}: wrote {written} of {expected} bytes")]
    ShortWrite {
        path: String,
        written: usize,
        expected: usize,
    },

    /// Backend-specific protocol or state error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Timed out establishing a backend connection.
    #[error("connection to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),

    #[error(transparent)]
    KeyTemplate(#[from] KeyTemplateError),
}

/// A tile's stored representation: encoded bytes and the backend's
/// modification time for it.
#[derive(Debug, Clone)]
pub struct CachedTile {
    pub data: Bytes,
    pub mtime: SystemTime,
}

/// Payload handed to [`CacheBackend::set`].
///
/// The metatile split produces raw images; a merge re-encode or a seeding
/// pass may already hold encoded bytes. Backends encode lazily so the
/// blank-tile check on the disk backend can look at raw pixels without a
/// decode round trip.
#[derive(Debug, Clone)]
pub enum TileData {
    Encoded(Bytes),
    Raw(RgbaImage),
}

impl TileData {
    /// Encoded bytes, encoding raw pixels with `format` if necessary.
    pub fn to_encoded(&self, format: &ImageFormat) -> Result<Bytes, CacheError> {
        match self {
            TileData::Encoded(bytes) => Ok(bytes.clone()),
            TileData::Raw(raw) => Ok(format.encode(raw)?),
        }
    }

    /// The raw image, if this payload carries one.
    pub fn raw(&self) -> Option<&RgbaImage> {
        match self {
            TileData::Raw(raw) => Some(raw),
            TileData::Encoded(_) => None,
        }
    }
}

/// A pluggable tile storage technology.
///
/// Implementations must be `Send + Sync`; one backend instance is shared
/// by every concurrent request for the tilesets configured to use it. Key
/// derivation is backend-specific but must be deterministic and
/// collision-free across tilesets, grids, dimensions, zoom, x and y.
pub trait CacheBackend: Send + Sync {
    /// Check for the tile without retrieving its data.
    fn exists<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Retrieve the tile's encoded data and modification time.
    ///
    /// Returns `Ok(None)` when the tile is not cached; that is the normal
    /// route into the generation path, not a failure.
    fn get<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<Option<CachedTile>, CacheError>>;

    /// Persist the tile, stamping the current time as modification time.
    fn set<'a>(
        &'a self,
        tile: &'a Tile,
        data: &'a TileData,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Remove the tile. Deleting an absent tile is a no-op success.
    fn delete<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<(), CacheError>>;
}
