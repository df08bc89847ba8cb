//! Top-level error type for the tile cache core.
//!
//! Each module has its own `thiserror` enum; this type is what the request
//! entry points return. Every variant carries enough context for the
//! protocol layer to render a structured error (status code + message) —
//! whether that becomes a plain message, a blank image or a rendered error
//! image is the protocol layer's decision, not ours.
//!
//! A cache miss is never an error: backends report misses as values and the
//! coordinator routes them to the generation path.

use thiserror::Error;

use crate::cache::CacheError;
use crate::grid::GridError;
use crate::lock::LockError;
use crate::raster::RasterError;
use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum Error {
    /// Tile indices outside the grid link's limits for that level.
    #[error("tile {x},{y} not in [{min_x},{max_x})x[{min_y},{max_y}) at level {z}")]
    TileOutOfRange {
        x: i64,
        y: i64,
        z: usize,
        min_x: i64,
        min_y: i64,
        max_x: i64,
        max_y: i64,
    },

    #[error(transparent)]
    Grid(#[from] GridError),

    /// Malformed or incomplete configuration, detected at startup or first
    /// use. Fatal to the affected tileset, not to the process.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The upstream source failed to render.
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    /// A generation path was reached for a tileset with no source.
    #[error("tile not in cache, and no source configured for tileset {0}")]
    NoSource(String),

    /// Another process held the generation lock but never produced the
    /// tile we were waiting for.
    #[error("tileset {0}: another process failed to create the tile we were waiting for")]
    WaitedInVain(String),

    /// Invariant violation; surfaced, never silently ignored.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP-ish status code the protocol layer should report.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::TileOutOfRange { .. } | Error::Grid(_) | Error::NoSource(_) => 404,
            Error::Config(_) => 400,
            Error::Source(_) => 502,
            Error::Cache(_)
            | Error::Lock(_)
            | Error::Raster(_)
            | Error::WaitedInVain(_)
            | Error::Internal(_) => 500,
        }
    }
}
