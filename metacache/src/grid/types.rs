//! Plain data types for tiling grids.

use serde::Deserialize;
use thiserror::Error;

/// Measurement unit of a grid's coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Meters,
    Degrees,
    Feet,
}

/// Geographic extent as (minx, miny, maxx, maxy).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Extent {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl Extent {
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self {
            minx,
            miny,
            maxx,
            maxy,
        }
    }

    /// Width of the extent in source units.
    pub fn width(&self) -> f64 {
        self.maxx - self.minx
    }

    /// Height of the extent in source units.
    pub fn height(&self) -> f64 {
        self.maxy - self.miny
    }
}

/// One zoom level of a grid.
///
/// `max_x`/`max_y` are the number of tiles along each axis at this level,
/// derived from the grid extent and the level resolution. Valid tile
/// indices are `0..max_x` and `0..max_y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLevel {
    /// Resolution in source units per pixel.
    pub resolution: f64,
    pub max_x: i64,
    pub max_y: i64,
}

/// Valid tile index ranges for one zoom level of a [`GridLink`].
///
/// A tile is in range when `x` is in `[min_x, max_x)` and `y` is in
/// `[min_y, max_y)`.
///
/// [`GridLink`]: super::GridLink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLimits {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl TileLimits {
    /// Whether the given tile index pair falls inside the limits.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }
}

/// Errors from grid coordinate resolution.
#[derive(Debug, Error)]
pub enum GridError {
    /// No configured level matches the requested resolution.
    #[error("resolution {0} does not match any level of grid {1}")]
    WrongResolution(f64, String),

    /// A bounding box does not align with the grid within one pixel.
    #[error("bbox not aligned with grid {0}")]
    NotAligned(String),

    /// Zoom level outside the configured level list.
    #[error("invalid zoom level {level} for grid {grid} ({nlevels} levels)")]
    InvalidLevel {
        grid: String,
        level: usize,
        nlevels: usize,
    },
}
