//! Tiling grid definitions and coordinate math.
//!
//! A [`Grid`] is a named tiling coordinate system: a geographic extent, a
//! tile pixel size, and an ordered list of zoom levels with fixed
//! resolutions. All conversions between geographic coordinates and discrete
//! tile indices live here and are pure functions of the grid definition.
//!
//! Tile indices increase from the bottom-left corner of the grid extent
//! (row 0 is the southernmost row). Index arithmetic applies a small
//! epsilon before floor/ceil so that extents landing exactly on a tile
//! boundary are assigned deterministically to one side.

mod presets;
mod types;

pub use presets::{google_maps_compatible, wgs84};
pub use types::{Extent, GridError, GridLevel, TileLimits, Unit};

use std::sync::Arc;

/// Epsilon applied to index arithmetic, in fractional-tile units.
const EPSILON: f64 = 1e-7;

/// A named tiling coordinate system, immutable once constructed.
#[derive(Debug, Clone)]
pub struct Grid {
    name: String,
    extent: Extent,
    unit: Unit,
    tile_width: u32,
    tile_height: u32,
    levels: Vec<GridLevel>,
}

impl Grid {
    /// Build a grid from a list of per-level resolutions.
    ///
    /// The tile counts of each level are derived from the extent and the
    /// level resolution; they are never supplied by configuration.
    pub fn new(
        name: impl Into<String>,
        extent: Extent,
        unit: Unit,
        tile_width: u32,
        tile_height: u32,
        resolutions: &[f64],
    ) -> Self {
        let levels = resolutions
            .iter()
            .map(|&resolution| GridLevel {
                resolution,
                max_x: ((extent.width() / (resolution * tile_width as f64)) - EPSILON).ceil()
                    as i64,
                max_y: ((extent.height() / (resolution * tile_height as f64)) - EPSILON).ceil()
                    as i64,
            })
            .collect();
        Self {
            name: name.into(),
            extent,
            unit,
            tile_width,
            tile_height,
            levels,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn nlevels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, z: usize) -> Result<&GridLevel, GridError> {
        self.levels.get(z).ok_or_else(|| GridError::InvalidLevel {
            grid: self.name.clone(),
            level: z,
            nlevels: self.levels.len(),
        })
    }

    /// Geographic extent covered by the tile at `(x, y, z)`.
    ///
    /// Pure arithmetic from the grid origin; the indices are not range
    /// checked here.
    pub fn tile_extent(&self, x: i64, y: i64, z: usize) -> Result<Extent, GridError> {
        let level = self.level(z)?;
        let tile_w = level.resolution * self.tile_width as f64;
        let tile_h = level.resolution * self.tile_height as f64;
        let minx = self.extent.minx + tile_w * x as f64;
        let miny = self.extent.miny + tile_h * y as f64;
        Ok(Extent::new(minx, miny, minx + tile_w, miny + tile_h))
    }

    /// Find the level configured for `resolution`.
    ///
    /// A level matches when its resolution differs from the input by less
    /// than one pixel's worth (`resolution / max(tile_width, tile_height)`).
    /// On a match the configured exact resolution is returned alongside the
    /// level, so callers can snap their derived value and stop accumulating
    /// float drift.
    pub fn resolve_level(&self, resolution: f64) -> Option<(usize, f64)> {
        let max_px = self.tile_width.max(self.tile_height) as f64;
        let tolerance = resolution / max_px;
        self.levels
            .iter()
            .position(|level| (level.resolution - resolution).abs() < tolerance)
            .map(|z| (z, self.levels[z].resolution))
    }

    /// Level with the smallest absolute resolution difference.
    ///
    /// Never fails; used by best-effort rendering paths that accept
    /// resampling.
    pub fn closest_level(&self, resolution: f64) -> usize {
        let mut best = 0;
        let mut best_diff = f64::INFINITY;
        for (z, level) in self.levels.iter().enumerate() {
            let diff = (level.resolution - resolution).abs();
            if diff < best_diff {
                best_diff = diff;
                best = z;
            }
        }
        best
    }

    /// Recover `(x, y, z)` from a tile-aligned bounding box.
    ///
    /// Fails when the implied resolution matches no level, or when the
    /// recovered indices do not reproduce the input bbox within one pixel.
    pub fn cell_of(&self, bbox: &Extent) -> Result<(i64, i64, usize), GridError> {
        let resolution = resolution_for(bbox, self.tile_width, self.tile_height);
        let (z, exact) = self
            .resolve_level(resolution)
            .ok_or_else(|| GridError::WrongResolution(resolution, self.name.clone()))?;
        let tile_w = exact * self.tile_width as f64;
        let tile_h = exact * self.tile_height as f64;
        let x = ((bbox.minx - self.extent.minx) / tile_w).round() as i64;
        let y = ((bbox.miny - self.extent.miny) / tile_h).round() as i64;

        // verify the recovered indices reproduce the request within one pixel
        let recovered = self.tile_extent(x, y, z)?;
        if (recovered.minx - bbox.minx).abs() > exact || (recovered.miny - bbox.miny).abs() > exact
        {
            return Err(GridError::NotAligned(self.name.clone()));
        }
        Ok((x, y, z))
    }

    /// Per-level tile index limits for the portion of the grid covered by
    /// `extent`, expanded by `tolerance` tiles and clamped to the level
    /// bounds.
    pub fn compute_limits(&self, extent: &Extent, tolerance: i64) -> Vec<TileLimits> {
        self.levels
            .iter()
            .map(|level| {
                let tile_w = level.resolution * self.tile_width as f64;
                let tile_h = level.resolution * self.tile_height as f64;
                let min_x =
                    ((extent.minx - self.extent.minx) / tile_w + EPSILON).floor() as i64 - tolerance;
                let min_y =
                    ((extent.miny - self.extent.miny) / tile_h + EPSILON).floor() as i64 - tolerance;
                let max_x =
                    ((extent.maxx - self.extent.minx) / tile_w - EPSILON).ceil() as i64 + tolerance;
                let max_y =
                    ((extent.maxy - self.extent.miny) / tile_h - EPSILON).ceil() as i64 + tolerance;
                TileLimits {
                    min_x: min_x.clamp(0, level.max_x),
                    min_y: min_y.clamp(0, level.max_y),
                    max_x: max_x.clamp(0, level.max_x),
                    max_y: max_y.clamp(0, level.max_y),
                }
            })
            .collect()
    }
}

/// A grid bound to one tileset: the shared grid definition plus an optional
/// restricted extent and the precomputed per-level index limits.
///
/// Built once at configuration time and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct GridLink {
    grid: Arc<Grid>,
    restricted_extent: Option<Extent>,
    limits: Vec<TileLimits>,
}

impl GridLink {
    pub fn new(grid: Arc<Grid>, restricted_extent: Option<Extent>, tolerance: i64) -> Self {
        let extent = restricted_extent.unwrap_or_else(|| grid.extent());
        let limits = grid.compute_limits(&extent, tolerance);
        Self {
            grid,
            restricted_extent,
            limits,
        }
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    pub fn restricted_extent(&self) -> Option<Extent> {
        self.restricted_extent
    }

    pub fn limits(&self, z: usize) -> Option<&TileLimits> {
        self.limits.get(z)
    }
}

/// Resolution implied by rendering `bbox` onto a `width`x`height` raster:
/// the coarser of the horizontal and vertical resolutions.
pub fn resolution_for(bbox: &Extent, width: u32, height: u32) -> f64 {
    let hres = bbox.width() / width as f64;
    let vres = bbox.height() / height as f64;
    hres.max(vres)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_grid() -> Grid {
        // 2 levels over a 1024x1024 extent with 256px tiles:
        // level 0 at res 2 (2x2 tiles), level 1 at res 1 (4x4 tiles)
        Grid::new(
            "test",
            Extent::new(0.0, 0.0, 1024.0, 1024.0),
            Unit::Meters,
            256,
            256,
            &[2.0, 1.0],
        )
    }

    #[test]
    fn test_level_tile_counts_derived() {
        let grid = test_grid();
        assert_eq!(grid.levels()[0].max_x, 2);
        assert_eq!(grid.levels()[0].max_y, 2);
        assert_eq!(grid.levels()[1].max_x, 4);
        assert_eq!(grid.levels()[1].max_y, 4);
    }

    #[test]
    fn test_tile_extent_origin() {
        let grid = test_grid();
        let e = grid.tile_extent(0, 0, 0).unwrap();
        assert_eq!(e, Extent::new(0.0, 0.0, 512.0, 512.0));
    }

    #[test]
    fn test_tile_extent_offset() {
        let grid = test_grid();
        let e = grid.tile_extent(2, 3, 1).unwrap();
        assert_eq!(e, Extent::new(512.0, 768.0, 768.0, 1024.0));
    }

    #[test]
    fn test_resolve_level_exact() {
        let grid = test_grid();
        assert_eq!(grid.resolve_level(2.0), Some((0, 2.0)));
        assert_eq!(grid.resolve_level(1.0), Some((1, 1.0)));
    }

    #[test]
    fn test_resolve_level_snaps_near_match() {
        // Scenario: resolutions [2,1], tile size 256; a resolution of
        // 1.0000001 resolves to level 1 with the exact configured value.
        let grid = test_grid();
        let (z, exact) = grid.resolve_level(1.0000001).unwrap();
        assert_eq!(z, 1);
        assert_eq!(exact, 1.0);
    }

    #[test]
    fn test_resolve_level_rejects_unconfigured() {
        let grid = test_grid();
        assert!(grid.resolve_level(3.0).is_none());
        assert!(grid.resolve_level(0.5).is_none());
    }

    #[test]
    fn test_closest_level_never_fails() {
        let grid = test_grid();
        assert_eq!(grid.closest_level(100.0), 0);
        assert_eq!(grid.closest_level(1.9), 0);
        assert_eq!(grid.closest_level(1.2), 1);
        assert_eq!(grid.closest_level(0.001), 1);
    }

    #[test]
    fn test_cell_of_roundtrip() {
        let grid = test_grid();
        let bbox = grid.tile_extent(3, 1, 1).unwrap();
        let (x, y, z) = grid.cell_of(&bbox).unwrap();
        assert_eq!((x, y, z), (3, 1, 1));
    }

    #[test]
    fn test_cell_of_rejects_misaligned_bbox() {
        let grid = test_grid();
        let bbox = Extent::new(10.0, 10.0, 266.0, 266.0);
        assert!(matches!(
            grid.cell_of(&bbox),
            Err(GridError::NotAligned(_))
        ));
    }

    #[test]
    fn test_cell_of_rejects_wrong_resolution() {
        let grid = test_grid();
        let bbox = Extent::new(0.0, 0.0, 100.0, 100.0);
        assert!(matches!(
            grid.cell_of(&bbox),
            Err(GridError::WrongResolution(_, _))
        ));
    }

    #[test]
    fn test_compute_limits_full_extent() {
        let grid = test_grid();
        let limits = grid.compute_limits(&grid.extent(), 0);
        assert_eq!(
            limits[1],
            TileLimits {
                min_x: 0,
                min_y: 0,
                max_x: 4,
                max_y: 4
            }
        );
    }

    #[test]
    fn test_compute_limits_restricted_extent() {
        let grid = test_grid();
        let limits = grid.compute_limits(&Extent::new(256.0, 0.0, 768.0, 512.0), 0);
        assert_eq!(
            limits[1],
            TileLimits {
                min_x: 1,
                min_y: 0,
                max_x: 3,
                max_y: 2
            }
        );
    }

    #[test]
    fn test_compute_limits_tolerance_clamped() {
        let grid = test_grid();
        let limits = grid.compute_limits(&Extent::new(256.0, 256.0, 512.0, 512.0), 5);
        // tolerance of 5 tiles expands past the grid edge and is clamped
        assert_eq!(
            limits[1],
            TileLimits {
                min_x: 0,
                min_y: 0,
                max_x: 4,
                max_y: 4
            }
        );
    }

    #[test]
    fn test_compute_limits_boundary_epsilon() {
        // an extent landing exactly on a tile boundary must not bleed into
        // the neighboring tile
        let grid = test_grid();
        let limits = grid.compute_limits(&Extent::new(0.0, 0.0, 256.0, 256.0), 0);
        assert_eq!(limits[1].max_x, 1);
        assert_eq!(limits[1].max_y, 1);
    }

    #[test]
    fn test_resolution_for_takes_coarser_axis() {
        let bbox = Extent::new(0.0, 0.0, 512.0, 256.0);
        assert_eq!(resolution_for(&bbox, 256, 256), 2.0);
    }

    #[test]
    fn test_grid_link_limits() {
        let grid = Arc::new(test_grid());
        let link = GridLink::new(
            Arc::clone(&grid),
            Some(Extent::new(0.0, 0.0, 512.0, 512.0)),
            0,
        );
        let limits = link.limits(1).unwrap();
        assert!(limits.contains(1, 1));
        assert!(!limits.contains(2, 2));
    }

    #[test]
    fn test_grid_link_defaults_to_grid_extent() {
        let grid = Arc::new(test_grid());
        let link = GridLink::new(Arc::clone(&grid), None, 0);
        assert!(link.limits(1).unwrap().contains(3, 3));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_cell_of_inverts_tile_extent(
                x in 0i64..4,
                y in 0i64..4,
                z in 0usize..2
            ) {
                let grid = test_grid();
                let max = grid.levels()[z].max_x;
                let (x, y) = (x % max, y % max);
                let bbox = grid.tile_extent(x, y, z).unwrap();
                prop_assert_eq!(grid.cell_of(&bbox).unwrap(), (x, y, z));
            }

            #[test]
            fn test_resolve_then_extent_reproduces_bbox(
                x in 0i64..4,
                y in 0i64..4,
                jitter in -1e-9f64..1e-9
            ) {
                // a slightly perturbed resolution still resolves and the
                // recovered extent stays within one pixel of the request
                let grid = test_grid();
                let (x, y) = (x % 4, y % 4);
                let bbox = grid.tile_extent(x, y, 1).unwrap();
                let res = resolution_for(&bbox, 256, 256) + jitter;
                let (z, exact) = grid.resolve_level(res).unwrap();
                prop_assert_eq!(z, 1);
                let recovered = grid.tile_extent(x, y, z).unwrap();
                prop_assert!((recovered.minx - bbox.minx).abs() < exact);
                prop_assert!((recovered.miny - bbox.miny).abs() < exact);
            }

            #[test]
            fn test_limits_always_within_level_bounds(
                minx in 0.0f64..512.0,
                miny in 0.0f64..512.0,
                w in 1.0f64..512.0,
                h in 1.0f64..512.0,
                tolerance in 0i64..3
            ) {
                let grid = test_grid();
                let extent = Extent::new(minx, miny, minx + w, miny + h);
                for (z, limits) in grid.compute_limits(&extent, tolerance).iter().enumerate() {
                    let level = &grid.levels()[z];
                    prop_assert!(limits.min_x >= 0);
                    prop_assert!(limits.min_y >= 0);
                    prop_assert!(limits.max_x <= level.max_x);
                    prop_assert!(limits.max_y <= level.max_y);
                    prop_assert!(limits.min_x <= limits.max_x);
                    prop_assert!(limits.min_y <= limits.max_y);
                }
            }
        }
    }
}
