//! Tilesets and the tiles/metatiles they produce.
//!
//! A [`Tileset`] binds an upstream [`Source`] to a [`CacheBackend`] over
//! one or more grids, with metatiling parameters and expiry policy. The
//! generation flow (cache check, cross-process lock, render, split, store)
//! lives in the `fetch` submodule.

mod fetch;

use std::collections::BTreeMap;
use std::sync::Arc;

use image::RgbaImage;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::{CacheBackend, CachedTile};
use crate::error::Error;
use crate::grid::{Extent, Grid, GridLink};
use crate::raster::{self, ImageFormat};
use crate::source::Source;

/// Default Expires delay handed to clients, in seconds.
const DEFAULT_EXPIRES: u32 = 300;

/// A named dimension (e.g. TIME) participating in cache keys.
#[derive(Debug, Clone)]
pub struct Dimension {
    pub name: String,
    pub default_value: String,
}

/// A set of tiles clients can request, rendered from a source and stored
/// in a cache. Immutable after configuration; shared via `Arc`.
pub struct Tileset {
    name: String,
    source: Option<Arc<dyn Source>>,
    cache: Arc<dyn CacheBackend>,
    format: ImageFormat,
    grid_links: Vec<Arc<GridLink>>,
    metasize_x: u32,
    metasize_y: u32,
    metabuffer: u32,
    expires: u32,
    auto_expire: Option<u32>,
    dimensions: Vec<Dimension>,
}

impl std::fmt::Debug for Tileset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tileset")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("metasize", &(self.metasize_x, self.metasize_y))
            .field("metabuffer", &self.metabuffer)
            .finish_non_exhaustive()
    }
}

/// Builder-style constructor parameters for [`Tileset`].
pub struct TilesetBuilder {
    name: String,
    source: Option<Arc<dyn Source>>,
    cache: Arc<dyn CacheBackend>,
    format: ImageFormat,
    grid_links: Vec<Arc<GridLink>>,
    metasize_x: u32,
    metasize_y: u32,
    metabuffer: u32,
    expires: u32,
    auto_expire: Option<u32>,
    dimensions: Vec<Dimension>,
}

impl TilesetBuilder {
    pub fn new(name: impl Into<String>, cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            name: name.into(),
            source: None,
            cache,
            format: ImageFormat::default(),
            grid_links: Vec::new(),
            metasize_x: 1,
            metasize_y: 1,
            metabuffer: 0,
            expires: DEFAULT_EXPIRES,
            auto_expire: None,
            dimensions: Vec::new(),
        }
    }

    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn grid_link(mut self, link: Arc<GridLink>) -> Self {
        self.grid_links.push(link);
        self
    }

    pub fn metatiling(mut self, metasize_x: u32, metasize_y: u32, metabuffer: u32) -> Self {
        self.metasize_x = metasize_x;
        self.metasize_y = metasize_y;
        self.metabuffer = metabuffer;
        self
    }

    pub fn expires(mut self, expires: u32) -> Self {
        self.expires = expires;
        self
    }

    pub fn auto_expire(mut self, auto_expire: u32) -> Self {
        self.auto_expire = Some(auto_expire);
        self
    }

    pub fn dimension(mut self, name: impl Into<String>, default_value: impl Into<String>) -> Self {
        self.dimensions.push(Dimension {
            name: name.into(),
            default_value: default_value.into(),
        });
        self
    }

    /// Validate and freeze the tileset.
    pub fn build(self) -> Result<Arc<Tileset>, Error> {
        if self.grid_links.is_empty() {
            return Err(Error::Config(format!(
                "tileset \"{}\" has no grids configured",
                self.name
            )));
        }
        if self.metasize_x < 1 || self.metasize_y < 1 {
            return Err(Error::Config(format!(
                "tileset \"{}\" has invalid metasize {},{}",
                self.name, self.metasize_x, self.metasize_y
            )));
        }
        Ok(Arc::new(Tileset {
            name: self.name,
            source: self.source,
            cache: self.cache,
            format: self.format,
            grid_links: self.grid_links,
            metasize_x: self.metasize_x,
            metasize_y: self.metasize_y,
            metabuffer: self.metabuffer,
            expires: self.expires,
            auto_expire: self.auto_expire,
            dimensions: self.dimensions,
        }))
    }
}

impl Tileset {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<&Arc<dyn Source>> {
        self.source.as_ref()
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    pub fn format(&self) -> &ImageFormat {
        &self.format
    }

    pub fn grid_links(&self) -> &[Arc<GridLink>] {
        &self.grid_links
    }

    /// The grid link for the named grid, if this tileset caches on it.
    pub fn grid_link(&self, grid_name: &str) -> Option<&Arc<GridLink>> {
        self.grid_links
            .iter()
            .find(|l| l.grid().name() == grid_name)
    }

    pub fn metasize(&self) -> (u32, u32) {
        (self.metasize_x, self.metasize_y)
    }

    pub fn metabuffer(&self) -> u32 {
        self.metabuffer
    }

    pub fn expires(&self) -> u32 {
        self.expires
    }

    pub fn auto_expire(&self) -> Option<u32> {
        self.auto_expire
    }

    /// Create a tile for this tileset with dimension defaults applied.
    pub fn tile(
        self: &Arc<Self>,
        grid_link: Arc<GridLink>,
        x: i64,
        y: i64,
        z: usize,
    ) -> Tile {
        let dimensions = self
            .dimensions
            .iter()
            .map(|d| (d.name.clone(), d.default_value.clone()))
            .collect();
        Tile {
            tileset: Arc::clone(self),
            grid_link,
            x,
            y,
            z,
            dimensions,
            stored: None,
            expires: self.auto_expire.unwrap_or(self.expires),
        }
    }

    /// Delete a tile from the cache, optionally with every sibling of its
    /// metatile. Absent siblings are skipped silently.
    pub async fn delete_tile(&self, tile: &Tile, whole_metatile: bool) -> Result<(), Error> {
        self.cache.delete(tile).await?;
        if whole_metatile {
            let mt = Metatile::containing(tile);
            for sibling in &mt.tiles {
                if sibling.x == tile.x && sibling.y == tile.y {
                    continue;
                }
                self.cache.delete(sibling).await?;
            }
        }
        Ok(())
    }
}

/// One cached, individually addressable image unit. Request-scoped.
#[derive(Debug, Clone)]
pub struct Tile {
    tileset: Arc<Tileset>,
    grid_link: Arc<GridLink>,
    pub x: i64,
    pub y: i64,
    pub z: usize,
    pub dimensions: BTreeMap<String, String>,
    /// Populated by a cache hit or after generation.
    pub stored: Option<CachedTile>,
    /// Seconds the client may cache this tile.
    pub expires: u32,
}

impl Tile {
    pub fn tileset(&self) -> &Arc<Tileset> {
        &self.tileset
    }

    pub fn grid_link(&self) -> &Arc<GridLink> {
        &self.grid_link
    }

    pub fn grid(&self) -> &Arc<Grid> {
        self.grid_link.grid()
    }

    /// File extension for this tile's encoded format.
    pub fn extension(&self) -> &'static str {
        self.tileset.format().extension()
    }

    /// Reject tiles outside the grid link's limits for their level.
    pub fn validate(&self) -> Result<(), Error> {
        let nlevels = self.grid().nlevels();
        let limits = self.grid_link.limits(self.z).ok_or_else(|| {
            Error::Grid(crate::grid::GridError::InvalidLevel {
                grid: self.grid().name().to_string(),
                level: self.z,
                nlevels,
            })
        })?;
        if !limits.contains(self.x, self.y) {
            return Err(Error::TileOutOfRange {
                x: self.x,
                y: self.y,
                z: self.z,
                min_x: limits.min_x,
                min_y: limits.min_y,
                max_x: limits.max_x,
                max_y: limits.max_y,
            });
        }
        Ok(())
    }
}

/// A rectangular group of adjacent tiles rendered as one upstream request,
/// then split and cached individually.
#[derive(Debug, Clone)]
pub struct Metatile {
    /// Metatile indices (tile indices divided by the metatile size).
    pub x: i64,
    pub y: i64,
    pub z: usize,
    /// Actual size in tiles, clamped at the grid edge.
    pub size_x: u32,
    pub size_y: u32,
    /// Tile index of the bottom-left member.
    pub origin_x: i64,
    pub origin_y: i64,
    /// Geographic extent including the gutter.
    pub extent: Extent,
    /// Pixel size including the gutter.
    pub width: u32,
    pub height: u32,
    pub tiles: Vec<Tile>,
}

impl Metatile {
    /// Compute the metatile that contains `tile`.
    ///
    /// The size is clamped so the metatile never extends past the grid
    /// level bounds; rendering past the edge would waste upstream work and
    /// produce cut labels on edge tiles.
    pub fn containing(tile: &Tile) -> Metatile {
        let tileset = tile.tileset();
        let grid = tile.grid();
        let (meta_x, meta_y) = tileset.metasize();
        let buffer = tileset.metabuffer();
        let level = &grid.levels()[tile.z];
        let res = level.resolution;

        let mx = tile.x.div_euclid(meta_x as i64);
        let my = tile.y.div_euclid(meta_y as i64);
        let origin_x = mx * meta_x as i64;
        let origin_y = my * meta_y as i64;

        let size_x = if origin_x + meta_x as i64 - 1 >= level.max_x {
            (level.max_x - origin_x) as u32
        } else {
            meta_x
        };
        let size_y = if origin_y + meta_y as i64 - 1 >= level.max_y {
            (level.max_y - origin_y) as u32
        } else {
            meta_y
        };

        let tile_w = grid.tile_width() as f64;
        let tile_h = grid.tile_height() as f64;
        let gbuffer = res * buffer as f64;
        let gwidth = res * size_x as f64 * tile_w;
        let gheight = res * size_y as f64 * tile_h;
        // position with the configured size so partially clamped metatiles
        // stay anchored to the full-size lattice
        let full_gwidth = res * meta_x as f64 * tile_w;
        let full_gheight = res * meta_y as f64 * tile_h;
        let minx = grid.extent().minx + mx as f64 * full_gwidth - gbuffer;
        let miny = grid.extent().miny + my as f64 * full_gheight - gbuffer;
        let extent = Extent::new(minx, miny, minx + gwidth + 2.0 * gbuffer, miny + gheight + 2.0 * gbuffer);

        let mut tiles = Vec::with_capacity((size_x * size_y) as usize);
        for i in 0..size_x as i64 {
            for j in 0..size_y as i64 {
                let mut t = tileset.tile(
                    Arc::clone(tile.grid_link()),
                    origin_x + i,
                    origin_y + j,
                    tile.z,
                );
                t.dimensions = tile.dimensions.clone();
                tiles.push(t);
            }
        }
        debug!(
            tileset = tileset.name(),
            z = tile.z,
            mx,
            my,
            size_x,
            size_y,
            "computed metatile"
        );

        Metatile {
            x: mx,
            y: my,
            z: tile.z,
            size_x,
            size_y,
            origin_x,
            origin_y,
            extent,
            width: size_x * grid.tile_width() + 2 * buffer,
            height: size_y * grid.tile_height() + 2 * buffer,
            tiles,
        }
    }

    pub fn ntiles(&self) -> usize {
        self.tiles.len()
    }

    /// Name of the mutual-exclusion resource guarding this metatile's
    /// generation.
    ///
    /// A pure function of the metatile identity: concurrent requests for
    /// any tile of the same metatile derive the same name. Dimension
    /// values are folded in as a digest to keep the name filesystem-safe
    /// and bounded.
    pub fn lock_resource_name(&self) -> String {
        let tile = &self.tiles[0];
        let mut name = format!(
            "{}-{}-{}-{}-{}",
            tile.tileset().name(),
            tile.grid().name(),
            self.z,
            self.x,
            self.y,
        );
        if !tile.dimensions.is_empty() {
            let mut hasher = Sha256::new();
            for (k, v) in &tile.dimensions {
                hasher.update(k.as_bytes());
                hasher.update([0u8]);
                hasher.update(v.as_bytes());
                hasher.update([0u8]);
            }
            let digest = hasher.finalize();
            name.push('-');
            for byte in &digest[..8] {
                name.push_str(&format!("{byte:02x}"));
            }
        }
        name
    }

    /// Partition the rendered metatile image into per-tile sub-images, in
    /// the same order as [`Metatile::tiles`].
    ///
    /// The rendered image's top-left pixel is the metatile extent's
    /// top-left corner; tile y indices grow northwards, so tile row `j`
    /// counts up from the bottom of the image.
    pub fn split(&self, raw: &RgbaImage) -> Vec<RgbaImage> {
        let tile = &self.tiles[0];
        let tile_w = tile.grid().tile_width();
        let tile_h = tile.grid().tile_height();
        let buffer = tile.tileset().metabuffer();
        let mut out = Vec::with_capacity(self.ntiles());
        for i in 0..self.size_x {
            for j in 0..self.size_y {
                let px = buffer + i * tile_w;
                let py = buffer + (self.size_y - 1 - j) * tile_h;
                out.push(raster::crop(raw, px, py, tile_w, tile_h));
            }
        }
        out
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use image::Rgba;

    #[test]
    fn test_tile_constructor_applies_defaults() {
        let (tileset, link) = test_tileset(1);
        let tile = tileset.tile(link, 1, 2, 3);
        assert_eq!((tile.x, tile.y, tile.z), (1, 2, 3));
        assert_eq!(tile.expires, DEFAULT_EXPIRES);
        assert!(tile.stored.is_none());
    }

    #[test]
    fn test_validate_accepts_in_range() {
        let (tileset, link) = test_tileset(1);
        // level 3: res 0.5, 8x8 tiles
        assert!(tileset.tile(Arc::clone(&link), 7, 7, 3).validate().is_ok());
        assert!(tileset.tile(link, 0, 0, 0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_boundary_index() {
        // an index exactly equal to the level max is out of range;
        // one less is accepted
        let (tileset, link) = test_tileset(1);
        let at_max = tileset.tile(Arc::clone(&link), 8, 0, 3);
        assert!(matches!(
            at_max.validate(),
            Err(Error::TileOutOfRange { .. })
        ));
        let below_max = tileset.tile(link, 7, 0, 3);
        assert!(below_max.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_level() {
        let (tileset, link) = test_tileset(1);
        let tile = tileset.tile(link, 0, 0, 9);
        assert!(tile.validate().is_err());
    }

    #[test]
    fn test_metatile_origin_and_size() {
        let (tileset, link) = test_tileset(2);
        // z=2: res 1.0, 4x4 tiles; tile (3,2) lives in metatile (1,1)
        let tile = tileset.tile(link, 3, 2, 2);
        let mt = Metatile::containing(&tile);
        assert_eq!((mt.x, mt.y), (1, 1));
        assert_eq!((mt.origin_x, mt.origin_y), (2, 2));
        assert_eq!((mt.size_x, mt.size_y), (2, 2));
        assert_eq!(mt.ntiles(), 4);
    }

    #[test]
    fn test_metatile_extent_no_buffer() {
        let (tileset, link) = test_tileset(2);
        let tile = tileset.tile(link, 3, 2, 2);
        let mt = Metatile::containing(&tile);
        // metatile (1,1) at res 1.0 with 512-unit metatile span
        assert_eq!(mt.extent, Extent::new(512.0, 512.0, 1024.0, 1024.0));
        assert_eq!((mt.width, mt.height), (512, 512));
    }

    #[test]
    fn test_metatile_clamped_at_grid_edge() {
        let grid = test_grid();
        let link = Arc::new(GridLink::new(Arc::clone(&grid), None, 0));
        let cache: Arc<dyn CacheBackend> =
            Arc::new(crate::cache::MemoryCache::new(1024 * 1024, None));
        let tileset = TilesetBuilder::new("t", cache)
            .grid_link(Arc::clone(&link))
            .metatiling(3, 3, 0)
            .build()
            .unwrap();
        // z=2 has 4x4 tiles; the metatile holding tile (3,3) only has room
        // for a 1x1 remainder
        let tile = tileset.tile(link, 3, 3, 2);
        let mt = Metatile::containing(&tile);
        assert_eq!((mt.origin_x, mt.origin_y), (3, 3));
        assert_eq!((mt.size_x, mt.size_y), (1, 1));
    }

    #[test]
    fn test_metatile_gutter_extends_extent() {
        let grid = test_grid();
        let link = Arc::new(GridLink::new(Arc::clone(&grid), None, 0));
        let cache: Arc<dyn CacheBackend> =
            Arc::new(crate::cache::MemoryCache::new(1024 * 1024, None));
        let tileset = TilesetBuilder::new("t", cache)
            .grid_link(Arc::clone(&link))
            .metatiling(2, 2, 10)
            .build()
            .unwrap();
        let tile = tileset.tile(link, 0, 0, 2);
        let mt = Metatile::containing(&tile);
        // res 1.0, 10px gutter = 10 units on each side
        assert_eq!(mt.extent, Extent::new(-10.0, -10.0, 522.0, 522.0));
        assert_eq!((mt.width, mt.height), (532, 532));
    }

    #[test]
    fn test_same_metatile_same_lock_name() {
        let (tileset, link) = test_tileset(2);
        let a = tileset.tile(Arc::clone(&link), 2, 2, 2);
        let b = tileset.tile(link, 3, 3, 2);
        assert_eq!(
            Metatile::containing(&a).lock_resource_name(),
            Metatile::containing(&b).lock_resource_name()
        );
    }

    #[test]
    fn test_different_metatile_different_lock_name() {
        let (tileset, link) = test_tileset(2);
        let a = tileset.tile(Arc::clone(&link), 0, 0, 2);
        let b = tileset.tile(link, 2, 2, 2);
        assert_ne!(
            Metatile::containing(&a).lock_resource_name(),
            Metatile::containing(&b).lock_resource_name()
        );
    }

    #[test]
    fn test_dimensions_change_lock_name() {
        let (tileset, link) = test_tileset(2);
        let plain = tileset.tile(Arc::clone(&link), 0, 0, 2);
        let mut dated = tileset.tile(link, 0, 0, 2);
        dated
            .dimensions
            .insert("TIME".to_string(), "2024-01-01".to_string());
        assert_ne!(
            Metatile::containing(&plain).lock_resource_name(),
            Metatile::containing(&dated).lock_resource_name()
        );
    }

    #[test]
    fn test_split_assigns_quadrants() {
        let (tileset, link) = test_tileset(2);
        let tile = tileset.tile(link, 0, 0, 2);
        let mt = Metatile::containing(&tile);

        // 512x512 image: distinct color per 256px quadrant
        let mut raw = RgbaImage::from_pixel(512, 512, Rgba([0, 0, 0, 255]));
        for y in 0..512 {
            for x in 0..512 {
                let quadrant = (x / 256 + 2 * (y / 256)) as u8;
                raw.put_pixel(x, y, Rgba([quadrant, 0, 0, 255]));
            }
        }
        let parts = mt.split(&raw);
        assert_eq!(parts.len(), 4);

        // tiles are ordered x-major: (0,0) (0,1) (1,0) (1,1);
        // tile (0,1) is the top-left quadrant of the image (y up)
        let idx = |x: i64, y: i64| {
            mt.tiles
                .iter()
                .position(|t| t.x == x && t.y == y)
                .unwrap()
        };
        assert_eq!(parts[idx(0, 1)].get_pixel(0, 0).0[0], 0);
        assert_eq!(parts[idx(1, 1)].get_pixel(0, 0).0[0], 1);
        assert_eq!(parts[idx(0, 0)].get_pixel(0, 0).0[0], 2);
        assert_eq!(parts[idx(1, 0)].get_pixel(0, 0).0[0], 3);
    }

    #[test]
    fn test_split_honors_gutter() {
        let grid = test_grid();
        let link = Arc::new(GridLink::new(Arc::clone(&grid), None, 0));
        let cache: Arc<dyn CacheBackend> =
            Arc::new(crate::cache::MemoryCache::new(1024 * 1024, None));
        let tileset = TilesetBuilder::new("t", cache)
            .grid_link(Arc::clone(&link))
            .metatiling(1, 1, 8)
            .build()
            .unwrap();
        let tile = tileset.tile(link, 0, 0, 2);
        let mt = Metatile::containing(&tile);
        assert_eq!((mt.width, mt.height), (272, 272));

        // mark the pixel the tile's top-left corner should land on
        let mut raw = RgbaImage::from_pixel(272, 272, Rgba([0, 0, 0, 255]));
        raw.put_pixel(8, 8, Rgba([42, 0, 0, 255]));
        let parts = mt.split(&raw);
        assert_eq!(parts[0].dimensions(), (256, 256));
        assert_eq!(parts[0].get_pixel(0, 0).0[0], 42);
    }

    #[test]
    fn test_builder_requires_grid() {
        let cache: Arc<dyn CacheBackend> =
            Arc::new(crate::cache::MemoryCache::new(1024, None));
        let result = TilesetBuilder::new("empty", cache).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_rejects_zero_metasize() {
        let grid = test_grid();
        let link = Arc::new(GridLink::new(grid, None, 0));
        let cache: Arc<dyn CacheBackend> =
            Arc::new(crate::cache::MemoryCache::new(1024, None));
        let result = TilesetBuilder::new("t", cache)
            .grid_link(link)
            .metatiling(0, 2, 0)
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
