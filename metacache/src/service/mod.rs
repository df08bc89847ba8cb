//! Request orchestration: tiles, assembled maps and feature queries.
//!
//! This layer sits between the protocol front-end and the tilesets. It
//! owns cross-tile concerns the tileset cannot see: prefetching groups of
//! tiles in parallel without rendering a metatile twice, merging layers,
//! assembling arbitrary-extent maps from cached tiles, and computing the
//! cache headers a response should carry.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use tracing::debug;

use crate::error::Error;
use crate::grid::{resolution_for, Extent, GridLink};
use crate::lock::LockManager;
use crate::raster::{self, SniffedFormat};
use crate::source::{InfoRequest, InfoResponse, MapRequest};
use crate::tileset::{Metatile, Tile, Tileset};

/// How `get_map` requests are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMapStrategy {
    /// Refuse them; only tile-addressed access is served.
    Error,
    /// Build the map from cached tiles, resampling where the requested
    /// resolution matches no grid level.
    Assemble(ResampleMode),
    /// Pass the request straight to the source, bypassing the cache.
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMode {
    Nearest,
    Bilinear,
}

/// One layer of a map or feature-info request.
#[derive(Debug, Clone)]
pub struct MapView {
    pub tileset: Arc<Tileset>,
    pub grid_link: Arc<GridLink>,
    pub extent: Extent,
    pub width: u32,
    pub height: u32,
    pub dimensions: BTreeMap<String, String>,
}

impl MapView {
    fn map_request(&self) -> MapRequest {
        MapRequest {
            extent: self.extent,
            width: self.width,
            height: self.height,
            params: self
                .dimensions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// A point query against a [`MapView`], in view pixel coordinates.
#[derive(Debug, Clone)]
pub struct FeatureInfoRequest {
    pub view: MapView,
    pub i: u32,
    pub j: u32,
    pub info_format: String,
}

/// Encoded response body plus the metadata cache headers are built from.
#[derive(Debug, Clone)]
pub struct TileResponse {
    pub data: Bytes,
    pub content_type: String,
    /// Newest modification time among the contributing tiles.
    pub mtime: SystemTime,
    /// Smallest expiry delay among the contributing tiles, in seconds.
    pub expires: u32,
}

impl TileResponse {
    pub fn last_modified(&self) -> String {
        http_date(self.mtime)
    }

    pub fn expires_at(&self) -> String {
        http_date(SystemTime::now() + Duration::from_secs(u64::from(self.expires)))
    }

    pub fn cache_control(&self) -> String {
        format!("max-age={}", self.expires)
    }
}

fn http_date(t: SystemTime) -> String {
    DateTime::<Utc>::from(t)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn content_type_of(data: &[u8], fallback: &str) -> String {
    match raster::sniff(data) {
        Some(SniffedFormat::Png) => "image/png".to_string(),
        Some(SniffedFormat::Jpeg) => "image/jpeg".to_string(),
        None => fallback.to_string(),
    }
}

/// Serves tile, map and feature-info requests over the configured
/// tilesets. One instance per process, shared across requests.
pub struct Service {
    locks: Arc<LockManager>,
    getmap: GetMapStrategy,
}

impl Service {
    pub fn new(locks: Arc<LockManager>, getmap: GetMapStrategy) -> Self {
        Self { locks, getmap }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Resolve every tile, then combine them into one response.
    ///
    /// A single tile is passed through without a decode round trip. For a
    /// multi-layer request the tiles are composited in order, the first at
    /// the bottom, and re-encoded with the first tileset's format.
    pub async fn get_tile(&self, mut tiles: Vec<Tile>) -> Result<TileResponse, Error> {
        if tiles.is_empty() {
            return Err(Error::Internal("tile request without tiles".to_string()));
        }
        self.prefetch(&mut tiles).await?;

        let expires = tiles.iter().map(|t| t.expires).min().unwrap_or(0);
        let mtime = tiles
            .iter()
            .filter_map(|t| t.stored.as_ref().map(|s| s.mtime))
            .max()
            .unwrap_or_else(SystemTime::now);

        let data = if tiles.len() == 1 {
            stored_data(&tiles[0])?
        } else {
            let mut base = raster::decode(&stored_data(&tiles[0])?)?;
            for tile in &tiles[1..] {
                let overlay = raster::decode(&stored_data(tile)?)?;
                raster::merge(&mut base, &overlay)?;
            }
            tiles[0].tileset().format().encode(&base)?
        };
        let content_type = content_type_of(&data, tiles[0].tileset().format().mime_type());
        Ok(TileResponse {
            data,
            content_type,
            mtime,
            expires,
        })
    }

    /// Fetch a batch of tiles, rendering each distinct metatile at most
    /// once.
    ///
    /// One task runs per distinct (tileset, metatile) group; the group's
    /// remaining tiles are resolved afterwards and find their data already
    /// cached.
    async fn prefetch(&self, tiles: &mut [Tile]) -> Result<(), Error> {
        let mut groups: HashMap<String, usize> = HashMap::new();
        let mut representatives = Vec::new();
        for (index, tile) in tiles.iter().enumerate() {
            let key = format!(
                "{}/{}",
                tile.tileset().name(),
                Metatile::containing(tile).lock_resource_name()
            );
            if !groups.contains_key(&key) {
                groups.insert(key, index);
                representatives.push(index);
            }
        }
        debug!(
            tiles = tiles.len(),
            groups = representatives.len(),
            "prefetching tile groups"
        );

        let mut tasks = Vec::with_capacity(representatives.len());
        for index in representatives {
            let mut tile = tiles[index].clone();
            let locks = Arc::clone(&self.locks);
            tasks.push((
                index,
                tokio::spawn(async move {
                    let tileset = Arc::clone(tile.tileset());
                    tileset.fetch_tile(&mut tile, &locks).await.map(|()| tile)
                }),
            ));
        }
        // drain every task before surfacing an error so no generation
        // keeps running detached after the request has failed
        let mut first_error = None;
        for (index, task) in tasks {
            let outcome = task
                .await
                .map_err(|err| Error::Internal(format!("prefetch task failed: {err}")))
                .and_then(|res| res);
            match outcome {
                Ok(tile) => tiles[index] = tile,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        for tile in tiles.iter_mut() {
            if tile.stored.is_none() {
                let tileset = Arc::clone(tile.tileset());
                tileset.fetch_tile(tile, &self.locks).await?;
            }
        }
        Ok(())
    }

    /// Answer an arbitrary-extent map request according to the configured
    /// strategy.
    pub async fn get_map(&self, views: Vec<MapView>) -> Result<TileResponse, Error> {
        if views.is_empty() {
            return Err(Error::Internal("map request without layers".to_string()));
        }
        match self.getmap {
            GetMapStrategy::Error => Err(Error::Config(
                "full map requests are not enabled on this instance".to_string(),
            )),
            GetMapStrategy::Forward => self.forward_map(&views).await,
            GetMapStrategy::Assemble(mode) => self.assemble_map(&views, mode).await,
        }
    }

    async fn forward_map(&self, views: &[MapView]) -> Result<TileResponse, Error> {
        let mut base: Option<RgbaImage> = None;
        let mut single = None;
        for view in views {
            let source = view
                .tileset
                .source()
                .ok_or_else(|| Error::NoSource(view.tileset.name().to_string()))?;
            let encoded = source.render_map(&view.map_request()).await?;
            if views.len() == 1 {
                single = Some(encoded);
                break;
            }
            let overlay = raster::decode(&encoded)?;
            match base.as_mut() {
                Some(base) => raster::merge(base, &overlay)?,
                None => base = Some(overlay),
            }
        }
        let first = &views[0];
        let (data, content_type) = match single {
            Some(encoded) => {
                let content_type = content_type_of(&encoded, first.tileset.format().mime_type());
                (encoded, content_type)
            }
            None => {
                let merged = base.ok_or_else(|| {
                    Error::Internal("forwarded map produced no image".to_string())
                })?;
                let encoded = first.tileset.format().encode(&merged)?;
                (encoded, first.tileset.format().mime_type().to_string())
            }
        };
        let expires = views.iter().map(|v| v.tileset.expires()).min().unwrap_or(0);
        Ok(TileResponse {
            data,
            content_type,
            mtime: SystemTime::now(),
            expires,
        })
    }

    async fn assemble_map(
        &self,
        views: &[MapView],
        mode: ResampleMode,
    ) -> Result<TileResponse, Error> {
        let first = &views[0];
        let mut canvas: Option<RgbaImage> = None;
        let mut mtime = SystemTime::UNIX_EPOCH;
        let mut expires = u32::MAX;
        for view in views {
            let (layer, layer_mtime, layer_expires) = self.assemble_view(view, mode).await?;
            mtime = mtime.max(layer_mtime);
            expires = expires.min(layer_expires);
            match canvas.as_mut() {
                Some(canvas) => raster::merge(canvas, &layer)?,
                None => canvas = Some(layer),
            }
        }
        let canvas =
            canvas.ok_or_else(|| Error::Internal("assembled map has no layers".to_string()))?;
        let data = first.tileset.format().encode(&canvas)?;
        Ok(TileResponse {
            data,
            content_type: first.tileset.format().mime_type().to_string(),
            mtime,
            expires: if expires == u32::MAX { 0 } else { expires },
        })
    }

    /// Build one layer of an assembled map from its tileset's cache.
    ///
    /// Tiles are taken from the level whose resolution is closest to the
    /// request and pasted onto a transparent canvas, resampled when the
    /// resolutions differ. Areas outside the tileset's limits stay
    /// transparent.
    async fn assemble_view(
        &self,
        view: &MapView,
        mode: ResampleMode,
    ) -> Result<(RgbaImage, SystemTime, u32), Error> {
        let grid = view.grid_link.grid();
        let res = resolution_for(&view.extent, view.width, view.height);
        let z = grid.closest_level(res);
        let level_res = grid.levels()[z].resolution;

        // index range covering the extent, intersected with the limits
        let cover = grid.compute_limits(&view.extent, 0);
        let cover = &cover[z];
        let limits = view
            .grid_link
            .limits(z)
            .ok_or_else(|| Error::Internal(format!("grid {} has no level {z}", grid.name())))?;
        let min_x = cover.min_x.max(limits.min_x);
        let max_x = cover.max_x.min(limits.max_x);
        let min_y = cover.min_y.max(limits.min_y);
        let max_y = cover.max_y.min(limits.max_y);

        let mut tiles = Vec::new();
        for x in min_x..max_x {
            for y in min_y..max_y {
                let mut tile = view.tileset.tile(Arc::clone(&view.grid_link), x, y, z);
                tile.dimensions = view.dimensions.clone();
                tiles.push(tile);
            }
        }

        let mut canvas = RgbaImage::new(view.width, view.height);
        if tiles.is_empty() {
            return Ok((canvas, SystemTime::now(), view.tileset.expires()));
        }
        self.prefetch(&mut tiles).await?;

        let factor = level_res / res;
        for tile in &tiles {
            let tile_extent = grid.tile_extent(tile.x, tile.y, z)?;
            let off_x = (tile_extent.minx - view.extent.minx) / res;
            let off_y = (view.extent.maxy - tile_extent.maxy) / res;
            let src = raster::decode(&stored_data(tile)?)?;
            // At the native resolution bilinear degenerates to a blurry
            // copy, so fall back to nearest when the scale is 1:1.
            match mode {
                ResampleMode::Bilinear if (factor - 1.0).abs() >= 1e-4 => {
                    raster::copy_resampled_bilinear(&src, &mut canvas, off_x, off_y, factor, factor)
                }
                _ => {
                    raster::copy_resampled_nearest(&src, &mut canvas, off_x, off_y, factor, factor)
                }
            }
        }

        let mtime = tiles
            .iter()
            .filter_map(|t| t.stored.as_ref().map(|s| s.mtime))
            .max()
            .unwrap_or_else(SystemTime::now);
        let expires = tiles
            .iter()
            .map(|t| t.expires)
            .min()
            .unwrap_or_else(|| view.tileset.expires());
        Ok((canvas, mtime, expires))
    }

    /// Forward a feature query to the view's source. Results are never
    /// cached; they depend on the exact pixel, not on the tile lattice.
    pub async fn get_feature_info(
        &self,
        request: &FeatureInfoRequest,
    ) -> Result<InfoResponse, Error> {
        let source = request
            .view
            .tileset
            .source()
            .ok_or_else(|| Error::NoSource(request.view.tileset.name().to_string()))?;
        let info = InfoRequest {
            map: request.view.map_request(),
            i: request.i,
            j: request.j,
            info_format: request.info_format.clone(),
        };
        Ok(source.query_info(&info).await?)
    }
}

fn stored_data(tile: &Tile) -> Result<Bytes, Error> {
    tile.stored
        .as_ref()
        .map(|s| s.data.clone())
        .ok_or_else(|| Error::Internal("fetched tile carries no data".to_string()))
}
