//! Configuration loading.
//!
//! A JSON document names grids, caches, sources and tilesets and wires
//! them together by reference. Loading validates every reference and
//! produces an immutable [`Registry`] of `Arc`-shared objects; nothing is
//! mutated after startup, so request handling needs no configuration
//! locks.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::cache::{
    CacheBackend, DiskCache, DiskCacheConfig, MemoryCache, RemoteCache, RemoteCacheConfig,
};
use crate::error::Error;
use crate::grid::{google_maps_compatible, wgs84, Extent, Grid, GridLink, Unit};
use crate::lock::LockManager;
use crate::raster::ImageFormat;
use crate::service::{GetMapStrategy, ResampleMode, Service};
use crate::source::{Source, WmsSource, WmsSourceConfig};
use crate::tileset::{Tileset, TilesetBuilder};

/// Everything a running instance serves, built once from a config file.
pub struct Registry {
    grids: HashMap<String, Arc<Grid>>,
    tilesets: HashMap<String, Arc<Tileset>>,
    service: Arc<Service>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("grids", &self.grids.keys().collect::<Vec<_>>())
            .field("tilesets", &self.tilesets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn grid(&self, name: &str) -> Option<&Arc<Grid>> {
        self.grids.get(name)
    }

    pub fn tileset(&self, name: &str) -> Option<&Arc<Tileset>> {
        self.tilesets.get(name)
    }

    pub fn tilesets(&self) -> impl Iterator<Item = &Arc<Tileset>> {
        self.tilesets.values()
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    lock_dir: PathBuf,
    #[serde(default)]
    grids: HashMap<String, GridDef>,
    #[serde(default)]
    caches: HashMap<String, CacheDef>,
    #[serde(default)]
    sources: HashMap<String, SourceDef>,
    #[serde(default)]
    tilesets: HashMap<String, TilesetDef>,
    #[serde(default)]
    getmap: GetMapDef,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GridDef {
    Preset {
        preset: GridPreset,
        #[serde(default = "default_nlevels")]
        nlevels: usize,
    },
    Explicit {
        extent: [f64; 4],
        unit: Unit,
        tile_width: u32,
        tile_height: u32,
        resolutions: Vec<f64>,
    },
}

fn default_nlevels() -> usize {
    18
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum GridPreset {
    Wgs84,
    GoogleMapsCompatible,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CacheDef {
    Disk {
        base: PathBuf,
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        creation_retry: u32,
        #[serde(default)]
        symlink_blank: bool,
    },
    Memory {
        max_bytes: u64,
        #[serde(default)]
        ttl_seconds: Option<u64>,
    },
    Memcached {
        addr: String,
        #[serde(default = "default_max_connections")]
        max_connections: usize,
        #[serde(default)]
        expires: u32,
    },
}

fn default_max_connections() -> usize {
    4
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SourceDef {
    Wms {
        url: String,
        #[serde(default)]
        getmap_params: BTreeMap<String, String>,
        #[serde(default)]
        getfeatureinfo_params: BTreeMap<String, String>,
    },
}

#[derive(Debug, Deserialize)]
struct TilesetDef {
    #[serde(default)]
    source: Option<String>,
    cache: String,
    grids: Vec<String>,
    #[serde(default)]
    restricted_extent: Option<[f64; 4]>,
    #[serde(default)]
    format: Option<ImageFormat>,
    #[serde(default = "default_metatile")]
    metatile: [u32; 2],
    #[serde(default)]
    metabuffer: u32,
    #[serde(default)]
    expires: Option<u32>,
    #[serde(default)]
    auto_expire: Option<u32>,
    #[serde(default)]
    dimensions: BTreeMap<String, String>,
}

fn default_metatile() -> [u32; 2] {
    [1, 1]
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum GetMapDef {
    #[default]
    Error,
    AssembleNearest,
    AssembleBilinear,
    Forward,
}

/// Parse and validate a JSON configuration document.
pub fn load(json: &str) -> Result<Registry, Error> {
    let file: ConfigFile =
        serde_json::from_str(json).map_err(|err| Error::Config(err.to_string()))?;
    build(file)
}

/// Load a configuration file from disk.
pub async fn load_file(path: &std::path::Path) -> Result<Registry, Error> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| Error::Config(format!("cannot read {}: {err}", path.display())))?;
    load(&json)
}

fn build(file: ConfigFile) -> Result<Registry, Error> {
    let locks = Arc::new(LockManager::new(file.lock_dir));

    let mut grids = HashMap::new();
    for (name, def) in file.grids {
        let grid = match def {
            GridDef::Preset { preset, nlevels } => match preset {
                GridPreset::Wgs84 => wgs84(nlevels),
                GridPreset::GoogleMapsCompatible => google_maps_compatible(nlevels),
            },
            GridDef::Explicit {
                extent,
                unit,
                tile_width,
                tile_height,
                resolutions,
            } => {
                if resolutions.is_empty() {
                    return Err(Error::Config(format!("grid \"{name}\" has no resolutions")));
                }
                Grid::new(
                    name.clone(),
                    Extent::new(extent[0], extent[1], extent[2], extent[3]),
                    unit,
                    tile_width,
                    tile_height,
                    &resolutions,
                )
            }
        };
        grids.insert(name, Arc::new(grid));
    }

    let mut caches: HashMap<String, Arc<dyn CacheBackend>> = HashMap::new();
    for (name, def) in file.caches {
        let backend: Arc<dyn CacheBackend> = match def {
            CacheDef::Disk {
                base,
                template,
                creation_retry,
                symlink_blank,
            } => {
                let config = DiskCacheConfig {
                    base,
                    template,
                    creation_retry,
                    symlink_blank,
                };
                Arc::new(DiskCache::new(config, Arc::clone(&locks))?)
            }
            CacheDef::Memory { max_bytes, ttl_seconds } => Arc::new(MemoryCache::new(
                max_bytes,
                ttl_seconds.map(Duration::from_secs),
            )),
            CacheDef::Memcached {
                addr,
                max_connections,
                expires,
            } => {
                let mut config = RemoteCacheConfig::new(addr);
                config.max_connections = max_connections;
                config.expires = expires;
                Arc::new(RemoteCache::new(config))
            }
        };
        caches.insert(name, backend);
    }

    let http_client = reqwest::Client::new();
    let mut sources: HashMap<String, Arc<dyn Source>> = HashMap::new();
    for (name, def) in file.sources {
        let source: Arc<dyn Source> = match def {
            SourceDef::Wms {
                url,
                getmap_params,
                getfeatureinfo_params,
            } => Arc::new(WmsSource::new(
                WmsSourceConfig {
                    url,
                    getmap_params: getmap_params.into_iter().collect(),
                    getfeatureinfo_params: getfeatureinfo_params.into_iter().collect(),
                },
                http_client.clone(),
            )),
        };
        sources.insert(name, source);
    }

    let mut tilesets = HashMap::new();
    for (name, def) in file.tilesets {
        let cache = caches
            .get(&def.cache)
            .ok_or_else(|| {
                Error::Config(format!(
                    "tileset \"{name}\" references unknown cache \"{}\"",
                    def.cache
                ))
            })?
            .clone();
        let mut builder = TilesetBuilder::new(&name, cache)
            .metatiling(def.metatile[0], def.metatile[1], def.metabuffer);
        if let Some(source_name) = &def.source {
            let source = sources.get(source_name).ok_or_else(|| {
                Error::Config(format!(
                    "tileset \"{name}\" references unknown source \"{source_name}\""
                ))
            })?;
            builder = builder.source(Arc::clone(source));
        }
        if let Some(format) = def.format {
            builder = builder.format(format);
        }
        if let Some(expires) = def.expires {
            builder = builder.expires(expires);
        }
        if let Some(auto_expire) = def.auto_expire {
            builder = builder.auto_expire(auto_expire);
        }
        let restricted = def
            .restricted_extent
            .map(|e| Extent::new(e[0], e[1], e[2], e[3]));
        for grid_name in &def.grids {
            let grid = grids.get(grid_name).ok_or_else(|| {
                Error::Config(format!(
                    "tileset \"{name}\" references unknown grid \"{grid_name}\""
                ))
            })?;
            builder = builder.grid_link(Arc::new(GridLink::new(Arc::clone(grid), restricted, 0)));
        }
        for (dim_name, default_value) in &def.dimensions {
            builder = builder.dimension(dim_name, default_value);
        }
        tilesets.insert(name, builder.build()?);
    }

    let getmap = match file.getmap {
        GetMapDef::Error => GetMapStrategy::Error,
        GetMapDef::AssembleNearest => GetMapStrategy::Assemble(ResampleMode::Nearest),
        GetMapDef::AssembleBilinear => GetMapStrategy::Assemble(ResampleMode::Bilinear),
        GetMapDef::Forward => GetMapStrategy::Forward,
    };
    info!(
        grids = grids.len(),
        tilesets = tilesets.len(),
        "configuration loaded"
    );
    Ok(Registry {
        grids,
        tilesets,
        service: Arc::new(Service::new(locks, getmap)),
    })
}
