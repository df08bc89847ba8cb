//! Filesystem tile cache, the reference backend.
//!
//! Tiles become ordinary files whose modification time doubles as the
//! tile's cache timestamp. The default layout hashes tile indices into
//! 3-digit directory groups so no directory grows unbounded; a key
//! template can reproduce trees laid out by other software instead.
//!
//! Writes race with concurrent readers and writers from other processes,
//! so parent-directory creation tolerates "already exists", stale entries
//! are unlinked before rewriting, and a failed write is retried a
//! configurable number of times.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{
    hashed_path_segments, BoxFuture, CacheBackend, CacheError, CachedTile, KeyTemplate, TileData,
};
use crate::lock::LockManager;
use crate::raster;
use crate::tileset::Tile;

/// Configuration for [`DiskCache`].
#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    /// Root of the tile tree. Also hosts the blank-tile store.
    pub base: PathBuf,
    /// Optional path template replacing the hashed layout. Rendered
    /// relative to `base` unless it is absolute.
    pub template: Option<String>,
    /// Additional attempts after a failed write.
    pub creation_retry: u32,
    /// Store uniform-color tiles once and symlink every occurrence to the
    /// shared copy. Oceans and empty areas collapse to a handful of files.
    pub symlink_blank: bool,
}

impl DiskCacheConfig {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            template: None,
            creation_retry: 0,
            symlink_blank: false,
        }
    }
}

/// File-per-tile cache rooted at a configured directory.
pub struct DiskCache {
    base: PathBuf,
    template: Option<KeyTemplate>,
    creation_retry: u32,
    symlink_blank: bool,
    locks: Arc<LockManager>,
}

impl DiskCache {
    /// The lock manager guards one-time creation of shared blank files;
    /// it is the same instance that serializes metatile rendering.
    pub fn new(config: DiskCacheConfig, locks: Arc<LockManager>) -> Result<Self, CacheError> {
        let template = config
            .template
            .as_deref()
            .map(KeyTemplate::parse)
            .transpose()?;
        Ok(Self {
            base: config.base,
            template,
            creation_retry: config.creation_retry,
            symlink_blank: config.symlink_blank,
            locks,
        })
    }

    /// Absolute path holding `tile`'s encoded data.
    pub fn tile_path(&self, tile: &Tile) -> PathBuf {
        match &self.template {
            Some(template) => {
                let rendered = PathBuf::from(template.render(tile));
                if rendered.is_absolute() {
                    rendered
                } else {
                    self.base.join(rendered)
                }
            }
            None => {
                let mut path = self.base.clone();
                for segment in hashed_path_segments(tile) {
                    path.push(segment);
                }
                path
            }
        }
    }

    fn blank_path(&self, color: [u8; 4], extension: &str) -> PathBuf {
        let name = format!(
            "{:02x}{:02x}{:02x}{:02x}.{}",
            color[0], color[1], color[2], color[3], extension
        );
        self.base.join("blanks").join(name)
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
        let mut attempt = 0;
        loop {
            match self.try_write(path, data).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.creation_retry => {
                    attempt += 1;
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %err,
                        "tile write failed, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_write(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            // another writer may create the same directories concurrently
            match fs::create_dir_all(parent).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        // unlink any stale entry so a rewrite never follows an old symlink
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let mut file = fs::File::create(path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        let written = fs::metadata(path).await?.len() as usize;
        if written != data.len() {
            return Err(CacheError::ShortWrite {
                path: path.display().to_string(),
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Ensure the shared file for a uniform `color` exists, creating it
    /// exactly once across processes, then link `path` to it.
    #[cfg(unix)]
    async fn link_blank(
        &self,
        path: &Path,
        color: [u8; 4],
        encoded: &[u8],
        extension: &str,
    ) -> Result<(), CacheError> {
        let blank = self.blank_path(color, extension);
        if fs::metadata(&blank).await.is_err() {
            let resource = format!(
                "blank-{:02x}{:02x}{:02x}{:02x}-{extension}",
                color[0], color[1], color[2], color[3]
            );
            match self.locks.acquire_or_wait(&resource).await? {
                Some(guard) => {
                    if fs::metadata(&blank).await.is_err() {
                        self.write_file(&blank, encoded).await?;
                        debug!(path = %blank.display(), "created shared blank tile");
                    }
                    guard.release()?;
                }
                None => {
                    // creator finished while we waited
                }
            }
        }
        if let Some(parent) = path.parent() {
            match fs::create_dir_all(parent).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }
        }
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::symlink(&blank, path).await?;
        Ok(())
    }
}

impl CacheBackend for DiskCache {
    fn exists<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            match fs::metadata(self.tile_path(tile)).await {
                Ok(_) => Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn get<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<Option<CachedTile>, CacheError>> {
        Box::pin(async move {
            let path = self.tile_path(tile);
            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let mtime = fs::metadata(&path).await?.modified()?;
            Ok(Some(CachedTile {
                data: data.into(),
                mtime,
            }))
        })
    }

    fn set<'a>(
        &'a self,
        tile: &'a Tile,
        data: &'a TileData,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let path = self.tile_path(tile);
            let encoded = data.to_encoded(tile.tileset().format())?;

            #[cfg(unix)]
            if self.symlink_blank {
                if let Some(color) = data.raw().and_then(raster::solid_color) {
                    return self
                        .link_blank(&path, color.0, &encoded, tile.extension())
                        .await;
                }
            }
            #[cfg(not(unix))]
            let _ = raster::solid_color;

            self.write_file(&path, &encoded).await
        })
    }

    fn delete<'a>(&'a self, tile: &'a Tile) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            match fs::remove_file(self.tile_path(tile)).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
    }
}
