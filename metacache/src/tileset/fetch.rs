//! Double-checked tile generation.
//!
//! A cache miss routes through a cross-process lock named after the tile's
//! metatile. Exactly one holder renders the metatile upstream, splits it
//! and stores every member; everyone else waits on the lock and then finds
//! the tile cached. The cache is re-checked after any lock transition so
//! the render happens at most once per metatile no matter how many
//! requests race.

use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use super::{Metatile, Tile, Tileset};
use crate::cache::{CacheBackend, CachedTile, TileData};
use crate::error::Error;
use crate::lock::LockManager;
use crate::raster;
use crate::source::{MapRequest, Source};

impl Tileset {
    /// Resolve `tile` to encoded data, generating it if the cache misses.
    ///
    /// On success `tile.stored` holds the data and `tile.expires` the
    /// client-facing expiry delay. The happy path never touches the lock
    /// directory.
    pub async fn fetch_tile(&self, tile: &mut Tile, locks: &LockManager) -> Result<(), Error> {
        tile.validate()?;

        if let Some(cached) = self.cache().get(tile).await? {
            if !self.is_stale(&cached) {
                self.finish(tile, cached);
                return Ok(());
            }
            debug!(
                tileset = self.name(),
                x = tile.x,
                y = tile.y,
                z = tile.z,
                "cached tile past auto-expire, regenerating"
            );
            // the whole metatile aged together; dropping every member now
            // keeps siblings from serving stale data until their own
            // fetches notice
            self.delete_tile(tile, true).await?;
        }

        let source = self
            .source()
            .ok_or_else(|| Error::NoSource(self.name().to_string()))?
            .clone();

        let metatile = Metatile::containing(tile);
        let resource = metatile.lock_resource_name();
        match locks.acquire_or_wait(&resource).await? {
            Some(guard) => {
                // a competing process may have finished between our miss
                // and the lock grant
                if let Some(cached) = self.cache().get(tile).await? {
                    if !self.is_stale(&cached) {
                        guard.release()?;
                        self.finish(tile, cached);
                        return Ok(());
                    }
                }
                let outcome = self.render_metatile(&metatile, source.as_ref(), tile).await;
                guard.release()?;
                outcome
            }
            None => {
                // the lock holder rendered on our behalf
                match self.cache().get(tile).await? {
                    Some(cached) => {
                        self.finish(tile, cached);
                        Ok(())
                    }
                    None => Err(Error::WaitedInVain(self.name().to_string())),
                }
            }
        }
    }

    /// A cached tile is stale when auto-expiry is configured and its
    /// modification time is older than the expiry window.
    fn is_stale(&self, cached: &CachedTile) -> bool {
        match self.auto_expire() {
            Some(auto_expire) => {
                let age = SystemTime::now()
                    .duration_since(cached.mtime)
                    .unwrap_or(Duration::ZERO);
                age.as_secs() >= u64::from(auto_expire)
            }
            None => false,
        }
    }

    fn finish(&self, tile: &mut Tile, cached: CachedTile) {
        tile.expires = match self.auto_expire() {
            Some(auto_expire) => {
                let age = SystemTime::now()
                    .duration_since(cached.mtime)
                    .unwrap_or(Duration::ZERO)
                    .as_secs();
                u64::from(auto_expire).saturating_sub(age).max(1) as u32
            }
            None => self.expires(),
        };
        tile.stored = Some(cached);
    }

    /// Render the whole metatile upstream, split it and store every member.
    ///
    /// A store failure is logged and the freshly rendered data still
    /// serves the current request; the tile will simply be rendered again
    /// next time.
    async fn render_metatile(
        &self,
        metatile: &Metatile,
        source: &dyn Source,
        requested: &mut Tile,
    ) -> Result<(), Error> {
        let request = MapRequest {
            extent: metatile.extent,
            width: metatile.width,
            height: metatile.height,
            params: requested
                .dimensions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let encoded = source.render_map(&request).await?;
        let raw = raster::decode(&encoded)?;
        let parts = metatile.split(&raw);
        info!(
            tileset = self.name(),
            z = metatile.z,
            mx = metatile.x,
            my = metatile.y,
            tiles = metatile.ntiles(),
            "rendered metatile"
        );

        let mut requested_data = None;
        for (member, image) in metatile.tiles.iter().zip(parts) {
            let data = TileData::Raw(image);
            if member.x == requested.x && member.y == requested.y {
                requested_data = Some(data.to_encoded(self.format())?);
            }
            if let Err(err) = self.cache().set(member, &data).await {
                warn!(
                    tileset = self.name(),
                    x = member.x,
                    y = member.y,
                    z = member.z,
                    error = %err,
                    "failed to store rendered tile"
                );
            }
        }

        let data = requested_data.ok_or_else(|| {
            Error::Internal("requested tile is not a member of its metatile".to_string())
        })?;
        requested.stored = Some(CachedTile {
            data,
            mtime: SystemTime::now(),
        });
        requested.expires = self.auto_expire().unwrap_or(self.expires());
        Ok(())
    }
}
