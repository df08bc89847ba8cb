//! Seed command - pre-generate tiles for a zoom range.
//!
//! Walks the metatile lattice of a tileset and fetches one representative
//! tile per metatile, so every render fills a whole metatile and no
//! metatile is rendered twice. Workers share an atomic cursor over the
//! precomputed work list; Ctrl-C stops them at the next metatile boundary.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use metacache::cache::CacheBackend;
use metacache::config::Registry;
use metacache::grid::{Extent, GridLink};
use metacache::tileset::Tileset;

use crate::error::CliError;

#[derive(Debug, Args)]
pub struct SeedArgs {
    /// Tileset to seed
    pub tileset: String,

    /// Grid to seed on (defaults to the tileset's first grid)
    #[arg(long)]
    pub grid: Option<String>,

    /// Lowest zoom level to seed
    #[arg(long, default_value_t = 0)]
    pub min_zoom: usize,

    /// Highest zoom level to seed
    #[arg(long, default_value_t = 5)]
    pub max_zoom: usize,

    /// Restrict seeding to this extent (minx,miny,maxx,maxy)
    #[arg(long, value_delimiter = ',', num_args = 4)]
    pub extent: Option<Vec<f64>>,

    /// Regenerate tiles that are already cached
    #[arg(long)]
    pub force: bool,

    /// Concurrent seeding workers
    #[arg(long, default_value_t = 4)]
    pub parallel: usize,
}

/// One unit of seeding work: the representative tile of a metatile.
type Work = (i64, i64, usize);

pub async fn run(registry: &Registry, args: SeedArgs) -> Result<(), CliError> {
    let tileset = registry
        .tileset(&args.tileset)
        .ok_or_else(|| CliError::UnknownTileset(args.tileset.clone()))?;
    let link = match &args.grid {
        Some(grid) => tileset
            .grid_link(grid)
            .ok_or_else(|| CliError::UnknownGrid {
                tileset: args.tileset.clone(),
                grid: grid.clone(),
            })?,
        None => tileset.grid_links().first().ok_or_else(|| {
            CliError::Config(format!("tileset \"{}\" has no grids", args.tileset))
        })?,
    };
    let extent = args
        .extent
        .as_ref()
        .map(|e| Extent::new(e[0], e[1], e[2], e[3]));

    let work = build_work_list(tileset, link, args.min_zoom, args.max_zoom, extent);
    if work.is_empty() {
        info!("nothing to seed");
        return Ok(());
    }
    info!(
        tileset = args.tileset,
        metatiles = work.len(),
        workers = args.parallel,
        "seeding"
    );

    let progress = ProgressBar::new(work.len() as u64);
    progress.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} metatiles ({eta} remaining)",
        )
        .unwrap()
        .progress_chars("=> "),
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .map_err(|err| CliError::Config(format!("cannot install signal handler: {err}")))?;
    }

    let work = Arc::new(work);
    let cursor = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::with_capacity(args.parallel.max(1));
    for _ in 0..args.parallel.max(1) {
        let tileset = Arc::clone(tileset);
        let link = Arc::clone(link);
        let locks = Arc::clone(registry.service().lock_manager());
        let work = Arc::clone(&work);
        let cursor = Arc::clone(&cursor);
        let stop = Arc::clone(&stop);
        let progress = progress.clone();
        let force = args.force;
        workers.push(tokio::spawn(async move {
            loop {
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(&(x, y, z)) = work.get(index) else {
                    return Ok(());
                };
                let mut tile = tileset.tile(Arc::clone(&link), x, y, z);
                if force {
                    tileset.delete_tile(&tile, true).await?;
                } else if tileset.cache().exists(&tile).await.map_err(metacache::Error::from)? {
                    progress.inc(1);
                    continue;
                }
                tileset.fetch_tile(&mut tile, &locks).await?;
                progress.inc(1);
            }
        }));
    }

    let mut failed: Option<CliError> = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let err: metacache::Error = err;
                warn!(error = %err, "seeding worker failed");
                failed.get_or_insert(CliError::Seed(err));
            }
            Err(err) => {
                failed.get_or_insert(CliError::Config(format!("worker panicked: {err}")));
            }
        }
    }
    progress.finish();

    if let Some(err) = failed {
        return Err(err);
    }
    if stop.load(Ordering::SeqCst) {
        return Err(CliError::Interrupted);
    }
    Ok(())
}

/// Representative tiles, one per metatile, for the zoom range and optional
/// extent restriction.
fn build_work_list(
    tileset: &Arc<Tileset>,
    link: &Arc<GridLink>,
    min_zoom: usize,
    max_zoom: usize,
    extent: Option<Extent>,
) -> Vec<Work> {
    let grid = link.grid();
    let (meta_x, meta_y) = tileset.metasize();
    let cover = extent.map(|e| grid.compute_limits(&e, 0));
    let mut work = Vec::new();
    for z in min_zoom..=max_zoom.min(grid.nlevels().saturating_sub(1)) {
        let Some(limits) = link.limits(z) else {
            continue;
        };
        let (mut min_x, mut min_y, mut max_x, mut max_y) =
            (limits.min_x, limits.min_y, limits.max_x, limits.max_y);
        if let Some(cover) = &cover {
            min_x = min_x.max(cover[z].min_x);
            min_y = min_y.max(cover[z].min_y);
            max_x = max_x.min(cover[z].max_x);
            max_y = max_y.min(cover[z].max_y);
        }
        // align down to the metatile lattice, then step metatile-wise
        let mut x = min_x - min_x.rem_euclid(meta_x as i64);
        while x < max_x {
            let mut y = min_y - min_y.rem_euclid(meta_y as i64);
            while y < max_y {
                work.push((x.max(min_x), y.max(min_y), z));
                y += meta_y as i64;
            }
            x += meta_x as i64;
        }
    }
    work
}
