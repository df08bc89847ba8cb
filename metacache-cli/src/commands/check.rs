//! Check command - validate a configuration and summarize it.

use metacache::config::Registry;

use crate::error::CliError;

pub fn run(registry: &Registry) -> Result<(), CliError> {
    let mut tilesets: Vec<_> = registry.tilesets().collect();
    tilesets.sort_by(|a, b| a.name().cmp(b.name()));
    println!("configuration ok: {} tileset(s)", tilesets.len());
    for tileset in tilesets {
        let grids: Vec<_> = tileset
            .grid_links()
            .iter()
            .map(|link| link.grid().name())
            .collect();
        let (mx, my) = tileset.metasize();
        println!(
            "  {}: grids [{}], format {}, metatile {}x{}{}{}",
            tileset.name(),
            grids.join(", "),
            tileset.format().extension(),
            mx,
            my,
            if tileset.metabuffer() > 0 {
                format!(" (+{}px gutter)", tileset.metabuffer())
            } else {
                String::new()
            },
            if tileset.source().is_some() {
                ""
            } else {
                ", read-only"
            },
        );
    }
    Ok(())
}
