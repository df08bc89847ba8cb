//! CLI error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown tileset \"{0}\"")]
    UnknownTileset(String),

    #[error("tileset \"{tileset}\" does not cache on grid \"{grid}\"")]
    UnknownGrid { tileset: String, grid: String },

    #[error("seeding failed: {0}")]
    Seed(#[from] metacache::Error),

    #[error("interrupted")]
    Interrupted,
}
