//! Cache key construction.
//!
//! Two schemes are supported. The hashed layout spreads tiles over a fixed
//! directory tree so no directory ever holds more than a thousand entries.
//! The template scheme renders a user-supplied pattern once parsed at
//! configuration time, for interoperating with trees laid out by other
//! software.

use thiserror::Error;

use crate::tileset::Tile;

#[derive(Debug, Error)]
pub enum KeyTemplateError {
    #[error("unknown placeholder {{{0}}} in key template")]
    UnknownPlaceholder(String),
    #[error("unterminated placeholder in key template at offset {0}")]
    Unterminated(usize),
}

/// Replace path separators and dots so a value can serve as a single path
/// segment.
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | '.' => '#',
            c => c,
        })
        .collect()
}

/// Path segments of the hashed directory layout, relative to the cache base:
/// tileset, grid, one segment per dimension value, the zero-padded level,
/// then the x and y indices each broken into three 3-digit groups.
pub fn hashed_path_segments(tile: &Tile) -> Vec<String> {
    let mut segments = Vec::with_capacity(9 + tile.dimensions.len());
    segments.push(sanitize(tile.tileset().name()));
    segments.push(sanitize(tile.grid().name()));
    for value in tile.dimensions.values() {
        segments.push(sanitize(value));
    }
    segments.push(format!("{:02}", tile.z));
    for group in [
        tile.x / 1_000_000,
        (tile.x / 1_000) % 1_000,
        tile.x % 1_000,
        tile.y / 1_000_000,
        (tile.y / 1_000) % 1_000,
    ] {
        segments.push(format!("{group:03}"));
    }
    segments.push(format!("{:03}.{}", tile.y % 1_000, tile.extension()));
    segments
}

/// A single flat string key, for backends with no path hierarchy.
///
/// Dimension values are appended in name order so the key is deterministic
/// for a given tile.
pub fn flat_key(tile: &Tile) -> String {
    let mut key = format!(
        "{}:{}:{}:{}:{}",
        sanitize(tile.tileset().name()),
        sanitize(tile.grid().name()),
        tile.z,
        tile.x,
        tile.y,
    );
    for value in tile.dimensions.values() {
        key.push(':');
        key.push_str(&sanitize(value));
    }
    key
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    X,
    Y,
    Z,
    InvX,
    InvY,
    InvZ,
    Tileset,
    Grid,
    Dim,
    Ext,
}

/// A key pattern parsed once at configuration time.
///
/// Placeholders: `{tileset}`, `{grid}`, `{dim}`, `{ext}`, `{x}`, `{y}`,
/// `{z}`, and the top-origin variants `{inv_x}`, `{inv_y}`, `{inv_z}`.
#[derive(Debug, Clone)]
pub struct KeyTemplate {
    parts: Vec<Part>,
}

impl KeyTemplate {
    pub fn parse(template: &str) -> Result<Self, KeyTemplateError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = template;
        let mut offset = 0;
        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or(KeyTemplateError::Unterminated(offset + open))?;
            let name = &after[..close];
            let part = match name {
                "x" => Part::X,
                "y" => Part::Y,
                "z" => Part::Z,
                "inv_x" => Part::InvX,
                "inv_y" => Part::InvY,
                "inv_z" => Part::InvZ,
                "tileset" => Part::Tileset,
                "grid" => Part::Grid,
                "dim" => Part::Dim,
                "ext" => Part::Ext,
                other => {
                    return Err(KeyTemplateError::UnknownPlaceholder(other.to_string()));
                }
            };
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            parts.push(part);
            offset += open + close + 2;
            rest = &after[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self { parts })
    }

    /// Render the key for `tile`.
    ///
    /// Inverted indices count from the opposite corner of the grid, for
    /// trees written by software with a top-left origin.
    pub fn render(&self, tile: &Tile) -> String {
        let level = &tile.grid().levels()[tile.z];
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::X => out.push_str(&tile.x.to_string()),
                Part::Y => out.push_str(&tile.y.to_string()),
                Part::Z => out.push_str(&tile.z.to_string()),
                Part::InvX => out.push_str(&(level.max_x - tile.x - 1).to_string()),
                Part::InvY => out.push_str(&(level.max_y - tile.y - 1).to_string()),
                Part::InvZ => {
                    out.push_str(&(tile.grid().nlevels() - tile.z - 1).to_string());
                }
                Part::Tileset => out.push_str(&sanitize(tile.tileset().name())),
                Part::Grid => out.push_str(&sanitize(tile.grid().name())),
                Part::Dim => {
                    for value in tile.dimensions.values() {
                        out.push('#');
                        out.push_str(&sanitize(value));
                    }
                }
                Part::Ext => out.push_str(tile.extension()),
            }
        }
        out
    }
}
