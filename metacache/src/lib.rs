//! metacache - a caching tile server core.
//!
//! Turns slow, expensive map rendering services into fast tile delivery
//! by caching rendered tiles and generating missing ones on demand, one
//! metatile at a time, with cross-process locking so concurrent requests
//! never render the same area twice.
//!
//! The building blocks:
//!
//! - [`grid`]: tiling pyramids and the coordinate math between geographic
//!   extents and tile indices
//! - [`cache`]: pluggable storage backends (disk, memory, memcached)
//! - [`source`]: upstream rendering services (WMS)
//! - [`tileset`]: binds a source to a cache over one or more grids and
//!   runs the double-checked generation flow
//! - [`service`]: request orchestration, layer merging and map assembly
//! - [`config`]: JSON configuration into an immutable object graph

pub mod cache;
pub mod config;
pub mod error;
pub mod grid;
pub mod lock;
pub mod raster;
pub mod service;
pub mod source;
pub mod tileset;

pub use error::Error;
