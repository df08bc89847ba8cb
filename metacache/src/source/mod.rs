//! Upstream rendering services.
//!
//! A [`Source`] turns an extent and pixel size into image data, and
//! answers point queries against a rendered view. Tilesets without a
//! source serve only what their cache already holds.

mod wms;

pub use wms::{WmsSource, WmsSourceConfig};

use bytes::Bytes;
use thiserror::Error;

use crate::cache::BoxFuture;
use crate::grid::Extent;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("upstream returned non-image payload: {0}")]
    NotAnImage(String),
}

/// Everything a source needs to render one view.
#[derive(Debug, Clone)]
pub struct MapRequest {
    pub extent: Extent,
    pub width: u32,
    pub height: u32,
    /// Dimension values forwarded as extra parameters.
    pub params: Vec<(String, String)>,
}

/// A point query within a rendered view, in pixel coordinates.
#[derive(Debug, Clone)]
pub struct InfoRequest {
    pub map: MapRequest,
    pub i: u32,
    pub j: u32,
    pub info_format: String,
}

/// Reply to a feature-info query: opaque payload plus its media type.
#[derive(Debug, Clone)]
pub struct InfoResponse {
    pub data: Bytes,
    pub content_type: String,
}

/// An upstream service that renders map imagery on demand.
///
/// Implementations must be `Send + Sync`; the coordinator invokes them
/// from concurrent generation tasks.
pub trait Source: Send + Sync {
    /// Render the requested view and return its encoded image bytes.
    fn render_map<'a>(&'a self, request: &'a MapRequest)
        -> BoxFuture<'a, Result<Bytes, SourceError>>;

    /// Query information about the feature at a pixel of the view.
    fn query_info<'a>(
        &'a self,
        request: &'a InfoRequest,
    ) -> BoxFuture<'a, Result<InfoResponse, SourceError>>;
}
