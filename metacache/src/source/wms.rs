//! WMS upstream source.
//!
//! Issues GetMap and GetFeatureInfo requests against an OGC WMS endpoint.
//! The configured base parameters (layers, styles, version and friends)
//! are merged with the per-request geometry; dimension values ride along
//! as additional query parameters.

use bytes::Bytes;
use tracing::debug;

use super::{InfoRequest, InfoResponse, MapRequest, Source, SourceError};
use crate::cache::BoxFuture;

/// Configuration for [`WmsSource`].
#[derive(Debug, Clone)]
pub struct WmsSourceConfig {
    /// Endpoint URL without query string.
    pub url: String,
    /// Parameters sent with every GetMap request (LAYERS, SRS, FORMAT...).
    pub getmap_params: Vec<(String, String)>,
    /// Extra parameters for GetFeatureInfo (QUERY_LAYERS...).
    pub getfeatureinfo_params: Vec<(String, String)>,
}

pub struct WmsSource {
    config: WmsSourceConfig,
    client: reqwest::Client,
}

impl WmsSource {
    pub fn new(config: WmsSourceConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn geometry_params(request: &MapRequest) -> Vec<(String, String)> {
        vec![
            (
                "BBOX".to_string(),
                format!(
                    "{},{},{},{}",
                    request.extent.minx,
                    request.extent.miny,
                    request.extent.maxx,
                    request.extent.maxy
                ),
            ),
            ("WIDTH".to_string(), request.width.to_string()),
            ("HEIGHT".to_string(), request.height.to_string()),
        ]
    }

    async fn fetch(
        &self,
        query: &[(String, String)],
    ) -> Result<(Bytes, String), SourceError> {
        let response = self
            .client
            .get(&self.config.url)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = response.bytes().await?;
        debug!(url, content_type, bytes = data.len(), "upstream response");
        Ok((data, content_type))
    }
}

impl Source for WmsSource {
    fn render_map<'a>(
        &'a self,
        request: &'a MapRequest,
    ) -> BoxFuture<'a, Result<Bytes, SourceError>> {
        Box::pin(async move {
            let mut query = vec![("REQUEST".to_string(), "GetMap".to_string())];
            query.extend(self.config.getmap_params.iter().cloned());
            query.extend(Self::geometry_params(request));
            query.extend(request.params.iter().cloned());

            let (data, content_type) = self.fetch(&query).await?;
            // a WMS reports errors as XML documents with a 200 status
            if content_type.starts_with("text/") || content_type.contains("xml") {
                let head = String::from_utf8_lossy(&data[..data.len().min(200)]).into_owned();
                return Err(SourceError::NotAnImage(head));
            }
            Ok(data)
        })
    }

    fn query_info<'a>(
        &'a self,
        request: &'a InfoRequest,
    ) -> BoxFuture<'a, Result<InfoResponse, SourceError>> {
        Box::pin(async move {
            let mut query = vec![("REQUEST".to_string(), "GetFeatureInfo".to_string())];
            query.extend(self.config.getmap_params.iter().cloned());
            query.extend(self.config.getfeatureinfo_params.iter().cloned());
            query.extend(Self::geometry_params(&request.map));
            query.extend(request.map.params.iter().cloned());
            query.push(("I".to_string(), request.i.to_string()));
            query.push(("J".to_string(), request.j.to_string()));
            query.push(("INFO_FORMAT".to_string(), request.info_format.clone()));

            let (data, content_type) = self.fetch(&query).await?;
            Ok(InfoResponse { data, content_type })
        })
    }
}
