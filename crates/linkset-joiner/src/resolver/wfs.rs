//! Web Feature Service resolver
//!
//! Issues a WFS 1.0.0 `GetFeature` request with an OGC filter applying the
//! configured spatial function to the layer's geometry attribute and the input
//! point, asking only for the identifier property, then reads the identifier
//! from the GML2 response.

use async_trait::async_trait;
use linkset_common::Point;
use reqwest::Client;
use tracing::{debug, instrument};

use super::gml::{extract_feature_identifier, FeatureSelector};
use super::PolygonResolver;
use crate::config::PolygonConfig;
use crate::error::{JoinError, Result};

const WFS_VERSION: &str = "1.0.0";
const OUTPUT_FORMAT: &str = "GML2";

pub struct WfsResolver {
    client: Client,
    config: PolygonConfig,
    selector: FeatureSelector,
}

impl WfsResolver {
    pub fn new(config: PolygonConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| JoinError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: PolygonConfig) -> Self {
        let selector = FeatureSelector::new(
            &config.ns_short,
            &config.ns_url,
            &config.layer,
            &config.layer_id,
        );

        Self {
            client,
            config,
            selector,
        }
    }

    /// OGC filter selecting features whose geometry satisfies the spatial function
    pub fn filter(&self, point: &Point) -> String {
        let function = self.config.function.as_str();
        format!(
            "<Filter xmlns=\"http://www.opengis.net/ogc\" xmlns:gml=\"http://www.opengis.net/gml\">\
             <{function}><PropertyName>{geometry}</PropertyName>\
             <gml:Point srsName=\"{srs}\"><gml:coordinates>{coordinates}</gml:coordinates></gml:Point>\
             </{function}></Filter>",
            geometry = self.config.geometry_field,
            srs = self.config.srs_name,
            coordinates = point,
        )
    }

    /// Query string parameters of the GetFeature request
    pub fn query(&self, point: &Point) -> Vec<(&'static str, String)> {
        vec![
            ("service", "WFS".to_string()),
            ("request", "GetFeature".to_string()),
            ("version", WFS_VERSION.to_string()),
            ("typeName", self.config.layer.clone()),
            ("outputFormat", OUTPUT_FORMAT.to_string()),
            ("FILTER", self.filter(point)),
            ("PropertyName", self.config.layer_id.clone()),
        ]
    }
}

#[async_trait]
impl PolygonResolver for WfsResolver {
    #[instrument(skip(self), fields(layer = %self.config.layer))]
    async fn resolve(&self, point: &Point) -> Result<Option<String>> {
        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&self.query(point))
            .send()
            .await
            .map_err(|e| JoinError::resolver_unavailable(format!("GetFeature request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JoinError::resolver_unavailable(format!(
                "GetFeature returned HTTP {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| JoinError::resolver_unavailable(format!("Failed to read GetFeature body: {e}")))?;

        let identifier = extract_feature_identifier(&self.selector, &body)?;
        debug!(identifier = ?identifier, "Resolved point");
        Ok(identifier)
    }
}
