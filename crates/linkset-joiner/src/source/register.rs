//! Linked Data API register source
//!
//! Listing pages are requested as `{endpoint}?page={n}&per_page={size}` with
//! 1-based `n`. Each listing entry is `[uri, label]`; the item's geometry is then
//! read from the WKT `POINT(x y)` in the item's own JSON representation.
//!
//! The listing is exhausted when the response carries no `Link` header with
//! `rel="next"`. A listing that is not a register page fails the fetch without
//! retrying; item requests are retried one by one.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use linkset_common::{Point, SourceRecord};
use reqwest::header::{ACCEPT, LINK};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Batch, RecordSource};
use crate::config::ModelConfig;
use crate::error::{JoinError, Result};
use crate::retry::RetryPolicy;

const JSON: &str = "application/json";

#[derive(Debug, Deserialize)]
struct RegisterPage {
    register_items: Vec<Vec<serde_json::Value>>,
}

pub struct RegisterSource {
    client: Client,
    endpoint: String,
    point_concurrency: usize,
    retry: RetryPolicy,
}

impl RegisterSource {
    pub fn new(config: &ModelConfig, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| JoinError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(client, &config.endpoint, config.point_concurrency).with_retry(retry))
    }

    pub fn with_client(client: Client, endpoint: &str, point_concurrency: usize) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            point_concurrency: point_concurrency.max(1),
            retry: RetryPolicy::none(),
        }
    }

    /// Retry policy for individual item requests
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response> {
        let response = self
            .client
            .get(url)
            .query(query)
            .header(ACCEPT, JSON)
            .send()
            .await
            .map_err(|e| JoinError::source_unavailable(format!("GET {url} failed: {e}")))?;

        if is_unavailable(response.status()) {
            return Err(JoinError::source_unavailable(format!(
                "GET {url} returned HTTP {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Item URIs on a listing page and whether another page follows
    async fn list(&self, page: u64, batch_size: u64) -> Result<(Vec<String>, bool)> {
        let query = [("page", (page + 1).to_string()), ("per_page", batch_size.to_string())];
        let response = self.get(&self.endpoint, &query).await?;

        if !response.status().is_success() {
            return Err(JoinError::malformed_listing(format!(
                "Register listing page {} returned HTTP {}",
                page + 1,
                response.status()
            )));
        }

        let has_next = has_next_link(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| JoinError::source_unavailable(format!("Failed to read register listing: {e}")))?;
        let listing: RegisterPage = serde_json::from_slice(&body).map_err(|e| {
            JoinError::malformed_listing(format!("Register listing page {} is not a register page: {e}", page + 1))
        })?;

        let uris = listing
            .register_items
            .into_iter()
            .filter_map(|item| match item.first().and_then(|v| v.as_str()) {
                Some(uri) => Some(uri.to_string()),
                None => {
                    warn!(page, item = ?item, "Skipping register item without a URI");
                    None
                },
            })
            .collect();

        Ok((uris, has_next))
    }

    async fn fetch_record(&self, uri: String, page: u64) -> Result<SourceRecord> {
        let url = uri.as_str();
        let (status, body) = self
            .retry
            .run("fetch register item", || async move {
                let response = self.get(url, &[]).await?;
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .map_err(|e| JoinError::source_unavailable(format!("Failed to read {url}: {e}")))?;
                Ok((status, body))
            })
            .await?;

        let point = if status.is_success() {
            Point::from_wkt(&body).map_err(|e| e.to_string())
        } else {
            Err(format!("HTTP {status}"))
        };

        match point {
            Ok(point) => Ok(SourceRecord::new(uri, point, page)),
            Err(reason) => {
                let err = JoinError::MalformedRecord {
                    source_id: uri.clone(),
                    reason,
                };
                warn!(page, error = %err, "Emitting placeholder record");
                Ok(SourceRecord::malformed(uri, page))
            },
        }
    }
}

/// Statuses worth asking again for
fn is_unavailable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Whether a `Link` header advertises a `rel="next"` target
fn has_next_link(response: &Response) -> bool {
    response
        .headers()
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|link| {
            link.split(';').skip(1).any(|param| {
                param
                    .trim()
                    .strip_prefix("rel=")
                    .map(|rel| rel.trim_matches('"').split_whitespace().any(|r| r == "next"))
                    .unwrap_or(false)
            })
        })
}

#[async_trait]
impl RecordSource for RegisterSource {
    async fn fetch_batch(&self, page: u64, batch_size: u64) -> Result<Batch> {
        let (uris, has_next) = self.list(page, batch_size).await?;
        debug!(page, items = uris.len(), has_next, "Fetched register listing");

        let records: Vec<SourceRecord> = stream::iter(uris)
            .map(|uri| self.fetch_record(uri, page))
            .buffered(self.point_concurrency)
            .try_collect()
            .await?;

        Ok(Batch::new(records, !has_next))
    }
}
