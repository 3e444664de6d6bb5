//! Shared helpers for joiner integration tests
//!
//! In-memory stand-ins for the record source and the polygon resolver, a
//! configuration builder, and a reader for the produced linkset file.

#![allow(dead_code)]

use async_trait::async_trait;
use linkset_common::{Point, SourceRecord};
use linkset_joiner::config::{
    JoinerConfig, ModelConfig, ModelKind, PolygonConfig, RunConfig, DEFAULT_PAGE_QUERY,
};
use linkset_joiner::resolver::{PolygonResolver, SpatialFunction};
use linkset_joiner::retry::RetryPolicy;
use linkset_joiner::source::{Batch, RecordSource};
use linkset_joiner::{JoinError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Record Source
// ============================================================================

/// `(source_id, point)`; `None` marks a record with unreadable geometry
pub type Row = (String, Option<Point>);

pub fn row(id: &str, x: f64, y: f64) -> Row {
    (id.to_string(), Some(Point::new(x, y)))
}

pub fn malformed_row(id: &str) -> Row {
    (id.to_string(), None)
}

/// Pages served from memory. Past the last page every fetch is empty.
pub struct MemorySource {
    pages: Vec<Vec<Row>>,
    fetches: Mutex<Vec<u64>>,
    unavailable: bool,
}

impl MemorySource {
    pub fn paged(pages: Vec<Vec<Row>>) -> Self {
        Self {
            pages,
            fetches: Mutex::new(Vec::new()),
            unavailable: false,
        }
    }

    pub fn chunked(rows: Vec<Row>, batch_size: usize) -> Self {
        Self::paged(rows.chunks(batch_size).map(<[Row]>::to_vec).collect())
    }

    /// Source whose every fetch fails with a transient error
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::paged(Vec::new())
        }
    }

    /// Page indexes in the order they were fetched
    pub fn fetches(&self) -> Vec<u64> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn fetch_batch(&self, page: u64, _batch_size: u64) -> Result<Batch> {
        self.fetches.lock().unwrap().push(page);
        if self.unavailable {
            return Err(JoinError::source_unavailable("connection refused"));
        }

        let index = page as usize;
        let records = self
            .pages
            .get(index)
            .map(|rows| {
                rows.iter()
                    .map(|(id, point)| match point {
                        Some(point) => SourceRecord::new(id.clone(), *point, page),
                        None => SourceRecord::malformed(id.clone(), page),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Batch::new(records, index + 1 >= self.pages.len()))
    }
}

// ============================================================================
// Polygon Resolver
// ============================================================================

#[derive(Debug, Clone)]
pub enum Reply {
    Match(String),
    NoMatch,
    /// Answer that cannot be interpreted
    Garbled,
    /// Service never answers successfully
    Down,
    /// Answer arrives after the given delay
    Slow(Duration),
}

/// Resolver answering from a table keyed by the point's `x,y` text.
/// Unknown points are unmatched.
pub struct MemoryResolver {
    replies: HashMap<String, Reply>,
    calls: AtomicU32,
    jitter: bool,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            calls: AtomicU32::new(0),
            jitter: false,
        }
    }

    pub fn reply(mut self, x: f64, y: f64, reply: Reply) -> Self {
        self.replies.insert(Point::new(x, y).to_string(), reply);
        self
    }

    /// Delay answers by a few milliseconds depending on the point, so that
    /// concurrent workers complete out of order
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolygonResolver for MemoryResolver {
    async fn resolve(&self, point: &Point) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.jitter {
            let delay = (point.x.abs() * 7.0 + point.y.abs() * 13.0) as u64 % 9;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match self.replies.get(&point.to_string()) {
            Some(Reply::Match(id)) => Ok(Some(id.clone())),
            Some(Reply::NoMatch) | None => Ok(None),
            Some(Reply::Garbled) => Err(JoinError::response_parse("unexpected root element 'html'")),
            Some(Reply::Down) => Err(JoinError::resolver_unavailable("503 Service Unavailable")),
            Some(Reply::Slow(delay)) => {
                tokio::time::sleep(*delay).await;
                Ok(None)
            },
        }
    }
}

// ============================================================================
// Configuration and Output
// ============================================================================

pub fn test_config(output_file: &Path) -> JoinerConfig {
    JoinerConfig {
        polygon: PolygonConfig {
            endpoint: "http://localhost/geoserver/ows".to_string(),
            layer: "ahgf_shcatch:AHGFCatchment".to_string(),
            geometry_field: "shape".to_string(),
            layer_id: "ahgf_shcatch:hydroid".to_string(),
            ns_short: "ahgf_shcatch".to_string(),
            ns_url: "http://linked.data.gov.au/dataset/geof/v2/ahgf_shcatch".to_string(),
            function: SpatialFunction::Contains,
            srs_name: "EPSG:4283".to_string(),
            timeout: Duration::from_secs(5),
        },
        model: ModelConfig {
            kind: ModelKind::Database,
            endpoint: "postgres://localhost/gnaf".to_string(),
            page_query: DEFAULT_PAGE_QUERY.to_string(),
            point_concurrency: 4,
            timeout: Duration::from_secs(5),
        },
        run: RunConfig {
            start: 0,
            stop: None,
            batch_size: 2,
            output_file: output_file.to_path_buf(),
            cursor_file: None,
            threads: 4,
            batch_id: 1,
            max_empty_pages: 3,
        },
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
    }
}

pub fn output_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("linkset.csv")
}

/// Rows of a linkset file as `(link_id, source_id, reference_id)`
pub fn read_rows(path: &Path) -> Vec<(u64, String, String)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .unwrap();

    reader
        .records()
        .map(|record| {
            let record = record.unwrap();
            assert_eq!(record.len(), 3, "incomplete row: {record:?}");
            (
                record[0].parse().unwrap(),
                record[1].to_string(),
                record[2].to_string(),
            )
        })
        .collect()
}
