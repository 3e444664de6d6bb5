//! Record sources
//!
//! A source hands out pages of `(source_id, point)` records in a stable order.
//! Two variants exist, chosen once from `register_model`:
//!
//! - [`DatabaseSource`]: a paginated SQL query against PostgreSQL
//! - [`RegisterSource`]: a Linked Data API register listing plus one request
//!   per item for its geometry

pub mod database;
pub mod register;

use async_trait::async_trait;
use linkset_common::SourceRecord;
use tracing::info;

use crate::config::{ModelConfig, ModelKind};
use crate::error::Result;
use crate::retry::RetryPolicy;

pub use database::DatabaseSource;
pub use register::RegisterSource;

/// One page of records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub records: Vec<SourceRecord>,
    /// The source knows there is nothing after this page
    pub exhausted: bool,
}

impl Batch {
    pub fn new(records: Vec<SourceRecord>, exhausted: bool) -> Self {
        Self { records, exhausted }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch the records of `page` (0-based), at most `batch_size` of them.
    ///
    /// Records whose geometry cannot be decoded come back as
    /// [`SourceRecord::malformed`] placeholders rather than errors.
    async fn fetch_batch(&self, page: u64, batch_size: u64) -> Result<Batch>;
}

/// The configured record source
pub enum SourceBackend {
    Database(DatabaseSource),
    Register(RegisterSource),
}

impl SourceBackend {
    /// `retry` applies to requests made inside a single page fetch
    pub async fn from_config(config: &ModelConfig, retry: &RetryPolicy) -> Result<Self> {
        let backend = match config.kind {
            ModelKind::Database => Self::Database(DatabaseSource::connect(config).await?),
            ModelKind::Register => Self::Register(RegisterSource::new(config, retry.clone())?),
        };
        info!(model = ?config.kind, "Record source ready");
        Ok(backend)
    }
}

#[async_trait]
impl RecordSource for SourceBackend {
    async fn fetch_batch(&self, page: u64, batch_size: u64) -> Result<Batch> {
        match self {
            Self::Database(source) => source.fetch_batch(page, batch_size).await,
            Self::Register(source) => source.fetch_batch(page, batch_size).await,
        }
    }
}
