//! PostgreSQL record source
//!
//! The page query must return `(source_id TEXT, x FLOAT8, y FLOAT8)` rows in a
//! stable order and take `$1 = LIMIT`, `$2 = OFFSET`. NULL coordinates are
//! reported as malformed records.

use async_trait::async_trait;
use linkset_common::{Point, SourceRecord};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, warn};

use super::{Batch, RecordSource};
use crate::config::ModelConfig;
use crate::error::{JoinError, Result};

/// Connections kept open; fetches are issued by the single scheduler task
const MAX_CONNECTIONS: u32 = 2;

type PageRow = (String, Option<f64>, Option<f64>);

pub struct DatabaseSource {
    pool: PgPool,
    page_query: String,
}

impl DatabaseSource {
    /// Prepare a pool for `register_endpoint`. Connections are opened on the
    /// first fetch so that connection failures go through the fetch retry.
    pub async fn connect(config: &ModelConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(config.timeout)
            .connect_lazy(&config.endpoint)
            .map_err(|e| JoinError::config(format!("Invalid database connection string: {e}")))?;

        Ok(Self::with_pool(pool, &config.page_query))
    }

    pub fn with_pool(pool: PgPool, page_query: &str) -> Self {
        Self {
            pool,
            page_query: page_query.to_string(),
        }
    }
}

/// `(LIMIT, OFFSET)` for a page, in the signed type PostgreSQL binds
pub fn page_bounds(page: u64, batch_size: u64) -> Result<(i64, i64)> {
    let offset = page
        .checked_mul(batch_size)
        .and_then(|offset| i64::try_from(offset).ok())
        .ok_or_else(|| JoinError::config(format!("Page {page} is beyond the addressable range")))?;
    let limit = i64::try_from(batch_size)
        .map_err(|_| JoinError::config(format!("batch_size {batch_size} is too large")))?;
    Ok((limit, offset))
}

fn into_record(row: PageRow, page: u64) -> SourceRecord {
    match row {
        (source_id, Some(x), Some(y)) => SourceRecord::new(source_id, Point::new(x, y), page),
        (source_id, _, _) => {
            let err = JoinError::MalformedRecord {
                source_id: source_id.clone(),
                reason: "missing coordinates".to_string(),
            };
            warn!(page, error = %err, "Emitting placeholder record");
            SourceRecord::malformed(source_id, page)
        },
    }
}

#[async_trait]
impl RecordSource for DatabaseSource {
    async fn fetch_batch(&self, page: u64, batch_size: u64) -> Result<Batch> {
        let (limit, offset) = page_bounds(page, batch_size)?;

        let rows = sqlx::query_as::<_, PageRow>(&self.page_query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JoinError::source_unavailable(format!("Page query failed: {e}")))?;

        debug!(page, rows = rows.len(), "Fetched page from database");

        let exhausted = (rows.len() as u64) < batch_size;
        let records = rows.into_iter().map(|row| into_record(row, page)).collect();
        Ok(Batch::new(records, exhausted))
    }
}
