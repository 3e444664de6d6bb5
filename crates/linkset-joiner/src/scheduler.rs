//! Batch scheduler
//!
//! Walks the page range `[start, stop)` (or open-ended when `stop` is unset),
//! fetches each page from the record source and pushes its records onto the
//! bounded work queue. The scheduler moves to the next page as soon as the
//! current one is enqueued, so fetching overlaps resolution until the queue
//! fills up. Records an earlier run already wrote are not enqueued again.

use async_channel::Sender;
use linkset_common::SourceRecord;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::source::RecordSource;
use crate::writer::OutputSink;

/// Paging state owned by the scheduler. Only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCursor {
    pub start_page: u64,
    pub stop_page: Option<u64>,
    pub batch_size: u64,
    pub current_page: u64,
}

impl BatchCursor {
    pub fn new(start_page: u64, stop_page: Option<u64>, batch_size: u64) -> Self {
        Self {
            start_page,
            stop_page,
            batch_size,
            current_page: start_page,
        }
    }

    /// Page to fetch next, `None` once the range is done
    pub fn next_page(&self) -> Option<u64> {
        match self.stop_page {
            Some(stop) if self.current_page >= stop => None,
            _ => Some(self.current_page),
        }
    }

    pub fn advance(&mut self) {
        self.current_page += 1;
    }

    pub fn is_bounded(&self) -> bool {
        self.stop_page.is_some()
    }
}

/// Why the scheduler stopped fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Reached `stop`
    RangeComplete,
    /// The source ran out of records
    SourceExhausted,
    /// The bounded range kept returning empty pages
    TooManyEmptyPages,
    /// The run was cancelled by a fatal error elsewhere
    Cancelled,
}

pub struct BatchScheduler {
    source: Arc<dyn RecordSource>,
    queue: Sender<SourceRecord>,
    sink: OutputSink,
    retry: RetryPolicy,
    max_empty_pages: u32,
    shutdown: CancellationToken,
    written: HashSet<String>,
}

impl BatchScheduler {
    pub fn new(
        source: Arc<dyn RecordSource>,
        queue: Sender<SourceRecord>,
        sink: OutputSink,
        retry: RetryPolicy,
        max_empty_pages: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            queue,
            sink,
            retry,
            max_empty_pages,
            shutdown,
            written: HashSet::new(),
        }
    }

    /// Source ids already in the output from an earlier run
    pub fn with_written(mut self, written: HashSet<String>) -> Self {
        self.written = written;
        self
    }

    /// Drive the cursor to the end of its range. The work queue is closed on
    /// return so that workers drain and exit.
    pub async fn run(self, mut cursor: BatchCursor) -> Result<StopReason> {
        let outcome = self.schedule(&mut cursor).await;
        self.queue.close();

        match &outcome {
            Ok(reason) => info!(reason = ?reason, last_page = cursor.current_page, "Scheduler finished"),
            Err(e) => {
                warn!(page = cursor.current_page, error = %e, "Scheduler failed");
                self.shutdown.cancel();
            },
        }
        outcome
    }

    async fn schedule(&self, cursor: &mut BatchCursor) -> Result<StopReason> {
        let mut empty_pages = 0u32;

        while let Some(page) = cursor.next_page() {
            if self.shutdown.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }

            let batch_size = cursor.batch_size;
            let source = &self.source;
            let batch = self
                .retry
                .run("fetch page", || async move { source.fetch_batch(page, batch_size).await })
                .await?;

            if batch.is_empty() {
                empty_pages += 1;
                if !cursor.is_bounded() {
                    debug!(page, "Source exhausted");
                    return Ok(StopReason::SourceExhausted);
                }
                if empty_pages >= self.max_empty_pages {
                    warn!(page, empty_pages, "Giving up after consecutive empty pages");
                    return Ok(StopReason::TooManyEmptyPages);
                }
                self.sink.register_page(page, 0, Vec::new()).await?;
                cursor.advance();
                continue;
            }
            empty_pages = 0;

            let exhausted = batch.exhausted;
            let (skipped, records): (Vec<SourceRecord>, Vec<SourceRecord>) = batch
                .records
                .into_iter()
                .partition(|record| self.written.contains(&record.source_id));
            if !skipped.is_empty() {
                info!(page, skipped = skipped.len(), "Skipping records already written");
            }
            debug!(page, records = records.len(), exhausted, "Dispatching page");

            let skipped = skipped.into_iter().map(|record| record.source_id).collect();
            self.sink.register_page(page, records.len(), skipped).await?;
            for record in records {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Ok(StopReason::Cancelled),
                    sent = self.queue.send(record) => {
                        if sent.is_err() {
                            return Ok(StopReason::Cancelled);
                        }
                    },
                }
            }
            cursor.advance();

            if exhausted {
                return Ok(StopReason::SourceExhausted);
            }
        }

        Ok(StopReason::RangeComplete)
    }
}
