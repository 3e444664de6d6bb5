//! Run orchestration
//!
//! Wires the scheduler, the worker pool and the output writer together:
//!
//! ```text
//! RecordSource -> BatchScheduler -> [bounded queue] -> WorkerPool (x threads)
//!                                                          |
//!                                 PolygonResolver <--------+
//!                                                          v
//!                                  OutputSink -> OutputWriter (link ids, csv, cursor)
//! ```

use linkset_common::RunSummary;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::assembler::LinkAssembler;
use crate::config::JoinerConfig;
use crate::cursor::{CursorFile, CursorState, PageProgress};
use crate::error::{JoinError, Result};
use crate::pool::{WorkerContext, WorkerPool};
use crate::resolver::{PolygonResolver, WfsResolver};
use crate::scheduler::{BatchCursor, BatchScheduler, StopReason};
use crate::source::{RecordSource, SourceBackend};
use crate::writer::OutputWriter;

/// Upper bound on records buffered between the scheduler and the workers
const MAX_QUEUE_CAPACITY: usize = 10_000;

/// Result of a run that got as far as opening its output
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    /// First page fetched, after applying the stored cursor
    pub start_page: u64,
    /// `None` when the scheduler itself failed
    pub stop_reason: Option<StopReason>,
    /// The fatal error that ended the run early
    pub error: Option<JoinError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Joiner {
    config: JoinerConfig,
    source: Arc<dyn RecordSource>,
    resolver: Arc<dyn PolygonResolver>,
}

impl Joiner {
    pub fn new(
        config: JoinerConfig,
        source: Arc<dyn RecordSource>,
        resolver: Arc<dyn PolygonResolver>,
    ) -> Self {
        Self {
            config,
            source,
            resolver,
        }
    }

    /// Build the configured record source and the WFS resolver
    pub async fn from_config(config: JoinerConfig) -> Result<Self> {
        let source = SourceBackend::from_config(&config.model, &config.retry).await?;
        let resolver = WfsResolver::new(config.polygon.clone())?;
        Ok(Self::new(config, Arc::new(source), Arc::new(resolver)))
    }

    fn cursor_file(&self) -> Option<CursorFile> {
        self.config.run.cursor_file.as_ref().map(CursorFile::new)
    }

    /// Stored cursor state including rows appended after it was stored
    fn resume_state(&self) -> Result<Option<CursorState>> {
        match self.cursor_file() {
            Some(cursor) => cursor.resume(&self.config.run.output_file),
            None => Ok(None),
        }
    }

    /// Execute the run. Errors before the output is open are returned as `Err`;
    /// anything later is reported in [`RunOutcome::error`] next to the rows
    /// already written.
    #[instrument(skip(self), fields(output = %self.config.run.output_file.display()))]
    pub async fn run(self) -> Result<RunOutcome> {
        let run = &self.config.run;
        let resumed = self.resume_state()?;
        let start_page = resume_page(run.start, resumed.as_ref());

        let first_link_id = match &resumed {
            Some(state) if state.next_link_id > run.batch_id => {
                info!(
                    configured = run.batch_id,
                    stored = state.next_link_id,
                    "Continuing link ids from stored cursor"
                );
                state.next_link_id
            },
            _ => run.batch_id,
        };
        let written = resumed.map(|state| state.written).unwrap_or_default();

        let assembler = Arc::new(LinkAssembler::new(first_link_id));
        let writer = OutputWriter::open(
            &run.output_file,
            Arc::clone(&assembler),
            PageProgress::resumed(start_page, written.iter().cloned()),
            self.cursor_file(),
        )?;
        let (sink, writer_handle) = writer.spawn(run.threads);

        let capacity = usize::try_from(run.batch_size)
            .unwrap_or(MAX_QUEUE_CAPACITY)
            .clamp(1, MAX_QUEUE_CAPACITY);
        let (queue_tx, queue_rx) = async_channel::bounded(capacity);
        let shutdown = CancellationToken::new();

        info!(
            start_page,
            stop_page = ?run.stop,
            batch_size = run.batch_size,
            threads = run.threads,
            first_link_id,
            already_written = written.len(),
            "Starting linkset run"
        );

        let pool = WorkerPool::spawn(
            run.threads,
            WorkerContext {
                queue: queue_rx,
                resolver: Arc::clone(&self.resolver),
                sink: sink.clone(),
                retry: self.config.retry.clone(),
                call_timeout: self.config.polygon.timeout,
                shutdown: shutdown.clone(),
            },
        );

        let scheduler = BatchScheduler::new(
            Arc::clone(&self.source),
            queue_tx,
            sink,
            self.config.retry.clone(),
            run.max_empty_pages,
            shutdown.clone(),
        )
        .with_written(written.into_iter().collect::<HashSet<_>>());
        let cursor = BatchCursor::new(start_page, run.stop, run.batch_size);
        let scheduler_handle = tokio::spawn(scheduler.run(cursor));

        let scheduled = scheduler_handle
            .await
            .unwrap_or_else(|e| Err(JoinError::Task(format!("scheduler: {e}"))));
        if scheduled.is_err() {
            shutdown.cancel();
        }
        let pooled = pool.join().await;

        let report = writer_handle.await.map_err(|e| JoinError::Task(format!("writer: {e}")))?;

        let (stop_reason, scheduler_error) = match scheduled {
            Ok(reason) => (Some(reason), None),
            Err(e) => (None, Some(e)),
        };
        let error = report.error.or(pooled.err()).or(scheduler_error);

        match &error {
            None => info!(summary = %report.summary, "Linkset run complete"),
            Some(e) => warn!(summary = %report.summary, error = %e, "Linkset run aborted"),
        }

        Ok(RunOutcome {
            summary: report.summary,
            start_page,
            stop_reason,
            error,
        })
    }
}

/// Page the run starts from: the configured `start`, raised to the stored
/// cursor when one exists.
fn resume_page(start: u64, stored: Option<&CursorState>) -> u64 {
    match stored {
        Some(state) if state.page > start => {
            info!(configured = start, stored = state.page, "Resuming from stored cursor");
            state.page
        },
        _ => start,
    }
}
