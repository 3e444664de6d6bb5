//! Worker pool
//!
//! `threads` workers share one bounded queue of records. Each worker resolves
//! a record, submits the result to the output sink and waits for the row to be
//! durable before taking the next record.
//!
//! A fatal error in any worker cancels the shared shutdown token. Workers then
//! finish the record they hold, stop taking new ones and exit.

use async_channel::Receiver;
use futures::future::join_all;
use linkset_common::{ResolutionResult, SourceRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{JoinError, Result};
use crate::resolver::PolygonResolver;
use crate::retry::RetryPolicy;
use crate::writer::OutputSink;

/// State shared by every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Receiver<SourceRecord>,
    pub resolver: Arc<dyn PolygonResolver>,
    pub sink: OutputSink,
    pub retry: RetryPolicy,
    /// Bound on a single resolver call
    pub call_timeout: Duration,
    pub shutdown: CancellationToken,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    pub fn spawn(threads: usize, context: WorkerContext) -> Self {
        let handles = (0..threads.max(1))
            .map(|id| {
                let context = context.clone();
                tokio::spawn(async move { worker_loop(id, context).await })
            })
            .collect();

        info!(threads, "Worker pool started");
        Self { handles }
    }

    /// Wait for every worker. Returns the first fatal error any of them hit.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for joined in join_all(self.handles).await {
            let outcome = joined.unwrap_or_else(|e| Err(JoinError::Task(format!("worker: {e}"))));
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

async fn worker_loop(id: usize, context: WorkerContext) -> Result<()> {
    debug!(worker = id, "Worker started");

    loop {
        let record = tokio::select! {
            biased;
            _ = context.shutdown.cancelled() => break,
            next = context.queue.recv() => match next {
                Ok(record) => record,
                Err(_) => break,
            },
        };

        let outcome = match resolve_record(&context, record).await {
            Ok(result) => context.sink.write(result).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            error!(worker = id, error = %e, "Worker stopping on fatal error");
            context.shutdown.cancel();
            return Err(e);
        }
    }

    debug!(worker = id, "Worker finished");
    Ok(())
}

/// Turn a record into its resolution result. Only fatal errors are returned;
/// per-record failures become errored results.
async fn resolve_record(context: &WorkerContext, record: SourceRecord) -> Result<ResolutionResult> {
    let Some(point) = record.point else {
        return Ok(ResolutionResult::errored(record));
    };

    let resolver = &*context.resolver;
    let call_timeout = context.call_timeout;
    let resolved = context
        .retry
        .run("resolve point", || async move {
            tokio::time::timeout(call_timeout, resolver.resolve(&point))
                .await
                .unwrap_or_else(|_| {
                    Err(JoinError::resolver_unavailable(format!(
                        "no response within {}s",
                        call_timeout.as_secs_f64()
                    )))
                })
        })
        .await;

    match resolved {
        Ok(Some(reference_id)) => Ok(ResolutionResult::matched(record, reference_id)),
        Ok(None) => Ok(ResolutionResult::unmatched(record)),
        Err(e) if !e.is_fatal() => {
            warn!(source_id = %record.source_id, %point, error = %e, "Recording errored link");
            Ok(ResolutionResult::errored(record))
        },
        Err(e) => Err(e),
    }
}
