//! Linkset output writer
//!
//! A single blocking task owns the output file. Workers submit results through
//! an [`OutputSink`] and wait for the acknowledgement, which is only sent once
//! the row has been flushed and synced to disk. Link ids are assigned inside
//! the writer, so ids in the file are strictly increasing from top to bottom.
//!
//! When a cursor file is configured it is rewritten after every page
//! registration and every row, so it always describes the rows on disk.

use linkset_common::{LinkRecord, ResolutionResult, RunSummary};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::assembler::LinkAssembler;
use crate::cursor::{CursorFile, CursorState, PageProgress};
use crate::error::{JoinError, Result};

enum WriterMessage {
    Page {
        page: u64,
        records: usize,
        skipped: Vec<String>,
    },
    Row {
        result: ResolutionResult,
        ack: oneshot::Sender<Result<LinkRecord>>,
    },
}

/// What the writer did before it stopped
#[derive(Debug)]
pub struct WriterReport {
    pub summary: RunSummary,
    /// First output failure; the writer stops accepting rows after it
    pub error: Option<JoinError>,
}

fn writer_stopped() -> JoinError {
    JoinError::OutputIo(std::io::Error::other("output writer has stopped"))
}

/// Copy of an output error for the worker waiting on the failed row
fn ack_error(err: &JoinError) -> JoinError {
    match err {
        JoinError::OutputIo(io) => JoinError::OutputIo(std::io::Error::new(io.kind(), io.to_string())),
        other => JoinError::OutputIo(std::io::Error::other(other.to_string())),
    }
}

/// Cloneable handle used by the scheduler and the workers
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<WriterMessage>,
}

impl OutputSink {
    /// Announce how many rows `page` will produce, and which of its records
    /// an earlier run already wrote. Must be called before any of the page's
    /// records are handed to workers.
    pub async fn register_page(&self, page: u64, records: usize, skipped: Vec<String>) -> Result<()> {
        self.tx
            .send(WriterMessage::Page {
                page,
                records,
                skipped,
            })
            .await
            .map_err(|_| writer_stopped())
    }

    /// Write one row and wait until it is durable
    pub async fn write(&self, result: ResolutionResult) -> Result<LinkRecord> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriterMessage::Row { result, ack })
            .await
            .map_err(|_| writer_stopped())?;
        done.await.map_err(|_| writer_stopped())?
    }
}

pub struct OutputWriter {
    path: PathBuf,
    csv: csv::Writer<File>,
    assembler: Arc<LinkAssembler>,
    progress: PageProgress,
    cursor: Option<CursorFile>,
}

impl OutputWriter {
    /// Open `path` for appending, creating it if needed. Existing rows are kept.
    pub fn open(
        path: impl AsRef<Path>,
        assembler: Arc<LinkAssembler>,
        progress: PageProgress,
        cursor: Option<CursorFile>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(JoinError::OutputIo)?;

        let csv = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        Ok(Self {
            path,
            csv,
            assembler,
            progress,
            cursor,
        })
    }

    /// Move the writer onto a blocking task
    pub fn spawn(self, capacity: usize) -> (OutputSink, JoinHandle<WriterReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::task::spawn_blocking(move || self.run(rx));
        (OutputSink { tx }, handle)
    }

    fn run(mut self, mut rx: mpsc::Receiver<WriterMessage>) -> WriterReport {
        info!(path = %self.path.display(), "Output writer started");
        let mut summary = RunSummary::default();

        while let Some(message) = rx.blocking_recv() {
            let outcome = match message {
                WriterMessage::Page {
                    page,
                    records,
                    skipped,
                } => {
                    if let Some(watermark) = self.progress.register(page, records, skipped) {
                        debug!(watermark, "Pages complete");
                    }
                    self.store_cursor()
                },
                WriterMessage::Row { result, ack } => {
                    let status = result.status;
                    let page = result.page;
                    match self.append(result) {
                        Ok(link) => {
                            summary.record(&link, status);
                            if let Some(watermark) = self.progress.complete(page, &link.source_id) {
                                debug!(watermark, "Pages complete");
                            }
                            let _ = ack.send(Ok(link));
                            self.store_cursor()
                        },
                        Err(e) => {
                            let _ = ack.send(Err(ack_error(&e)));
                            Err(e)
                        },
                    }
                },
            };

            if let Err(e) = outcome {
                error!(path = %self.path.display(), error = %e, "Output writer failed");
                return WriterReport {
                    summary,
                    error: Some(e),
                };
            }
        }

        info!(rows = summary.processed, "Output writer finished");
        WriterReport {
            summary,
            error: None,
        }
    }

    fn append(&mut self, result: ResolutionResult) -> Result<LinkRecord> {
        let link = self.assembler.assemble(result);
        self.csv.serialize(&link)?;
        self.csv.flush().map_err(JoinError::OutputIo)?;
        self.csv.get_ref().sync_data().map_err(JoinError::OutputIo)?;
        debug!(link_id = link.link_id, source_id = %link.source_id, "Row written");
        Ok(link)
    }

    fn store_cursor(&self) -> Result<()> {
        let Some(cursor) = &self.cursor else {
            return Ok(());
        };

        let output_len = self
            .csv
            .get_ref()
            .metadata()
            .map_err(JoinError::OutputIo)?
            .len();
        cursor.store(&CursorState {
            page: self.progress.watermark(),
            next_link_id: self.assembler.peek(),
            output_len,
            written: self.progress.written(),
        })
    }
}
