//! Resumable page cursor
//!
//! The cursor holds the lowest page index that has not been completely written,
//! the source ids already written for that page and the pages after it, and the
//! next link id. A later run starts at the stored page, skips those ids and
//! continues the link id sequence, so a run aborted halfway through a page
//! resumes without duplicating rows.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{JoinError, Result};

/// Contents of the cursor file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Lowest page not completely written
    pub page: u64,
    /// Link id the next row receives
    pub next_link_id: u64,
    /// Length of the output file when the state was stored
    pub output_len: u64,
    /// Source ids written for `page` and later pages
    #[serde(default)]
    pub written: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct PendingPage {
    remaining: usize,
    written: Vec<String>,
}

/// Outstanding record counts per page, tracked by the output writer
#[derive(Debug, Clone)]
pub struct PageProgress {
    pending: BTreeMap<u64, PendingPage>,
    /// Ids written by an earlier run whose page has not been fetched again yet
    carried: BTreeSet<String>,
    watermark: u64,
}

impl PageProgress {
    pub fn new(start: u64) -> Self {
        Self {
            pending: BTreeMap::new(),
            carried: BTreeSet::new(),
            watermark: start,
        }
    }

    /// Progress continuing an earlier run that already wrote `written`
    pub fn resumed(start: u64, written: impl IntoIterator<Item = String>) -> Self {
        Self {
            carried: written.into_iter().collect(),
            ..Self::new(start)
        }
    }

    /// Lowest page not yet completely written
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Announce that `records` rows belong to `page`, besides the `skipped`
    /// ones an earlier run already wrote. Pages are registered in increasing
    /// order before any of their rows are written.
    pub fn register(&mut self, page: u64, records: usize, skipped: Vec<String>) -> Option<u64> {
        for id in &skipped {
            self.carried.remove(id);
        }
        self.pending.insert(
            page,
            PendingPage {
                remaining: records,
                written: skipped,
            },
        );
        self.advance()
    }

    /// Account for one written row. Returns the new watermark when it moved.
    pub fn complete(&mut self, page: u64, source_id: &str) -> Option<u64> {
        if let Some(pending) = self.pending.get_mut(&page) {
            pending.remaining = pending.remaining.saturating_sub(1);
            pending.written.push(source_id.to_string());
        }
        self.advance()
    }

    /// Source ids written at or above the watermark
    pub fn written(&self) -> Vec<String> {
        self.carried
            .iter()
            .chain(self.pending.values().flat_map(|pending| pending.written.iter()))
            .cloned()
            .collect()
    }

    fn advance(&mut self) -> Option<u64> {
        let before = self.watermark;
        while let Some((&page, pending)) = self.pending.first_key_value() {
            if pending.remaining > 0 {
                break;
            }
            self.pending.remove(&page);
            self.watermark = self.watermark.max(page + 1);
        }
        (self.watermark != before).then_some(self.watermark)
    }
}

/// Page cursor persisted between runs
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Stored state, `None` when no run has recorded one yet
    pub fn read(&self) -> Result<Option<CursorState>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(JoinError::OutputIo(e)),
        };

        serde_json::from_str(&contents).map(Some).map_err(|e| {
            JoinError::config(format!(
                "Corrupt cursor file {}: {e}",
                self.path.display()
            ))
        })
    }

    /// Stored state, extended with rows appended to `output` after it was
    /// stored. Those rows were durable before the run that wrote them could
    /// record them.
    pub fn resume(&self, output: &Path) -> Result<Option<CursorState>> {
        let Some(mut state) = self.read()? else {
            return Ok(None);
        };

        let mut file = match File::open(output) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Some(state)),
            Err(e) => return Err(JoinError::OutputIo(e)),
        };
        let len = file.metadata().map_err(JoinError::OutputIo)?.len();
        if len < state.output_len {
            warn!(
                path = %output.display(),
                len,
                recorded = state.output_len,
                "Output is shorter than the cursor recorded"
            );
        }
        if len <= state.output_len {
            return Ok(Some(state));
        }

        file.seek(SeekFrom::Start(state.output_len))
            .map_err(JoinError::OutputIo)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut unrecorded = 0usize;
        for record in reader.records() {
            let record = record?;
            let (Some(link_id), Some(source_id)) =
                (record.get(0).and_then(|id| id.parse::<u64>().ok()), record.get(1))
            else {
                continue;
            };
            state.next_link_id = state.next_link_id.max(link_id + 1);
            state.written.push(source_id.to_string());
            unrecorded += 1;
        }

        if unrecorded > 0 {
            warn!(rows = unrecorded, path = %output.display(), "Output has rows the cursor did not record");
        }
        state.output_len = len;
        Ok(Some(state))
    }

    /// Replace the stored state. It is written to a sibling temporary file and
    /// renamed over the cursor so readers never see a partial value.
    pub fn store(&self, state: &CursorState) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let contents = serde_json::to_vec(state)
            .map_err(|e| JoinError::OutputIo(std::io::Error::other(e)))?;
        let mut file = File::create(&tmp).map_err(JoinError::OutputIo)?;
        file.write_all(&contents).map_err(JoinError::OutputIo)?;
        file.sync_all().map_err(JoinError::OutputIo)?;
        fs::rename(&tmp, &self.path).map_err(JoinError::OutputIo)?;

        debug!(page = state.page, written = state.written.len(), path = %self.path.display(), "Stored page cursor");
        Ok(())
    }
}
