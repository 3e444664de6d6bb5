//! Records flowing through the linkset pipeline

use crate::error::{LinksetError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static WKT_POINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"POINT\s*\(\s*(-?\d+(?:\.\d+)?)\s+(-?\d+(?:\.\d+)?)\s*\)")
        .unwrap_or_else(|e| unreachable!("static WKT pattern is valid: {e}"))
});

/// A point geometry, `x` is longitude and `y` latitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Extract the first `POINT(x y)` literal from a block of text.
    ///
    /// Register documents embed the geometry inside JSON-LD or Turtle, often
    /// prefixed with a CRS IRI, so the literal is searched for rather than
    /// parsed from the start of the input.
    pub fn from_wkt(text: &str) -> Result<Self> {
        let captures = WKT_POINT
            .captures(text)
            .ok_or_else(|| LinksetError::InvalidGeometry("no POINT literal found".to_string()))?;

        let coordinate = |index: usize| -> Result<f64> {
            captures
                .get(index)
                .map(|m| m.as_str())
                .ok_or_else(|| LinksetError::InvalidGeometry("incomplete POINT literal".to_string()))?
                .parse::<f64>()
                .map_err(|e| LinksetError::InvalidGeometry(e.to_string()))
        };

        Ok(Self::new(coordinate(1)?, coordinate(2)?))
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// A driving-dataset record awaiting resolution.
///
/// `point` is `None` when the source could not decode the record's geometry;
/// the record still travels through the pipeline so it gets a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub point: Option<Point>,
    /// Page index the record was read from
    pub page: u64,
}

impl SourceRecord {
    pub fn new(source_id: impl Into<String>, point: Point, page: u64) -> Self {
        Self {
            source_id: source_id.into(),
            point: Some(point),
            page,
        }
    }

    /// Placeholder for a record whose geometry could not be read
    pub fn malformed(source_id: impl Into<String>, page: u64) -> Self {
        Self {
            source_id: source_id.into(),
            point: None,
            page,
        }
    }
}

/// Outcome of resolving one record against the reference dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Matched,
    Unmatched,
    Errored,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ResolutionStatus::Matched => "matched",
            ResolutionStatus::Unmatched => "unmatched",
            ResolutionStatus::Errored => "errored",
        }
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub source_id: String,
    pub reference_id: Option<String>,
    pub status: ResolutionStatus,
    pub page: u64,
}

impl ResolutionResult {
    pub fn matched(record: SourceRecord, reference_id: impl Into<String>) -> Self {
        Self {
            source_id: record.source_id,
            reference_id: Some(reference_id.into()),
            status: ResolutionStatus::Matched,
            page: record.page,
        }
    }

    pub fn unmatched(record: SourceRecord) -> Self {
        Self {
            source_id: record.source_id,
            reference_id: None,
            status: ResolutionStatus::Unmatched,
            page: record.page,
        }
    }

    pub fn errored(record: SourceRecord) -> Self {
        Self {
            source_id: record.source_id,
            reference_id: None,
            status: ResolutionStatus::Errored,
            page: record.page,
        }
    }
}

/// One row of the linkset file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub link_id: u64,
    pub source_id: String,
    /// Empty when the record was unmatched or errored
    pub reference_id: String,
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub processed: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub errored: u64,
    pub first_link_id: Option<u64>,
    pub last_link_id: Option<u64>,
}

impl RunSummary {
    /// Account for a row that has been written
    pub fn record(&mut self, link: &LinkRecord, status: ResolutionStatus) {
        self.processed += 1;
        match status {
            ResolutionStatus::Matched => self.matched += 1,
            ResolutionStatus::Unmatched => self.unmatched += 1,
            ResolutionStatus::Errored => self.errored += 1,
        }
        self.first_link_id.get_or_insert(link.link_id);
        self.last_link_id = Some(link.link_id);
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} matched={} unmatched={} errored={}",
            self.processed, self.matched, self.unmatched, self.errored
        )
    }
}
