//! Error types for the joiner
//!
//! Errors fall into three groups: transient I/O failures that are retried at
//! the boundary that raised them, per-record failures that are absorbed into an
//! errored row, and fatal failures that stop the run.

use thiserror::Error;

/// Result type alias for joiner operations
pub type Result<T> = std::result::Result<T, JoinError>;

#[derive(Error, Debug)]
pub enum JoinError {
    /// Missing or invalid configuration, detected before the run starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// The record source could not be reached
    #[error("Record source unavailable: {0}")]
    SourceUnavailable(String),

    /// The record source answered with a page that cannot be read
    #[error("Malformed record source response: {0}")]
    MalformedListing(String),

    /// A record's geometry could not be decoded
    #[error("Malformed record '{source_id}': {reason}")]
    MalformedRecord { source_id: String, reason: String },

    /// The spatial service could not be reached or answered with an error status
    #[error("Polygon resolver unavailable: {0}")]
    ResolverUnavailable(String),

    /// The spatial service answered with a document we could not interpret
    #[error("Failed to parse resolver response: {0}")]
    ResponseParse(String),

    /// Writing the linkset file failed
    #[error("Output I/O error: {0}")]
    OutputIo(#[source] std::io::Error),

    /// A pipeline task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),
}

impl JoinError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn malformed_listing(msg: impl Into<String>) -> Self {
        Self::MalformedListing(msg.into())
    }

    pub fn resolver_unavailable(msg: impl Into<String>) -> Self {
        Self::ResolverUnavailable(msg.into())
    }

    pub fn response_parse(msg: impl Into<String>) -> Self {
        Self::ResponseParse(msg.into())
    }

    /// Whether the operation that produced this error may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, JoinError::SourceUnavailable(_) | JoinError::ResolverUnavailable(_))
    }

    /// Whether this error must stop the run once retries are exhausted
    pub fn is_fatal(&self) -> bool {
        !matches!(self, JoinError::MalformedRecord { .. } | JoinError::ResponseParse(_))
    }
}

impl From<csv::Error> for JoinError {
    fn from(err: csv::Error) -> Self {
        match err.into_kind() {
            csv::ErrorKind::Io(io) => JoinError::OutputIo(io),
            other => JoinError::OutputIo(std::io::Error::other(format!("{other:?}"))),
        }
    }
}
