//! Error types shared across the linkset workspace

use thiserror::Error;

/// Result type alias for linkset operations
pub type Result<T> = std::result::Result<T, LinksetError>;

/// Main error type for shared linkset functionality
#[derive(Error, Debug)]
pub enum LinksetError {
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
}
