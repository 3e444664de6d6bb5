//! Linkset Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the linkset workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`LinksetError`] and the crate [`Result`] alias
//! - **Logging**: tracing subscriber configuration driven by environment variables
//! - **Types**: records flowing through the joiner pipeline ([`SourceRecord`],
//!   [`ResolutionResult`], [`LinkRecord`]) and the final [`RunSummary`]
//!
//! # Example
//!
//! ```no_run
//! use linkset_common::types::Point;
//!
//! let point = Point::from_wkt("<http://www.opengis.net/def/crs/EPSG/0/4283> POINT(149.1 -35.2)")?;
//! assert_eq!(point.x, 149.1);
//! # Ok::<(), linkset_common::LinksetError>(())
//! ```

pub mod error;
pub mod logging;
pub mod types;

pub use error::{LinksetError, Result};
pub use types::{
    LinkRecord, Point, ResolutionResult, ResolutionStatus, RunSummary, SourceRecord,
};
