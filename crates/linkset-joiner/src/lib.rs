//! Linkset Joiner Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Builds a linkset between a driving dataset of point records and a
//! reference dataset of polygons served over WFS. Each driving record becomes
//! exactly one `link_id,source_id,reference_id` row.
//!
//! # Record Sources
//!
//! - **DatabaseModel**: paginated SQL query against PostgreSQL (G-NAF by default)
//! - **RegisterModel**: Linked Data API register listing plus per-item geometry
//!
//! # Example
//!
//! ```no_run
//! use linkset_joiner::{config::JoinerConfig, Joiner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = JoinerConfig::load("joiner.config")?;
//!     let outcome = Joiner::from_config(config).await?.run().await?;
//!     println!("{}", outcome.summary);
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod config;
pub mod cursor;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod writer;

pub use error::{JoinError, Result};
pub use pipeline::{Joiner, RunOutcome};
