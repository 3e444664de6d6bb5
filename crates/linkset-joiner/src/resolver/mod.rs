//! Polygon resolution
//!
//! A resolver answers one question: which reference polygon, if any, does this
//! point fall in? The only production implementation queries an OGC Web
//! Feature Service; tests substitute in-memory resolvers.

pub mod gml;
pub mod wfs;

use async_trait::async_trait;
use linkset_common::Point;

use crate::error::{JoinError, Result};

pub use gml::{extract_feature_identifier, FeatureSelector};
pub use wfs::WfsResolver;

/// Resolve a point to the identifier of the reference feature that satisfies
/// the configured spatial predicate.
#[async_trait]
pub trait PolygonResolver: Send + Sync {
    /// `Ok(None)` means no feature matched, which is not an error.
    ///
    /// Implementations make a single attempt; retries and timeouts are applied
    /// by the worker pool.
    async fn resolve(&self, point: &Point) -> Result<Option<String>>;
}

/// OGC Filter Encoding 1.0 binary spatial operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialFunction {
    Equals,
    Disjoint,
    Touches,
    Within,
    Overlaps,
    Crosses,
    Intersects,
    Contains,
}

impl SpatialFunction {
    /// Element name used inside the `<Filter>` document
    pub fn as_str(&self) -> &str {
        match self {
            SpatialFunction::Equals => "Equals",
            SpatialFunction::Disjoint => "Disjoint",
            SpatialFunction::Touches => "Touches",
            SpatialFunction::Within => "Within",
            SpatialFunction::Overlaps => "Overlaps",
            SpatialFunction::Crosses => "Crosses",
            SpatialFunction::Intersects => "Intersects",
            SpatialFunction::Contains => "Contains",
        }
    }
}

impl std::str::FromStr for SpatialFunction {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "equals" => Ok(SpatialFunction::Equals),
            "disjoint" => Ok(SpatialFunction::Disjoint),
            "touches" => Ok(SpatialFunction::Touches),
            "within" => Ok(SpatialFunction::Within),
            "overlaps" => Ok(SpatialFunction::Overlaps),
            "crosses" => Ok(SpatialFunction::Crosses),
            "intersects" => Ok(SpatialFunction::Intersects),
            "contains" => Ok(SpatialFunction::Contains),
            other => Err(JoinError::config(format!("Unsupported spatial function '{other}'"))),
        }
    }
}

impl std::fmt::Display for SpatialFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
