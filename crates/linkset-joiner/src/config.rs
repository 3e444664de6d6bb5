//! Joiner configuration
//!
//! Settings are read once, before the run starts, from an INI file whose
//! options live in the `[DEFAULT]` section:
//!
//! ```ini
//! [DEFAULT]
//! endpoint = http://geofabricld.net/geoserver/ows
//! layer = ahgf_shcatch:AHGFCatchment
//! geom = shape
//! layerid = ahgf_shcatch:hydroid
//! nsshort = ahgf_shcatch
//! nsurl = http://linked.data.gov.au/dataset/geof/v2/ahgf_shcatch
//! function = Contains
//! register_model = RegisterModel
//! register_endpoint = http://linked.data.gov.au/dataset/gnaf/address/
//! start = 0
//! stop = 100
//! batch_size = 50
//! output_file = linkset.csv
//! threads = 8
//! batch_id = 1
//! ```
//!
//! The resulting [`JoinerConfig`] is immutable for the lifetime of the run.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{JoinError, Result};
use crate::resolver::SpatialFunction;
use crate::retry::{RetryPolicy, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_MS};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Config file read when no path is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "joiner.config";

/// Spatial reference system of the driving points (GDA94).
pub const DEFAULT_SRS_NAME: &str = "EPSG:4283";

/// Per-call timeout for source and resolver requests in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Consecutive empty pages tolerated inside a bounded range before stopping.
pub const DEFAULT_MAX_EMPTY_PAGES: u32 = 3;

/// Concurrent per-item geometry fetches for the register model.
pub const DEFAULT_POINT_CONCURRENCY: usize = 8;

/// Paginated G-NAF query returning `(source_id, longitude, latitude)`.
pub const DEFAULT_PAGE_QUERY: &str = "\
SELECT ad.address_detail_pid, g.longitude::float8, g.latitude::float8 \
FROM gnaf.address_detail ad \
LEFT JOIN gnaf.address_default_geocode g ON g.address_detail_pid = ad.address_detail_pid \
ORDER BY ad.address_detail_pid \
LIMIT $1 OFFSET $2";

/// Which record source backs the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// PostgreSQL database queried page by page
    Database,
    /// Linked Data API register with paginated listings
    Register,
}

impl std::str::FromStr for ModelKind {
    type Err = JoinError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "databasemodel" | "dbmodel" | "database" => Ok(ModelKind::Database),
            "registermodel" | "ldapimodel" | "register" => Ok(ModelKind::Register),
            other => Err(JoinError::config(format!(
                "Unknown register_model '{other}', expected DatabaseModel or RegisterModel"
            ))),
        }
    }
}

/// Spatial web service parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonConfig {
    pub endpoint: String,
    /// Qualified feature type, e.g. `ahgf_shcatch:AHGFCatchment`
    pub layer: String,
    pub geometry_field: String,
    /// Qualified identifier element, e.g. `ahgf_shcatch:hydroid`
    pub layer_id: String,
    pub ns_short: String,
    pub ns_url: String,
    pub function: SpatialFunction,
    pub srs_name: String,
    pub timeout: Duration,
}

/// Record source parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub kind: ModelKind,
    /// Connection string for the database model, listing URL for the register model
    pub endpoint: String,
    pub page_query: String,
    pub point_concurrency: usize,
    pub timeout: Duration,
}

/// Paging, concurrency and output parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub start: u64,
    /// Exclusive upper page bound; `None` runs until the source is exhausted
    pub stop: Option<u64>,
    pub batch_size: u64,
    pub output_file: PathBuf,
    pub cursor_file: Option<PathBuf>,
    pub threads: usize,
    /// First link id handed out in this run
    pub batch_id: u64,
    pub max_empty_pages: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinerConfig {
    pub polygon: PolygonConfig,
    pub model: ModelConfig,
    pub run: RunConfig,
    pub retry: RetryPolicy,
}

/// Options exactly as they appear in the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSettings {
    pub endpoint: Option<String>,
    pub geom: Option<String>,
    pub layer: Option<String>,
    pub layerid: Option<String>,
    pub nsshort: Option<String>,
    pub nsurl: Option<String>,
    pub function: Option<String>,
    pub srs_name: Option<String>,
    pub timeout_secs: Option<String>,
    pub register_model: Option<String>,
    pub register_endpoint: Option<String>,
    pub page_query: Option<String>,
    pub point_concurrency: Option<String>,
    pub start: Option<String>,
    pub stop: Option<String>,
    pub batch_size: Option<String>,
    pub max_empty_pages: Option<String>,
    pub output_file: Option<String>,
    pub cursor_file: Option<String>,
    pub threads: Option<String>,
    pub batch_id: Option<String>,
    pub max_retries: Option<String>,
    pub backoff_ms: Option<String>,
    pub max_backoff_ms: Option<String>,
}

/// Command line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub start: Option<u64>,
    pub stop: Option<u64>,
    pub threads: Option<usize>,
    pub batch_id: Option<u64>,
    pub output_file: Option<PathBuf>,
}

fn required(value: Option<String>, key: &str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| JoinError::config(format!("Missing required option '{key}'")))
}

fn optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_number<T>(value: Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional(value)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| JoinError::config(format!("Invalid value '{v}' for '{key}': {e}")))
        })
        .transpose()
}

fn check_prefix(qualified: &str, ns_short: &str, key: &str) -> Result<()> {
    if let Some((prefix, _)) = qualified.split_once(':') {
        if prefix != ns_short {
            return Err(JoinError::config(format!(
                "'{key}' uses namespace prefix '{prefix}' but nsshort is '{ns_short}'"
            )));
        }
    }
    Ok(())
}

impl JoinerConfig {
    /// Read and validate the INI file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Ini)
                    .required(true),
            )
            .build()
            .map_err(|e| JoinError::config(format!("Failed to read {}: {e}", path.display())))?;

        let sections: HashMap<String, config::Value> = settings
            .try_deserialize()
            .map_err(|e| JoinError::config(format!("Invalid config file {}: {e}", path.display())))?;

        let section = sections
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("default"))
            .map(|(_, value)| value)
            .ok_or_else(|| {
                JoinError::config(format!("{} has no [DEFAULT] section", path.display()))
            })?;

        let raw: RawSettings = section
            .try_deserialize()
            .map_err(|e| JoinError::config(format!("Invalid [DEFAULT] section: {e}")))?;

        Self::from_settings(raw)
    }

    /// Build a validated configuration from raw file options
    pub fn from_settings(raw: RawSettings) -> Result<Self> {
        let timeout = Duration::from_secs(
            parse_number(raw.timeout_secs, "timeout_secs")?.unwrap_or(DEFAULT_TIMEOUT_SECS),
        );

        let function = required(raw.function, "function")?.parse::<SpatialFunction>()?;

        let polygon = PolygonConfig {
            endpoint: required(raw.endpoint, "endpoint")?,
            layer: required(raw.layer, "layer")?,
            geometry_field: required(raw.geom, "geom")?,
            layer_id: required(raw.layerid, "layerid")?,
            ns_short: required(raw.nsshort, "nsshort")?,
            ns_url: required(raw.nsurl, "nsurl")?,
            function,
            srs_name: optional(raw.srs_name).unwrap_or_else(|| DEFAULT_SRS_NAME.to_string()),
            timeout,
        };

        let model = ModelConfig {
            kind: required(raw.register_model, "register_model")?.parse()?,
            endpoint: required(raw.register_endpoint, "register_endpoint")?,
            page_query: optional(raw.page_query).unwrap_or_else(|| DEFAULT_PAGE_QUERY.to_string()),
            point_concurrency: parse_number(raw.point_concurrency, "point_concurrency")?
                .unwrap_or(DEFAULT_POINT_CONCURRENCY),
            timeout,
        };

        let run = RunConfig {
            start: parse_number(raw.start, "start")?.unwrap_or(0),
            stop: parse_number(raw.stop, "stop")?,
            batch_size: parse_number(raw.batch_size, "batch_size")?
                .ok_or_else(|| JoinError::config("Missing required option 'batch_size'"))?,
            output_file: PathBuf::from(required(raw.output_file, "output_file")?),
            cursor_file: optional(raw.cursor_file).map(PathBuf::from),
            threads: parse_number(raw.threads, "threads")?
                .ok_or_else(|| JoinError::config("Missing required option 'threads'"))?,
            batch_id: parse_number(raw.batch_id, "batch_id")?
                .ok_or_else(|| JoinError::config("Missing required option 'batch_id'"))?,
            max_empty_pages: parse_number(raw.max_empty_pages, "max_empty_pages")?
                .unwrap_or(DEFAULT_MAX_EMPTY_PAGES),
        };

        let retry = RetryPolicy {
            max_attempts: parse_number::<u32>(raw.max_retries, "max_retries")?
                .map(|retries| retries.saturating_add(1))
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: Duration::from_millis(
                parse_number(raw.backoff_ms, "backoff_ms")?.unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(
                parse_number(raw.max_backoff_ms, "max_backoff_ms")?
                    .unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            ),
        };

        let config = Self {
            polygon,
            model,
            run,
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply command line overrides and re-validate
    pub fn with_overrides(mut self, overrides: Overrides) -> Result<Self> {
        if let Some(start) = overrides.start {
            self.run.start = start;
        }
        if let Some(stop) = overrides.stop {
            self.run.stop = Some(stop);
        }
        if let Some(threads) = overrides.threads {
            self.run.threads = threads;
        }
        if let Some(batch_id) = overrides.batch_id {
            self.run.batch_id = batch_id;
        }
        if let Some(output_file) = overrides.output_file {
            self.run.output_file = output_file;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.polygon.endpoint).map_err(|e| {
            JoinError::config(format!("Invalid endpoint '{}': {e}", self.polygon.endpoint))
        })?;
        reqwest::Url::parse(&self.polygon.ns_url).map_err(|e| {
            JoinError::config(format!("Invalid nsurl '{}': {e}", self.polygon.ns_url))
        })?;
        check_prefix(&self.polygon.layer, &self.polygon.ns_short, "layer")?;
        check_prefix(&self.polygon.layer_id, &self.polygon.ns_short, "layerid")?;

        if self.model.kind == ModelKind::Register {
            reqwest::Url::parse(&self.model.endpoint).map_err(|e| {
                JoinError::config(format!(
                    "Invalid register_endpoint '{}': {e}",
                    self.model.endpoint
                ))
            })?;
        }
        if self.model.point_concurrency == 0 {
            return Err(JoinError::config("point_concurrency must be greater than 0"));
        }

        if self.run.batch_size == 0 {
            return Err(JoinError::config("batch_size must be greater than 0"));
        }
        if self.run.threads == 0 {
            return Err(JoinError::config("threads must be greater than 0"));
        }
        if let Some(stop) = self.run.stop {
            if stop < self.run.start {
                return Err(JoinError::config(format!(
                    "stop ({stop}) cannot be lower than start ({})",
                    self.run.start
                )));
            }
        }
        if self.polygon.timeout.is_zero() {
            return Err(JoinError::config("timeout_secs must be greater than 0"));
        }

        Ok(())
    }
}
