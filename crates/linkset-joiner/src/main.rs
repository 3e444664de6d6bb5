//! Linkset Joiner - point-in-polygon linkset builder

use anyhow::{Context, Result};
use clap::Parser;
use linkset_common::logging::{init_logging, LogConfig, LogLevel};
use linkset_joiner::config::{JoinerConfig, Overrides, DEFAULT_CONFIG_PATH};
use linkset_joiner::Joiner;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "linkset-joiner")]
#[command(author, version, about = "Link point records to the polygons that contain them")]
struct Cli {
    /// INI file holding the [DEFAULT] options
    #[arg(short, long, env = "JOINER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// First page to fetch
    #[arg(long, env = "JOINER_START")]
    start: Option<u64>,

    /// Page to stop before
    #[arg(long, env = "JOINER_STOP")]
    stop: Option<u64>,

    /// Number of concurrent workers
    #[arg(short, long, env = "JOINER_THREADS")]
    threads: Option<usize>,

    /// First link id of this run
    #[arg(long, env = "JOINER_BATCH_ID")]
    batch_id: Option<u64>,

    /// Linkset file to append to
    #[arg(short, long, env = "JOINER_OUTPUT_FILE")]
    output_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            start: self.start,
            stop: self.stop,
            threads: self.threads,
            batch_id: self.batch_id,
            output_file: self.output_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("linkset-joiner")
        .build();

    // LOG_* variables take precedence over the flag
    let log_config = log_config.merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let config = JoinerConfig::load(&cli.config)
        .and_then(|config| config.with_overrides(cli.overrides()))
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;

    let joiner = Joiner::from_config(config)
        .await
        .context("Failed to prepare the run")?;
    let outcome = joiner.run().await.context("Failed to start the run")?;

    println!("{}", outcome.summary);
    if let (Some(first), Some(last)) = (outcome.summary.first_link_id, outcome.summary.last_link_id) {
        info!(first, last, "Link ids written");
    }

    match outcome.error {
        None => Ok(ExitCode::SUCCESS),
        Some(e) => {
            error!(error = %e, "Run ended early");
            eprintln!("Error: {e}");
            Ok(ExitCode::FAILURE)
        },
    }
}
