//! Command-line entry points.

use std::time::Duration;

use clap::Args;

use crate::{
    blob_store::fs::FsBlobStore, engines::EngineOpts, handler::PoolSettings,
    prelude::*, scheduler::SchedulerConfig,
};

pub mod images;
pub mod ocr;
pub mod schema;

/// Options for the OCR worker pool.
#[derive(Debug, Clone, Args)]
pub struct PoolOpts {
    /// Number of OCR workers to start.
    #[clap(short = 'w', long = "workers", env = "OCR_POOL_WORKERS")]
    pub worker_count: Option<usize>,

    /// Languages to load, primary first.
    #[clap(
        short = 'l',
        long = "lang",
        env = "OCR_POOL_LANGUAGES",
        value_delimiter = ',',
        default_value = "eng"
    )]
    pub languages: Vec<String>,

    /// Give up on an image after this many seconds, and replace the worker
    /// that was processing it if `--replace-failed-workers` is set.
    #[clap(long = "timeout", env = "OCR_POOL_TIMEOUT", value_parser = parse_seconds)]
    pub timeout: Option<Duration>,

    /// Start a new worker whenever one fails while processing an image.
    #[clap(long)]
    pub replace_failed_workers: bool,

    /// How many times to retry an image after a recognition error, timeout or
    /// worker failure.
    #[clap(long, default_value = "0")]
    pub retries: usize,

    #[clap(flatten)]
    pub engine: EngineOpts,
}

impl PoolOpts {
    /// Pool settings, using `default_workers` if no worker count was given.
    pub fn settings(&self, default_workers: usize) -> PoolSettings {
        PoolSettings {
            workers: self.worker_count.unwrap_or(default_workers),
            languages: self.languages.clone(),
            config: SchedulerConfig {
                recognize_timeout: self.timeout,
                replace_failed_workers: self.replace_failed_workers,
            },
            retries: self.retries,
        }
    }
}

/// Where we keep uploaded images.
#[derive(Debug, Clone, Args)]
pub struct StoreOpts {
    /// Directory holding uploaded images.
    #[clap(long, env = "OCR_POOL_STORE_DIR", default_value = "images")]
    pub store_dir: PathBuf,
}

impl StoreOpts {
    /// Open our blob store.
    pub fn open(&self) -> Result<FsBlobStore> {
        FsBlobStore::new(&self.store_dir)
    }
}

/// Parse a (possibly fractional) number of seconds.
fn parse_seconds(s: &str) -> Result<Duration, String> {
    let seconds = s
        .parse::<f64>()
        .map_err(|err| format!("invalid number of seconds: {err}"))?;
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|duration| !duration.is_zero())
        .ok_or_else(|| format!("timeout must be a positive number of seconds, got {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_timeouts() {
        assert_eq!(parse_seconds("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_seconds("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_seconds("0").is_err());
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
    }
}
