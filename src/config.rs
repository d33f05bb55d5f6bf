//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base directory for the persisted job/conversation files.
    pub base_dir: PathBuf,
    /// Output bucket directory holding produced PDFs.
    pub bucket_dir: PathBuf,
    /// Per-job audit directory root (source + metadata sidecars).
    pub generated_dir: PathBuf,
    /// Number of worker tasks draining the job channel.
    pub workers: usize,
    /// Bounded capacity of the job channel.
    pub queue_capacity: usize,
    /// Bounded capacity of the status-update channel.
    pub status_capacity: usize,
    /// Default retry budget for newly created jobs.
    pub default_max_retries: u32,
    /// Timeout for a single text-generation call.
    pub generation_timeout: Duration,
    /// Timeout for a single typesetter invocation. Compiles can run for
    /// minutes on large documents.
    pub compile_timeout: Duration,
    /// Timeout for the web-search enrichment fetch.
    pub enrichment_timeout: Duration,
    /// How many search results the enrichment fetch may extract.
    pub search_result_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./storage"),
            bucket_dir: PathBuf::from("./storage/bucket"),
            generated_dir: PathBuf::from("./generated"),
            workers: 2,
            queue_capacity: 100,
            status_capacity: 100,
            default_max_retries: 3,
            generation_timeout: Duration::from_secs(120),
            compile_timeout: Duration::from_secs(600),
            enrichment_timeout: Duration::from_secs(30),
            search_result_limit: 3,
        }
    }
}

impl PipelineConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_dir: env_path("SHEETPIPE_BASE_DIR", defaults.base_dir),
            bucket_dir: env_path("SHEETPIPE_BUCKET_DIR", defaults.bucket_dir),
            generated_dir: env_path("SHEETPIPE_GENERATED_DIR", defaults.generated_dir),
            workers: env_parse("SHEETPIPE_WORKERS", defaults.workers),
            queue_capacity: env_parse("SHEETPIPE_QUEUE_CAPACITY", defaults.queue_capacity),
            status_capacity: env_parse("SHEETPIPE_STATUS_CAPACITY", defaults.status_capacity),
            default_max_retries: env_parse("SHEETPIPE_MAX_RETRIES", defaults.default_max_retries),
            generation_timeout: env_secs("SHEETPIPE_GENERATION_TIMEOUT", defaults.generation_timeout),
            compile_timeout: env_secs("SHEETPIPE_COMPILE_TIMEOUT", defaults.compile_timeout),
            enrichment_timeout: env_secs("SHEETPIPE_ENRICHMENT_TIMEOUT", defaults.enrichment_timeout),
            search_result_limit: env_parse("SHEETPIPE_SEARCH_LIMIT", defaults.search_result_limit),
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
