use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded explicitly from environment variables.
///
/// No defaults are assumed for paths — the caller must provide them.
/// Redis URL is optional; if absent, the engine runs without caching.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379"). `None` disables caching.
    pub redis_url: Option<String>,
    /// Filesystem path to the LanceDB data directory.
    pub lancedb_path: String,
    /// Filesystem path to the canonical program corpus (JSON array of records)
    /// produced by the ingestion pipeline.
    pub corpus_path: String,
    /// Overall per-request deadline for the recommend pipeline.
    pub request_deadline: Duration,
    /// Maximum candidates scored concurrently within one request.
    pub scoring_concurrency: usize,
    /// TTL for cached search results, in seconds.
    pub search_cache_ttl_secs: u64,
    /// Minimum eligibility score for a candidate to reach the stacking step.
    pub eligibility_floor: f64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `LANCEDB_PATH`: path to LanceDB data directory
    /// - `CORPUS_PATH`: path to the canonical program corpus JSON
    ///
    /// Optional:
    /// - `REDIS_URL`: Redis connection string (omit to disable caching)
    /// - `REQUEST_DEADLINE_SECS`: overall request deadline (default 15, clamped 5–30)
    /// - `SCORING_CONCURRENCY`: bounded scoring parallelism (default 8)
    /// - `SEARCH_CACHE_TTL_SECS`: search-result cache TTL (default 300)
    /// - `ELIGIBILITY_FLOOR`: minimum score for stacking candidates (default 40)
    pub fn from_env() -> Result<Self, AppError> {
        let lancedb_path = std::env::var("LANCEDB_PATH").map_err(|_| {
            AppError::Config("LANCEDB_PATH environment variable is required".to_string())
        })?;

        let corpus_path = std::env::var("CORPUS_PATH").map_err(|_| {
            AppError::Config("CORPUS_PATH environment variable is required".to_string())
        })?;

        if !std::path::Path::new(&corpus_path).exists() {
            return Err(AppError::Config(format!(
                "corpus file not found at {corpus_path}"
            )));
        }

        let redis_url = std::env::var("REDIS_URL").ok();

        let request_deadline = std::env::var("REQUEST_DEADLINE_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| secs.clamp(5, 30))
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(15));

        let scoring_concurrency = std::env::var("SCORING_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(8);

        let search_cache_ttl_secs = std::env::var("SEARCH_CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(300);

        let eligibility_floor = std::env::var("ELIGIBILITY_FLOOR")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|f| f.clamp(0.0, 100.0))
            .unwrap_or(40.0);

        Ok(Self {
            redis_url,
            lancedb_path,
            corpus_path,
            request_deadline,
            scoring_concurrency,
            search_cache_ttl_secs,
            eligibility_floor,
        })
    }
}
