/// Error types shared across the matching-engine crates.
///
/// These errors represent failures in infrastructure components (Redis, vector DB,
/// embedding provider) that sit below the engine itself. Engine-specific errors are
/// defined in the engine crate and wrap `CommonError` via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("vector db error: {0}")]
    VectorDb(String),

    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("embedding provider unavailable: {0}")]
    UpstreamUnavailable(String),
}
