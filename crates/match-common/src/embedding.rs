/// Client for an OpenAI-compatible embedding provider (`POST {base}/embeddings`).
///
/// The provider is a rate-limited network service, so every call carries a strict
/// per-request timeout and a small bounded retry budget with exponential backoff
/// and jitter. Once the budget is exhausted the caller is expected to degrade
/// (keyword-only search) rather than fail the request.
///
/// Every returned vector is validated against the configured dimension; a
/// mismatch is a provider bug surfaced as `CommonError::Embedding`.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CommonError;

#[derive(Clone, Debug)]
pub struct EmbeddingClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Maximum number of texts sent per provider call.
    pub max_batch_size: usize,
}

impl EmbeddingClientConfig {
    pub fn from_env() -> Self {
        let base_url = std::env::var("EMBEDDING_BASE_URL")
            .unwrap_or_else(|_| "http://ai:8001/v1".to_string());

        let api_key = std::env::var("EMBEDDING_API_KEY").ok();

        let model = std::env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        let dimensions = std::env::var("EMBEDDING_DIMENSIONS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(1536);

        let timeout = std::env::var("EMBEDDING_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(10));

        let max_retries = std::env::var("EMBEDDING_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(2);

        let initial_backoff = std::env::var("EMBEDDING_RETRY_INITIAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(200));

        let max_backoff = std::env::var("EMBEDDING_RETRY_MAX_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(2_000));

        let max_batch_size = std::env::var("EMBEDDING_MAX_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(64);

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dimensions,
            timeout,
            max_retries,
            initial_backoff,
            max_backoff,
            max_batch_size,
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingClient {
    config: EmbeddingClientConfig,
    http: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingClientConfig) -> Result<Self, CommonError> {
        let http = reqwest::Client::builder()
            .user_agent("incentive-engine/embedding")
            .build()
            .map_err(|e| CommonError::Embedding(format!("http client build failed: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn config(&self) -> &EmbeddingClientConfig {
        &self.config
    }

    /// Embed program documents for indexing. Texts are sent in batches of at most
    /// `max_batch_size` per provider call; vectors come back in input order.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.max_batch_size) {
            let vectors = self.embed_batch(chunk).await?;
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Embed a single search query.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError> {
        let mut vectors = self.embed_batch(&[query.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| CommonError::Embedding("provider returned no embedding".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.config.base_url);
        let request = EmbeddingRequest {
            model: self.config.model.clone(),
            input: texts.to_vec(),
        };

        let response = self
            .request_with_retry(|| {
                let req = request.clone();
                let url = url.clone();
                async move {
                    let mut builder = self.http.post(&url).timeout(self.config.timeout).json(&req);
                    if let Some(key) = &self.config.api_key {
                        builder = builder.bearer_auth(key);
                    }
                    let resp = builder.send().await.map_err(RequestError::Transport)?;
                    Self::parse_response(resp).await
                }
            })
            .await
            .map_err(|e| match e {
                RequestError::Transport(inner) => {
                    CommonError::UpstreamUnavailable(inner.to_string())
                }
                RequestError::Status { status, message } if retryable_status(status) => {
                    CommonError::UpstreamUnavailable(format!("status={status} message={message}"))
                }
                RequestError::Status { status, message } => {
                    CommonError::Embedding(format!("status={status} message={message}"))
                }
                RequestError::Decode(msg) => CommonError::Embedding(msg),
            })?;

        let mut rows: Vec<EmbeddingRow> = response.data;
        rows.sort_by_key(|r| r.index);
        if rows.len() != texts.len() {
            return Err(CommonError::Embedding(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                rows.len()
            )));
        }
        for row in &rows {
            if row.embedding.len() != self.config.dimensions {
                return Err(CommonError::Embedding(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.config.dimensions,
                    row.embedding.len()
                )));
            }
        }
        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }

    async fn parse_response(resp: reqwest::Response) -> Result<EmbeddingResponse, RequestError> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<EmbeddingResponse>()
                .await
                .map_err(|e| RequestError::Decode(format!("invalid response JSON: {e}")));
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .and_then(|env| env.error.message)
            .unwrap_or_else(|| truncate_body(&body));
        Err(RequestError::Status { status, message })
    }

    async fn request_with_retry<T, Fut, F>(&self, mut f: F) -> Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RequestError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt > self.config.max_retries || !should_retry(&e) {
                        return Err(e);
                    }
                    let delay = backoff_delay(
                        self.config.initial_backoff,
                        self.config.max_backoff,
                        attempt - 1,
                    );
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "embedding request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("provider returned error: status={status} message={message}")]
    Status { status: StatusCode, message: String },

    #[error("{0}")]
    Decode(String),
}

fn should_retry(err: &RequestError) -> bool {
    match err {
        RequestError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        RequestError::Status { status, .. } => retryable_status(*status),
        RequestError::Decode(_) => false,
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let mult = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let base_ms = initial.as_millis().saturating_mul(mult);
    let capped_ms = std::cmp::min(base_ms, max.as_millis()) as u64;
    let jitter_cap = std::cmp::max(1, capped_ms / 4);
    Duration::from_millis(capped_ms.saturating_add(pseudo_jitter_ms(jitter_cap)))
}

fn pseudo_jitter_ms(max_inclusive: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    (now.subsec_nanos() as u64) % (max_inclusive + 1)
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.chars().count() > MAX {
        format!("{}...", body.chars().take(MAX).collect::<String>())
    } else {
        body.to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorObject,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    message: Option<String>,
}
