/// Redis caching layer for the matching engine.
///
/// All operations degrade gracefully: if Redis is unavailable, callers fall
/// through to compute from source. TTLs are tunable policy; the load-bearing
/// rule is that the search namespace is invalidated whenever the corpus
/// changes.
///
/// Key schema (namespaced to avoid collisions):
/// - `im:v1:search:{sha256(query|filters|k|weight)}` — JSON `SearchResponse` (TTL)
/// - `im:v1:embed:{content_hash}` — JSON `Vec<f32>` (no TTL; content-addressed,
///   so a changed record hashes to a new key)
/// - `im:v1:index_version` — corpus version the LanceDB table was built from
use match_common::api::{SearchFilters, SearchResponse};
use match_common::redis::RedisCache;
use sha2::{Digest, Sha256};
use tracing::warn;

const KEY_PREFIX: &str = "im:v1:";
const SEARCH_PREFIX: &str = "im:v1:search:";

pub struct EngineCache {
    redis: RedisCache,
    search_ttl_secs: u64,
}

impl EngineCache {
    pub fn new(redis: RedisCache, search_ttl_secs: u64) -> Self {
        Self {
            redis,
            search_ttl_secs,
        }
    }

    // --- Search results ---

    pub async fn get_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        k: usize,
        weight_semantic: f32,
    ) -> Option<SearchResponse> {
        let key = search_key(query, filters, k, weight_semantic);
        let json = self.redis.get(&key).await?;
        serde_json::from_str(&json)
            .inspect_err(|e| warn!(error = %e, key, "cache deserialization failed"))
            .ok()
    }

    pub async fn set_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        k: usize,
        weight_semantic: f32,
        response: &SearchResponse,
    ) {
        let key = search_key(query, filters, k, weight_semantic);
        if let Ok(json) = serde_json::to_string(response) {
            self.redis
                .set_with_ttl(&key, &json, self.search_ttl_secs)
                .await;
        }
    }

    /// Drop every cached search result. Called after a reindex; corpus change
    /// invalidation is load-bearing, the TTL is not.
    pub async fn invalidate_search(&self) {
        self.redis.delete_by_prefix(SEARCH_PREFIX).await;
    }

    // --- Embedding vectors (content-addressed) ---

    /// Positional lookup of cached vectors for the given content hashes.
    /// `expected_dim` guards against provider/config drift: a stored vector of
    /// the wrong dimension is treated as a miss and logged.
    pub async fn get_embeddings(
        &self,
        content_hashes: &[String],
        expected_dim: usize,
    ) -> Vec<Option<Vec<f32>>> {
        let keys: Vec<String> = content_hashes
            .iter()
            .map(|h| format!("{KEY_PREFIX}embed:{h}"))
            .collect();
        self.redis
            .get_many(&keys)
            .await
            .into_iter()
            .zip(content_hashes)
            .map(|(json, hash)| {
                let vector: Vec<f32> = serde_json::from_str(&json?)
                    .inspect_err(|e| warn!(error = %e, hash, "cached embedding corrupt"))
                    .ok()?;
                if vector.len() != expected_dim {
                    warn!(
                        hash,
                        got = vector.len(),
                        expected = expected_dim,
                        "cached embedding has wrong dimension, discarding"
                    );
                    return None;
                }
                Some(vector)
            })
            .collect()
    }

    pub async fn set_embedding(&self, content_hash: &str, vector: &[f32]) {
        let key = format!("{KEY_PREFIX}embed:{content_hash}");
        if let Ok(json) = serde_json::to_string(vector) {
            self.redis.set(&key, &json).await;
        }
    }

    // --- Index version ---

    pub async fn get_index_version(&self) -> Option<String> {
        self.redis.get(&format!("{KEY_PREFIX}index_version")).await
    }

    pub async fn set_index_version(&self, version: &str) {
        self.redis
            .set(&format!("{KEY_PREFIX}index_version"), version)
            .await;
    }
}

/// Deterministic cache key for a search request using SHA-256.
fn search_key(query: &str, filters: &SearchFilters, k: usize, weight_semantic: f32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(b"|");
    hasher.update(filters.state.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(filters.sector.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(filters.status.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(k.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(weight_semantic.to_string().as_bytes());
    let hash = hasher.finalize();
    format!("{SEARCH_PREFIX}{hash:x}")
}
