use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Structural filters applied before either retrieval leg runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchFilters {
    /// Two-letter state code, e.g. "NY". Matches federal programs too.
    pub state: Option<String>,
    /// Sector tag, e.g. "real-estate" or "clean-energy".
    pub sector: Option<String>,
    /// Program status, e.g. "active". Omit to search all statuses.
    pub status: Option<String>,
}

/// One ranked hit from hybrid search.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProgramSearchResult {
    pub program_id: String,
    pub name: String,
    /// Blended score: `w * semantic + (1 - w) * keyword`.
    pub score: f32,
    pub semantic_score: f32,
    pub keyword_score: f32,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchResponse {
    pub results: Vec<ProgramSearchResult>,
    /// True when the embedding provider was unavailable and only the keyword
    /// leg contributed.
    pub degraded: bool,
    /// True when a timeout cut the result set short.
    pub truncated: bool,
}

/// Per-item failure inside a batch operation. Batch calls never abort on a
/// single bad item; failures are collected here instead.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchItemError {
    /// Zero-based index of the failing item in the request.
    pub index: usize,
    pub message: String,
}
