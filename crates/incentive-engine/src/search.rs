/// Hybrid search over the program index.
///
/// Runs the semantic leg (embed the query, ANN search over embeddings) and the
/// keyword leg (BM25 full-text) concurrently, then merges them by weighted
/// score. Structural filters (state, sector, status) are compiled to a SQL
/// predicate pushed into both legs.
///
/// Failure handling is best-effort and self-describing: an embedding-provider
/// outage drops the semantic leg and flags `degraded`; an expired deadline
/// returns whatever was retrieved in time and flags `truncated`. Only both
/// legs failing is an error.
use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::{Array, Float32Array, RecordBatch, StringArray};
use tokio::time::Instant;
use tracing::{info, warn};

use match_common::api::{ProgramSearchResult, SearchFilters, SearchResponse};
use match_common::embedding::EmbeddingClient;
use match_common::vectordb::VectorDb;

use crate::cache::EngineCache;
use crate::error::AppError;
use crate::model::ProjectProfile;

pub const PROGRAM_TABLE: &str = "programs";
const MAX_SNIPPET_LEN: usize = 200;
const MAX_K: usize = 50;

pub struct SearchRequest {
    pub query_text: Option<String>,
    pub profile: Option<ProjectProfile>,
    pub filters: SearchFilters,
    pub k: usize,
    pub weight_semantic: f32,
}

pub struct HybridSearchEngine {
    embedder: Arc<EmbeddingClient>,
    vectordb: Arc<VectorDb>,
    cache: Arc<EngineCache>,
}

impl HybridSearchEngine {
    pub fn new(
        embedder: Arc<EmbeddingClient>,
        vectordb: Arc<VectorDb>,
        cache: Arc<EngineCache>,
    ) -> Self {
        Self {
            embedder,
            vectordb,
            cache,
        }
    }

    /// Execute a hybrid search. `deadline` bounds the whole call; on expiry
    /// the result is whatever completed in time, flagged `truncated`.
    pub async fn search(
        &self,
        request: &SearchRequest,
        deadline: Option<Instant>,
    ) -> Result<SearchResponse, AppError> {
        if request.k == 0 {
            return Err(AppError::Validation("k must be at least 1".to_string()));
        }
        let k = request.k.min(MAX_K);
        let weight = request.weight_semantic.clamp(0.0, 1.0);

        let query = compose_query(request.query_text.as_deref(), request.profile.as_ref())
            .ok_or_else(|| {
                AppError::Validation(
                    "search needs query_text or a non-empty project profile".to_string(),
                )
            })?;

        if let Some(cached) = self
            .cache
            .get_search(&query, &request.filters, k, weight)
            .await
        {
            info!(query = %query, "search cache hit");
            return Ok(cached);
        }

        let filter = build_filter(&request.filters);
        let filter_ref = filter.as_deref();

        let semantic_fut = self.semantic_leg(&query, filter_ref, k, deadline);
        let keyword_fut = self.keyword_leg(&query, filter_ref, k, deadline);
        let (semantic, keyword) = tokio::join!(semantic_fut, keyword_fut);

        let mut degraded = false;
        let mut truncated = false;

        let semantic_hits = match semantic {
            Ok(hits) => hits,
            Err(LegError::Expired) => {
                truncated = true;
                Vec::new()
            }
            Err(LegError::Failed(e)) => {
                warn!(error = %e, "semantic leg failed, degrading to keyword-only");
                degraded = true;
                Vec::new()
            }
        };
        let keyword_hits = match keyword {
            Ok(hits) => hits,
            Err(LegError::Expired) => {
                truncated = true;
                Vec::new()
            }
            Err(LegError::Failed(e)) => {
                if semantic_hits.is_empty() && !truncated {
                    return Err(e);
                }
                warn!(error = %e, "keyword leg failed, using semantic results only");
                degraded = true;
                Vec::new()
            }
        };

        let results = merge_hits(&semantic_hits, &keyword_hits, weight, k);
        let response = SearchResponse {
            results,
            degraded,
            truncated,
        };

        // Partial responses are not worth caching for the full TTL.
        if !degraded && !truncated {
            self.cache
                .set_search(&query, &request.filters, k, weight, &response)
                .await;
        }
        Ok(response)
    }

    async fn semantic_leg(
        &self,
        query: &str,
        filter: Option<&str>,
        k: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<RawHit>, LegError> {
        let embedding = with_deadline(deadline, self.embedder.embed_query(query))
            .await?
            .map_err(|e| LegError::Failed(AppError::Common(e)))?;
        let batches = with_deadline(
            deadline,
            self.vectordb
                .vector_search(PROGRAM_TABLE, &embedding, filter, k),
        )
        .await?
        .map_err(|e| LegError::Failed(AppError::Common(e)))?;
        Ok(extract_hits(&batches, ScoreColumn::Distance))
    }

    async fn keyword_leg(
        &self,
        query: &str,
        filter: Option<&str>,
        k: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<RawHit>, LegError> {
        let batches = with_deadline(
            deadline,
            self.vectordb
                .full_text_search(PROGRAM_TABLE, query, filter, k),
        )
        .await?
        .map_err(|e| LegError::Failed(AppError::Common(e)))?;
        Ok(extract_hits(&batches, ScoreColumn::Bm25))
    }
}

enum LegError {
    Failed(AppError),
    Expired,
}

async fn with_deadline<F, T>(deadline: Option<Instant>, fut: F) -> Result<T, LegError>
where
    F: std::future::Future<Output = T>,
{
    match deadline {
        None => Ok(fut.await),
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| LegError::Expired),
    }
}

/// Compose the retrieval query from explicit text, falling back to the
/// profile's structured fields and free-text intent.
pub fn compose_query(query_text: Option<&str>, profile: Option<&ProjectProfile>) -> Option<String> {
    if let Some(text) = query_text {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    let profile = profile?;
    let mut parts: Vec<String> = Vec::new();
    if let Some(sector) = &profile.sector {
        parts.push(format!("{sector} project"));
    }
    for tech in &profile.technologies {
        parts.push(tech.clone());
    }
    if let Some(state) = &profile.state {
        parts.push(format!("in {state}"));
    }
    if let Some(intent) = &profile.intent {
        let trimmed = intent.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Compile structural filters to a DataFusion SQL predicate. Programs with an
/// empty state/sector column are unconstrained and match any filter value.
pub fn build_filter(filters: &SearchFilters) -> Option<String> {
    let mut clauses: Vec<String> = Vec::new();
    if let Some(state) = &filters.state {
        clauses.push(format!("(state = '' OR state = '{}')", escape(state)));
    }
    if let Some(sector) = &filters.sector {
        clauses.push(format!("(sector = '' OR sector = '{}')", escape(sector)));
    }
    if let Some(status) = &filters.status {
        clauses.push(format!("status = '{}'", escape(status)));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

#[derive(Debug, Clone)]
pub struct RawHit {
    pub program_id: String,
    pub name: String,
    pub score: f32,
    pub snippet: String,
}

enum ScoreColumn {
    /// `_distance` from the ANN leg; converted to similarity `1 - d`, floored at 0.
    Distance,
    /// `_score` from the BM25 leg; normalized by the leg maximum after extraction.
    Bm25,
}

/// Merge the two ranked legs into the blended ranking.
///
/// Keyword scores are normalized by the leg maximum so both legs land in
/// [0, 1] before weighting. Duplicates keep the max per-leg scores. Ordering
/// is deterministic: score descending, program id ascending.
pub fn merge_hits(
    semantic: &[RawHit],
    keyword: &[RawHit],
    weight_semantic: f32,
    k: usize,
) -> Vec<ProgramSearchResult> {
    let keyword_max = keyword
        .iter()
        .map(|h| h.score)
        .fold(0.0_f32, f32::max)
        .max(f32::EPSILON);

    let mut merged: HashMap<String, ProgramSearchResult> = HashMap::new();
    for hit in semantic {
        let entry = merged
            .entry(hit.program_id.clone())
            .or_insert_with(|| empty_result(hit));
        entry.semantic_score = entry.semantic_score.max(hit.score);
    }
    for hit in keyword {
        let normalized = hit.score / keyword_max;
        let entry = merged
            .entry(hit.program_id.clone())
            .or_insert_with(|| empty_result(hit));
        entry.keyword_score = entry.keyword_score.max(normalized);
    }

    let mut results: Vec<ProgramSearchResult> = merged
        .into_values()
        .map(|mut r| {
            r.score = weight_semantic * r.semantic_score
                + (1.0 - weight_semantic) * r.keyword_score;
            r
        })
        .collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.program_id.cmp(&b.program_id))
    });
    results.truncate(k);
    results
}

fn empty_result(hit: &RawHit) -> ProgramSearchResult {
    ProgramSearchResult {
        program_id: hit.program_id.clone(),
        name: hit.name.clone(),
        score: 0.0,
        semantic_score: 0.0,
        keyword_score: 0.0,
        snippet: hit.snippet.clone(),
    }
}

/// Extract hits from LanceDB result batches.
///
/// Expected columns: id (Utf8), name (Utf8), text (Utf8), plus `_distance`
/// (ANN leg) or `_score` (BM25 leg).
fn extract_hits(batches: &[RecordBatch], score_column: ScoreColumn) -> Vec<RawHit> {
    let mut hits = Vec::new();

    for batch in batches {
        let num_rows = batch.num_rows();
        let schema = batch.schema();

        let id_col = get_string_column(batch, &schema, "id");
        let name_col = get_string_column(batch, &schema, "name");
        let text_col = get_string_column(batch, &schema, "text");

        let (Some(id_col), Some(name_col), Some(text_col)) = (id_col, name_col, text_col) else {
            warn!("search result batch missing expected columns");
            continue;
        };

        let raw_scores = match score_column {
            ScoreColumn::Distance => get_float_column(batch, &schema, "_distance"),
            ScoreColumn::Bm25 => get_float_column(batch, &schema, "_score"),
        };

        for row in 0..num_rows {
            let raw = raw_scores.map(|c| c.value(row)).unwrap_or(0.0);
            let score = match score_column {
                ScoreColumn::Distance => (1.0_f32 - raw).max(0.0),
                ScoreColumn::Bm25 => raw.max(0.0),
            };
            let text = text_col.value(row);
            let snippet = if text.chars().count() > MAX_SNIPPET_LEN {
                format!(
                    "{}...",
                    text.chars().take(MAX_SNIPPET_LEN).collect::<String>()
                )
            } else {
                text.to_string()
            };
            hits.push(RawHit {
                program_id: id_col.value(row).to_string(),
                name: name_col.value(row).to_string(),
                score,
                snippet,
            });
        }
    }

    hits
}

fn get_string_column<'a>(
    batch: &'a RecordBatch,
    schema: &arrow_schema::Schema,
    name: &str,
) -> Option<&'a StringArray> {
    let idx = schema.index_of(name).ok()?;
    batch.column(idx).as_any().downcast_ref::<StringArray>()
}

fn get_float_column<'a>(
    batch: &'a RecordBatch,
    schema: &arrow_schema::Schema,
    name: &str,
) -> Option<&'a Float32Array> {
    let idx = schema.index_of(name).ok()?;
    batch.column(idx).as_any().downcast_ref::<Float32Array>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> RawHit {
        RawHit {
            program_id: id.to_string(),
            name: format!("Program {id}"),
            score,
            snippet: String::new(),
        }
    }

    #[test]
    fn merge_weights_both_legs() {
        let semantic = vec![hit("a", 0.9), hit("b", 0.4)];
        let keyword = vec![hit("b", 10.0), hit("c", 5.0)];
        let results = merge_hits(&semantic, &keyword, 0.6, 10);

        let by_id: HashMap<&str, &ProgramSearchResult> = results
            .iter()
            .map(|r| (r.program_id.as_str(), r))
            .collect();
        // a: semantic only.
        let a = by_id["a"];
        assert!((a.score - 0.6 * 0.9).abs() < 1e-6);
        // b: both legs; keyword normalized to 1.0 (leg max).
        let b = by_id["b"];
        assert!((b.score - (0.6 * 0.4 + 0.4 * 1.0)).abs() < 1e-6);
        // c: keyword only, normalized 0.5.
        let c = by_id["c"];
        assert!((c.score - 0.4 * 0.5).abs() < 1e-6);
    }

    #[test]
    fn merge_dedupes_keeping_max() {
        let semantic = vec![hit("a", 0.3), hit("a", 0.8)];
        let keyword = vec![hit("a", 2.0)];
        let results = merge_hits(&semantic, &keyword, 0.5, 10);
        assert_eq!(results.len(), 1);
        assert!((results[0].semantic_score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn merge_is_deterministic_with_tied_scores() {
        let semantic = vec![hit("b", 0.5), hit("a", 0.5), hit("c", 0.5)];
        let first = merge_hits(&semantic, &[], 1.0, 10);
        let second = merge_hits(&semantic, &[], 1.0, 10);
        let ids: Vec<&str> = first.iter().map(|r| r.program_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(
            ids,
            second
                .iter()
                .map(|r| r.program_id.as_str())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn merge_truncates_to_k() {
        let semantic: Vec<RawHit> = (0..10)
            .map(|i| hit(&format!("p{i}"), 1.0 - i as f32 * 0.05))
            .collect();
        let results = merge_hits(&semantic, &[], 1.0, 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].program_id, "p0");
    }

    #[test]
    fn compose_query_prefers_explicit_text() {
        let profile = ProjectProfile {
            sector: Some("real-estate".to_string()),
            ..Default::default()
        };
        assert_eq!(
            compose_query(Some("  solar tax credit "), Some(&profile)).unwrap(),
            "solar tax credit"
        );
    }

    #[test]
    fn compose_query_builds_from_profile() {
        let profile = ProjectProfile {
            sector: Some("clean-energy".to_string()),
            state: Some("NY".to_string()),
            technologies: vec!["solar".to_string(), "storage".to_string()],
            intent: Some("reduce operating costs".to_string()),
            ..Default::default()
        };
        let query = compose_query(None, Some(&profile)).unwrap();
        assert!(query.contains("clean-energy"));
        assert!(query.contains("solar"));
        assert!(query.contains("in NY"));
        assert!(query.contains("reduce operating costs"));
    }

    #[test]
    fn compose_query_empty_everything_is_none() {
        assert!(compose_query(None, None).is_none());
        assert!(compose_query(Some("   "), Some(&ProjectProfile::default())).is_none());
    }

    #[test]
    fn filter_includes_unscoped_programs() {
        let filters = SearchFilters {
            state: Some("NY".to_string()),
            sector: Some("real-estate".to_string()),
            status: Some("active".to_string()),
        };
        let sql = build_filter(&filters).unwrap();
        assert!(sql.contains("(state = '' OR state = 'NY')"));
        assert!(sql.contains("(sector = '' OR sector = 'real-estate')"));
        assert!(sql.contains("status = 'active'"));
        assert!(build_filter(&SearchFilters::default()).is_none());
    }

    #[test]
    fn filter_escapes_quotes() {
        let filters = SearchFilters {
            state: Some("N'Y".to_string()),
            sector: None,
            status: None,
        };
        let sql = build_filter(&filters).unwrap();
        assert!(sql.contains("state = 'N''Y'"));
    }
}
