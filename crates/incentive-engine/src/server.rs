/// MCP server implementation for the incentive matching engine.
///
/// Exposes six tools:
/// - `search_programs`: Hybrid semantic + keyword search over the program index
/// - `score_eligibility`: Score one program against a project profile
/// - `score_eligibility_batch`: Score up to 50 programs in one call
/// - `optimize_stack`: Find the best compatible combination of programs
/// - `recommend_programs`: Full pipeline (search, score, stack, assemble)
/// - `update_corpus`: Reload the corpus file and re-index if it changed
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use match_common::api::{BatchItemError, SearchFilters, SearchResponse};

use crate::config::Config;
use crate::corpus::{self, CorpusStore};
use crate::eligibility;
use crate::index::IndexService;
use crate::model::{
    EligibilityResult, ProjectProfile, StackCombination, StackingConflict,
};
use crate::recommend::{RecommendPipeline, RecommendResponse};
use crate::search::{HybridSearchEngine, SearchRequest};
use crate::stacking;

const MAX_BATCH_SIZE: usize = 50;
const EMPTY_PROFILE: &str = "project profile must have at least one populated field";

// --- Tool parameter and response types ---

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchProgramsParams {
    /// Free-text query. Omit to derive the query from the profile.
    pub query: Option<String>,
    /// Project profile used to compose a query when `query` is absent.
    pub profile: Option<ProjectProfile>,
    pub filters: Option<SearchFilters>,
    /// Number of results (default 10, max 50).
    pub k: Option<u32>,
    /// Semantic-leg weight in [0, 1] (default 0.6).
    pub weight_semantic: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ScoreEligibilityParams {
    pub program_id: String,
    pub profile: ProjectProfile,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ScoreEligibilityBatchParams {
    /// Up to 50 program IDs.
    pub program_ids: Vec<String>,
    pub profile: ProjectProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchScoreResponse {
    pub results: Vec<EligibilityResult>,
    /// Per-item failures (e.g. unknown IDs). The call never aborts on one.
    pub errors: Vec<BatchItemError>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct OptimizeStackParams {
    /// IDs of programs the project is eligible for.
    pub program_ids: Vec<String>,
    /// Profile used to estimate each program's value.
    pub profile: ProjectProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StackResponse {
    pub best: StackCombination,
    pub alternatives: Vec<StackCombination>,
    pub conflicts: Vec<StackingConflict>,
    /// Requested IDs not present in the corpus, skipped with a warning.
    pub unknown_program_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RecommendProgramsParams {
    pub profile: ProjectProfile,
    /// Candidate pool size for the search stage (default 20, max 50).
    pub k: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateCorpusResponse {
    pub updated: bool,
    /// Corpus content version now being served.
    pub version: String,
    pub program_count: usize,
    /// Malformed records skipped during the reload.
    pub skipped_records: usize,
    /// Embedding vectors reused from the content-hash cache (0 when not updated).
    pub reused_embeddings: usize,
}

// --- MCP Server ---

#[derive(Clone)]
pub struct IncentiveEngineServer {
    corpus: Arc<CorpusStore>,
    search_engine: Arc<HybridSearchEngine>,
    index_service: Arc<IndexService>,
    pipeline: Arc<RecommendPipeline>,
    config: Config,
    tool_router: ToolRouter<IncentiveEngineServer>,
}

impl IncentiveEngineServer {
    pub fn new(
        corpus: Arc<CorpusStore>,
        search_engine: Arc<HybridSearchEngine>,
        index_service: Arc<IndexService>,
        config: Config,
    ) -> Self {
        let pipeline = Arc::new(RecommendPipeline::new(
            Arc::clone(&corpus),
            Arc::clone(&search_engine),
            config.clone(),
        ));
        Self {
            corpus,
            search_engine,
            index_service,
            pipeline,
            config,
            tool_router: Self::tool_router(),
        }
    }

    fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[tool_router]
impl IncentiveEngineServer {
    #[tool(
        description = "Search incentive programs by hybrid semantic + keyword relevance. Provide a free-text query, a project profile, or both; optional filters narrow by state, sector, or status."
    )]
    async fn search_programs(
        &self,
        Parameters(params): Parameters<SearchProgramsParams>,
    ) -> Result<Json<SearchResponse>, String> {
        let request = SearchRequest {
            query_text: params.query,
            profile: params.profile,
            filters: params.filters.unwrap_or_default(),
            k: params.k.unwrap_or(10) as usize,
            weight_semantic: params.weight_semantic.unwrap_or(0.6),
        };
        let deadline = tokio::time::Instant::now() + self.config.request_deadline;
        let response = self
            .search_engine
            .search(&request, Some(deadline))
            .await
            .map_err(|e| format!("search failed: {e}"))?;
        Ok(Json(response))
    }

    #[tool(
        description = "Score a project profile against one program's eligibility criteria. Returns the weighted 0-100 score, per-dimension breakdown, missing fields, confidence, bonus eligibility, and estimated value."
    )]
    async fn score_eligibility(
        &self,
        Parameters(params): Parameters<ScoreEligibilityParams>,
    ) -> Result<Json<EligibilityResult>, String> {
        let program_id = params.program_id.trim();
        if program_id.is_empty() {
            return Err("program_id must not be empty".to_string());
        }
        if params.profile.is_empty() {
            return Err(EMPTY_PROFILE.to_string());
        }
        let snapshot = self.corpus.snapshot().await;
        let record = snapshot
            .get(program_id)
            .ok_or_else(|| format!("program not found: {program_id}"))?;
        Ok(Json(eligibility::score(
            &params.profile,
            record,
            Self::now_unix(),
        )))
    }

    #[tool(
        description = "Score a project profile against up to 50 programs at once. Unknown IDs are reported per item; the call never fails as a whole because of one bad ID."
    )]
    async fn score_eligibility_batch(
        &self,
        Parameters(params): Parameters<ScoreEligibilityBatchParams>,
    ) -> Result<Json<BatchScoreResponse>, String> {
        if params.program_ids.is_empty() {
            return Err("program_ids must not be empty".to_string());
        }
        if params.program_ids.len() > MAX_BATCH_SIZE {
            return Err(format!(
                "batch too large: {} items, maximum is {MAX_BATCH_SIZE}",
                params.program_ids.len()
            ));
        }
        if params.profile.is_empty() {
            return Err(EMPTY_PROFILE.to_string());
        }

        let snapshot = self.corpus.snapshot().await;
        Ok(Json(score_batch(
            &snapshot,
            &params.program_ids,
            &params.profile,
            Self::now_unix(),
        )))
    }

    #[tool(
        description = "Find the highest-value compatible combination of the given programs, honoring mutual-exclusion and cap rules. Returns the best stack, up to 3 alternatives, and the detected conflicts."
    )]
    async fn optimize_stack(
        &self,
        Parameters(params): Parameters<OptimizeStackParams>,
    ) -> Result<Json<StackResponse>, String> {
        if params.program_ids.is_empty() {
            return Err("program_ids must not be empty".to_string());
        }
        if params.profile.is_empty() {
            return Err(EMPTY_PROFILE.to_string());
        }
        let snapshot = self.corpus.snapshot().await;

        let mut known = Vec::with_capacity(params.program_ids.len());
        let mut unknown_program_ids = Vec::new();
        for id in &params.program_ids {
            match snapshot.get(id.trim()) {
                Some(record) => {
                    let value = record.incentive.estimated_value(&params.profile);
                    known.push((record, value));
                }
                None => {
                    warn!(program_id = %id, "optimize_stack skipping unknown program");
                    unknown_program_ids.push(id.clone());
                }
            }
        }
        if known.is_empty() {
            return Err("none of the requested program IDs exist in the corpus".to_string());
        }

        let outcome = stacking::optimize_records(known);
        Ok(Json(StackResponse {
            best: outcome.best,
            alternatives: outcome.alternatives,
            conflicts: outcome.conflicts,
            unknown_program_ids,
        }))
    }

    #[tool(
        description = "End-to-end recommendation for a project profile: search candidate programs, score eligibility, optimize stacking, and return ranked combinations with per-program annotations."
    )]
    async fn recommend_programs(
        &self,
        Parameters(params): Parameters<RecommendProgramsParams>,
    ) -> Result<Json<RecommendResponse>, String> {
        let k = params.k.unwrap_or(20).clamp(1, 50) as usize;
        let response = self
            .pipeline
            .recommend(&params.profile, k)
            .await
            .map_err(|e| format!("recommendation failed: {e}"))?;
        Ok(Json(response))
    }

    #[tool(
        description = "Reload the program corpus from disk and re-index if its content changed. Returns the version now being served and what the reload did."
    )]
    async fn update_corpus(&self) -> Result<Json<UpdateCorpusResponse>, String> {
        info!("update_corpus tool invoked");

        let (snapshot, skipped_records) = corpus::load_corpus(&self.config.corpus_path)
            .map_err(|e| format!("corpus reload failed: {e}"))?;

        let current = self.corpus.snapshot().await;
        if snapshot.version == current.version {
            info!(version = %current.version, "corpus unchanged, keeping current index");
            return Ok(Json(UpdateCorpusResponse {
                updated: false,
                version: current.version.clone(),
                program_count: current.len(),
                skipped_records,
                reused_embeddings: 0,
            }));
        }

        let report = self
            .index_service
            .reindex(&snapshot)
            .await
            .map_err(|e| format!("re-index failed: {e}"))?;
        let version = snapshot.version.clone();
        let program_count = snapshot.len();
        self.corpus.replace(snapshot).await;
        info!(
            version = %version,
            program_count,
            indexed = report.indexed,
            dropped = report.dropped,
            "corpus updated and re-indexed"
        );

        Ok(Json(UpdateCorpusResponse {
            updated: true,
            version,
            program_count,
            skipped_records,
            reused_embeddings: report.reused,
        }))
    }
}

/// Score each requested program against the profile. Unknown IDs go to the
/// parallel error list; one bad item never fails the batch.
fn score_batch(
    snapshot: &crate::corpus::CorpusSnapshot,
    program_ids: &[String],
    profile: &ProjectProfile,
    now_unix: i64,
) -> BatchScoreResponse {
    let mut results = Vec::with_capacity(program_ids.len());
    let mut errors = Vec::new();
    for (index, id) in program_ids.iter().enumerate() {
        match snapshot.get(id.trim()) {
            Some(record) => results.push(eligibility::score(profile, record, now_unix)),
            None => errors.push(BatchItemError {
                index,
                message: format!("program not found: {id}"),
            }),
        }
    }
    BatchScoreResponse { results, errors }
}

#[tool_handler]
impl ServerHandler for IncentiveEngineServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "incentive-engine".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Incentive program matching engine. Use search_programs for hybrid \
                 search over the corpus, score_eligibility (or the batch variant) for \
                 per-program scoring against a project profile, optimize_stack to find \
                 the best compatible combination, recommend_programs for the full \
                 pipeline, and update_corpus to reload after an ingestion run."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{score_batch, IncentiveEngineServer};
    use crate::corpus::CorpusSnapshot;
    use crate::model::{EligibilityCriteria, Incentive, ProgramRecord, ProjectProfile};
    use std::collections::HashMap;

    fn snapshot_with(ids: &[&str]) -> CorpusSnapshot {
        let programs: HashMap<String, ProgramRecord> = ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    ProgramRecord {
                        id: id.to_string(),
                        name: format!("Program {id}"),
                        description: "test".to_string(),
                        status: Default::default(),
                        categories: Vec::new(),
                        criteria: EligibilityCriteria::default(),
                        bonus_rules: Vec::new(),
                        stacking_rules: Vec::new(),
                        incentive: Incentive::Fixed { amount: 100.0 },
                    },
                )
            })
            .collect();
        CorpusSnapshot {
            version: "test".to_string(),
            programs,
        }
    }

    #[test]
    fn batch_isolates_per_item_failures() {
        let snapshot = snapshot_with(&["p1", "p3"]);
        let ids = vec!["p1".to_string(), "p2".to_string(), "p3".to_string()];
        let profile = ProjectProfile {
            state: Some("NY".to_string()),
            ..Default::default()
        };
        let response = score_batch(&snapshot, &ids, &profile, 0);
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].index, 1);
        assert!(response.errors[0].message.contains("p2"));
    }

    #[test]
    fn tools_publish_output_schemas() {
        let tools = IncentiveEngineServer::tool_router().list_all();
        for name in [
            "search_programs",
            "score_eligibility",
            "score_eligibility_batch",
            "optimize_stack",
            "recommend_programs",
            "update_corpus",
        ] {
            let tool = tools
                .iter()
                .find(|t| t.name == name)
                .unwrap_or_else(|| panic!("missing tool: {name}"));
            assert!(
                tool.output_schema.is_some(),
                "tool {name} should publish output_schema"
            );
        }
    }
}
