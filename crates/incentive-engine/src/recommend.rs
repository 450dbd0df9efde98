/// Recommendation pipeline and assembler.
///
/// Pipeline per request: hybrid search (or its degraded form) completes first,
/// then only the returned candidates are scored for eligibility under a
/// bounded concurrency limit, then the eligible subset goes through stacking
/// optimization, and the assembler merges everything into a ranked, annotated
/// response. The whole request runs under one deadline; on expiry the
/// response is best-effort and flagged `truncated`.
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use match_common::api::SearchFilters;

use crate::config::Config;
use crate::corpus::CorpusStore;
use crate::eligibility;
use crate::error::AppError;
use crate::model::{
    Confidence, EligibilityResult, ProjectProfile, StackCombination, StackingConflict,
};
use crate::search::{HybridSearchEngine, SearchRequest};
use crate::stacking::{self, CandidateProgram};

const DEFAULT_WEIGHT_SEMANTIC: f32 = 0.6;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RankedProgram {
    pub program_id: String,
    pub name: String,
    pub score: f64,
    pub confidence: Confidence,
    pub estimated_value: f64,
    /// Bonus adders the project qualifies for, reported beside the base value.
    pub eligible_bonus_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RankedCombination {
    pub program_ids: Vec<String>,
    pub total_value: f64,
    pub is_optimal: bool,
    /// Lowest per-program confidence in the combination; the ranking tie-break.
    pub min_confidence: Confidence,
    pub programs: Vec<RankedProgram>,
    pub excluded: Vec<crate::model::ExcludedProgram>,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecommendResponse {
    /// Best combination first, then alternatives; ordered by total value
    /// descending, tie-broken by higher minimum confidence.
    pub combinations: Vec<RankedCombination>,
    pub conflicts: Vec<StackingConflict>,
    pub degraded: bool,
    pub truncated: bool,
    pub candidates_considered: usize,
    pub eligible_count: usize,
}

pub struct RecommendPipeline {
    corpus: Arc<CorpusStore>,
    search: Arc<HybridSearchEngine>,
    config: Config,
}

impl RecommendPipeline {
    pub fn new(corpus: Arc<CorpusStore>, search: Arc<HybridSearchEngine>, config: Config) -> Self {
        Self {
            corpus,
            search,
            config,
        }
    }

    pub async fn recommend(
        &self,
        profile: &ProjectProfile,
        k: usize,
    ) -> Result<RecommendResponse, AppError> {
        if profile.is_empty() {
            return Err(AppError::Validation(
                "project profile must have at least one populated field".to_string(),
            ));
        }
        let deadline = Instant::now() + self.config.request_deadline;

        // One snapshot for the whole request: scoring sees exactly the corpus
        // the search ran against.
        let snapshot = self.corpus.snapshot().await;

        let filters = SearchFilters {
            state: profile.state.clone(),
            sector: profile.sector.clone(),
            status: Some("active".to_string()),
        };
        let request = SearchRequest {
            query_text: None,
            profile: Some(profile.clone()),
            filters,
            k,
            weight_semantic: DEFAULT_WEIGHT_SEMANTIC,
        };
        let search_response = self.search.search(&request, Some(deadline)).await?;
        let degraded = search_response.degraded;
        let mut truncated = search_response.truncated;

        let candidates: Vec<_> = search_response
            .results
            .iter()
            .filter_map(|hit| {
                let record = snapshot.get(&hit.program_id);
                if record.is_none() {
                    warn!(program_id = %hit.program_id, "search hit missing from snapshot, skipping");
                }
                record.cloned()
            })
            .collect();
        let candidates_considered = candidates.len();

        let now_unix = unix_now();
        let mut scored: Vec<EligibilityResult> = Vec::with_capacity(candidates.len());
        let mut stream = futures::stream::iter(candidates.into_iter().map(|record| {
            let profile = profile.clone();
            async move { eligibility::score(&profile, &record, now_unix) }
        }))
        .buffer_unordered(self.config.scoring_concurrency);

        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(result)) => scored.push(result),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        scored = scored.len(),
                        "request deadline hit during scoring, returning partial results"
                    );
                    truncated = true;
                    break;
                }
            }
        }

        let eligible = eligible_for_stacking(&scored, self.config.eligibility_floor);
        let eligible_count = eligible.len();

        let stacking_candidates: Vec<CandidateProgram> = eligible
            .iter()
            .filter_map(|result| {
                snapshot
                    .get(&result.program_id)
                    .map(|record| CandidateProgram::from_record(record, result.estimated_value))
            })
            .collect();
        let outcome = stacking::optimize(stacking_candidates);

        let combinations = assemble(&outcome.best, &outcome.alternatives, &scored);
        info!(
            candidates_considered,
            eligible_count,
            combinations = combinations.len(),
            degraded,
            truncated,
            "recommendation assembled"
        );

        Ok(RecommendResponse {
            combinations,
            conflicts: outcome.conflicts,
            degraded,
            truncated,
            candidates_considered,
            eligible_count,
        })
    }
}

/// Results at or above the floor go to the optimizer, zero-value ones
/// included: the optimizer reports those as excluded with a reason, and
/// filtering them out here would hide that diagnostic from the response.
fn eligible_for_stacking(scored: &[EligibilityResult], floor: f64) -> Vec<&EligibilityResult> {
    scored.iter().filter(|r| r.score >= floor).collect()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Merge stacking output with per-program eligibility into ranked combinations.
///
/// Ordering: total value descending; ties prefer the combination whose worst
/// per-program confidence is higher.
pub fn assemble(
    best: &StackCombination,
    alternatives: &[StackCombination],
    eligibility: &[EligibilityResult],
) -> Vec<RankedCombination> {
    let mut combinations: Vec<RankedCombination> =
        std::iter::once((best, true))
            .chain(alternatives.iter().map(|alt| (alt, false)))
            .map(|(combo, is_best)| annotate(combo, is_best, eligibility))
            .collect();

    combinations.sort_by(|a, b| {
        b.total_value
            .partial_cmp(&a.total_value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.min_confidence.cmp(&a.min_confidence))
            .then_with(|| a.program_ids.cmp(&b.program_ids))
    });
    combinations
}

fn annotate(
    combo: &StackCombination,
    is_best: bool,
    eligibility: &[EligibilityResult],
) -> RankedCombination {
    let programs: Vec<RankedProgram> = combo
        .program_ids
        .iter()
        .filter_map(|id| eligibility.iter().find(|r| &r.program_id == id))
        .map(|result| RankedProgram {
            program_id: result.program_id.clone(),
            name: result.program_name.clone(),
            score: result.score,
            confidence: result.confidence,
            estimated_value: result.estimated_value,
            eligible_bonus_value: result
                .bonuses
                .iter()
                .filter(|b| b.eligible)
                .map(|b| b.value)
                .sum(),
        })
        .collect();

    let min_confidence = programs
        .iter()
        .map(|p| p.confidence)
        .min()
        .unwrap_or(Confidence::Low);

    let rationale = if combo.program_ids.is_empty() {
        "no compatible programs".to_string()
    } else {
        let kind = if is_best { "best stack" } else { "alternative stack" };
        let quality = if combo.is_optimal {
            "optimal"
        } else {
            "heuristic"
        };
        format!(
            "{kind}: {} compatible program(s) worth {:.0} ({quality})",
            combo.program_ids.len(),
            combo.total_value
        )
    };

    RankedCombination {
        program_ids: combo.program_ids.clone(),
        total_value: combo.total_value,
        is_optimal: combo.is_optimal,
        min_confidence,
        programs,
        excluded: combo.excluded.clone(),
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExcludedProgram;

    fn eligibility(id: &str, score: f64, confidence: Confidence, value: f64) -> EligibilityResult {
        EligibilityResult {
            program_id: id.to_string(),
            program_name: format!("Program {id}"),
            score,
            dimensions: Vec::new(),
            missing_fields: Vec::new(),
            confidence,
            bonuses: Vec::new(),
            estimated_value: value,
        }
    }

    fn combo(ids: &[&str], value: f64) -> StackCombination {
        StackCombination {
            program_ids: ids.iter().map(|s| s.to_string()).collect(),
            total_value: value,
            is_optimal: true,
            excluded: Vec::new(),
        }
    }

    #[test]
    fn orders_by_value_then_min_confidence() {
        let results = vec![
            eligibility("a", 90.0, Confidence::High, 100.0),
            eligibility("b", 70.0, Confidence::Low, 100.0),
            eligibility("c", 85.0, Confidence::Medium, 100.0),
        ];
        let best = combo(&["a", "b"], 200.0);
        // Same value, but higher minimum confidence: should outrank the best
        // after sorting.
        let alt = combo(&["a", "c"], 200.0);
        let ranked = assemble(&best, &[alt], &results);
        assert_eq!(ranked[0].program_ids, vec!["a", "c"]);
        assert_eq!(ranked[0].min_confidence, Confidence::Medium);
        assert_eq!(ranked[1].min_confidence, Confidence::Low);
    }

    #[test]
    fn annotates_programs_and_bonuses() {
        let mut result = eligibility("a", 95.0, Confidence::High, 500.0);
        result.bonuses = vec![
            crate::model::BonusEligibility {
                name: "affordability".to_string(),
                eligible: true,
                value: 50.0,
            },
            crate::model::BonusEligibility {
                name: "energy-community".to_string(),
                eligible: false,
                value: 25.0,
            },
        ];
        let ranked = assemble(&combo(&["a"], 500.0), &[], &[result]);
        assert_eq!(ranked.len(), 1);
        let program = &ranked[0].programs[0];
        assert_eq!(program.eligible_bonus_value, 50.0);
        assert!(ranked[0].rationale.contains("best stack"));
        assert!(ranked[0].rationale.contains("optimal"));
    }

    #[test]
    fn empty_combination_has_diagnostic_rationale() {
        let mut empty = combo(&[], 0.0);
        empty.excluded.push(ExcludedProgram {
            program_id: "a".to_string(),
            reason: "contradictory exclusion rules leave no feasible selection".to_string(),
        });
        let ranked = assemble(&empty, &[], &[]);
        assert_eq!(ranked[0].rationale, "no compatible programs");
        assert_eq!(ranked[0].excluded.len(), 1);
    }

    #[test]
    fn zero_value_results_above_floor_reach_the_optimizer() {
        let scored = vec![
            eligibility("a", 80.0, Confidence::High, 0.0),
            eligibility("b", 75.0, Confidence::High, 500.0),
            eligibility("c", 20.0, Confidence::Low, 300.0),
        ];
        let eligible = eligible_for_stacking(&scored, 40.0);
        let ids: Vec<&str> = eligible.iter().map(|r| r.program_id.as_str()).collect();
        // "a" passes despite its zero value; the optimizer excludes it with a
        // reason the caller can see.
        assert_eq!(ids, vec!["a", "b"]);
        let outcome = stacking::optimize(
            eligible
                .iter()
                .map(|r| CandidateProgram {
                    id: r.program_id.clone(),
                    value: r.estimated_value,
                    categories: Vec::new(),
                    excludes: Vec::new(),
                    allows: Vec::new(),
                    cap: None,
                })
                .collect(),
        );
        let zero = outcome
            .best
            .excluded
            .iter()
            .find(|e| e.program_id == "a")
            .unwrap();
        assert!(zero.reason.contains("non-positive"));
    }

    #[test]
    fn heuristic_combinations_say_so() {
        let mut c = combo(&["a"], 10.0);
        c.is_optimal = false;
        let ranked = assemble(&c, &[], &[eligibility("a", 80.0, Confidence::High, 10.0)]);
        assert!(ranked[0].rationale.contains("heuristic"));
    }
}
