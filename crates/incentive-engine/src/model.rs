use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A canonical incentive-program record, produced by the (external) ingestion
/// pipeline and consumed read-only here. Rule payloads are tagged variants,
/// validated once at corpus load — never at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub id: String,
    pub name: String,
    /// Descriptive text; source of the embedding and full-text tokens.
    pub description: String,
    #[serde(default)]
    pub status: ProgramStatus,
    /// Category tags referenced by category-level exclusion rules,
    /// e.g. "federal-tax-credit".
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub criteria: EligibilityCriteria,
    #[serde(default)]
    pub bonus_rules: Vec<BonusRule>,
    #[serde(default)]
    pub stacking_rules: Vec<StackingRule>,
    pub incentive: Incentive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    #[default]
    Active,
    Paused,
    Expired,
}

impl ProgramStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramStatus::Active => "active",
            ProgramStatus::Paused => "paused",
            ProgramStatus::Expired => "expired",
        }
    }
}

/// Structured eligibility criteria. Empty lists mean "unconstrained".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EligibilityCriteria {
    #[serde(default)]
    pub jurisdiction: Jurisdiction,
    pub state: Option<String>,
    pub county: Option<String>,
    pub city: Option<String>,
    #[serde(default)]
    pub sectors: Vec<String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
    pub min_size_units: Option<u32>,
    pub max_size_units: Option<u32>,
    #[serde(default)]
    pub technologies: Vec<String>,
    /// Application deadline as unix seconds; `None` means open-ended.
    pub deadline_unix: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jurisdiction {
    #[default]
    Federal,
    State,
    County,
    City,
}

/// Incentive value, either fixed or a formula over project attributes.
/// Formula variants evaluate to zero when the driving profile field is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Incentive {
    Fixed { amount: f64 },
    PerUnit { amount: f64 },
    PctOfCost { pct: f64 },
}

impl Incentive {
    pub fn estimated_value(&self, profile: &ProjectProfile) -> f64 {
        match self {
            Incentive::Fixed { amount } => *amount,
            Incentive::PerUnit { amount } => {
                amount * f64::from(profile.size_units.unwrap_or(0))
            }
            Incentive::PctOfCost { pct } => pct / 100.0 * profile.total_cost.unwrap_or(0.0),
        }
    }

    /// The nominal amount, independent of any profile. Used for ingestion
    /// validation only.
    pub fn nominal_amount(&self) -> f64 {
        match self {
            Incentive::Fixed { amount } | Incentive::PerUnit { amount } => *amount,
            Incentive::PctOfCost { pct } => *pct,
        }
    }
}

/// A bonus adder evaluated independently of the base score, e.g. a
/// domestic-content or low-income adder. Reported as eligible/ineligible plus
/// incremental value, never folded into the base eligibility score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusRule {
    pub name: String,
    pub value: f64,
    pub predicate: BonusPredicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BonusPredicate {
    /// Affordable units must be at least `pct` percent of total units.
    MinAffordablePct { pct: f64 },
    /// Project must include the named technology.
    RequiresTechnology { technology: String },
    /// Project site is in a designated energy community.
    EnergyCommunity,
    /// Project commits to prevailing-wage requirements.
    PrevailingWage,
    /// Project meets domestic-content sourcing requirements.
    DomesticContent,
}

/// Stacking rules as a tagged-variant set (validated at ingestion).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StackingRule {
    /// The declaring program may not be combined with the target, which is
    /// either a program id or `category:<name>`.
    Exclude { target: String },
    /// Explicit whitelist entry overriding an exclusion in either direction.
    Allow { program_id: String },
    /// Ceiling on the counted value of any combination containing the
    /// declaring program.
    Cap { max_total_value: f64 },
    /// The declaring program only applies to projects at or above this
    /// total-cost floor.
    Threshold { min_project_value: f64 },
}

/// A capital-project profile, supplied per request and never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProjectProfile {
    pub sector: Option<String>,
    /// Two-letter state code, e.g. "NY".
    pub state: Option<String>,
    pub county: Option<String>,
    pub city: Option<String>,
    pub entity_type: Option<String>,
    /// Project size in units (dwelling units, MW, etc. per sector convention).
    pub size_units: Option<u32>,
    pub total_cost: Option<f64>,
    pub affordable_units: Option<u32>,
    #[serde(default)]
    pub technologies: Vec<String>,
    /// Free-form site/commitment flags, e.g. "energy-community",
    /// "prevailing-wage", "domestic-content".
    #[serde(default)]
    pub features: Vec<String>,
    /// Optional free-text description of intent, used for query composition.
    pub intent: Option<String>,
}

impl ProjectProfile {
    /// A profile with no usable field at all cannot be matched against anything.
    pub fn is_empty(&self) -> bool {
        self.sector.is_none()
            && self.state.is_none()
            && self.county.is_none()
            && self.city.is_none()
            && self.entity_type.is_none()
            && self.size_units.is_none()
            && self.total_cost.is_none()
            && self.affordable_units.is_none()
            && self.technologies.is_empty()
            && self.features.is_empty()
            && self.intent.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DimensionScore {
    pub name: String,
    pub weight: f64,
    /// 0.0 (mismatch), 0.5 (partial/hierarchical match) or 1.0 (exact match).
    pub sub_score: f64,
    /// False when the program constrains this dimension but the profile does
    /// not supply the field needed to evaluate it.
    pub has_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BonusEligibility {
    pub name: String,
    pub eligible: bool,
    pub value: f64,
}

/// Result of scoring one (profile, program) pair. Computed on demand, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EligibilityResult {
    pub program_id: String,
    pub program_name: String,
    /// Total weighted score in [0, 100]. Forced to 0 when a gating dimension
    /// (sector) hard-fails.
    pub score: f64,
    pub dimensions: Vec<DimensionScore>,
    pub missing_fields: Vec<String>,
    pub confidence: Confidence,
    pub bonuses: Vec<BonusEligibility>,
    /// Incentive value estimated from the profile, used by the stacking step.
    pub estimated_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    MutuallyExclusive,
    ExceedsMaxTotal,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StackingConflict {
    pub program_a: String,
    pub program_b: String,
    pub reason: ConflictReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExcludedProgram {
    pub program_id: String,
    /// Human-readable reason, e.g. `conflicts with prog-a` or
    /// `capped by prog-b`.
    pub reason: String,
}

/// A compatible set of programs with its counted (cap-clamped) total value.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StackCombination {
    pub program_ids: Vec<String>,
    pub total_value: f64,
    /// False when any connected component fell back to the greedy heuristic.
    pub is_optimal: bool,
    pub excluded: Vec<ExcludedProgram>,
}
