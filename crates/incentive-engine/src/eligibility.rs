/// Eligibility scoring between a project profile and a program record.
///
/// Pure and synchronous: scoring never performs I/O and never fails on
/// missing or zero-valued inputs. Absent data contributes 0 to the score and
/// is recorded in `missing_fields` rather than being treated as a mismatch.
///
/// Seven weighted dimensions (weights sum to 100). Sector is gating: a hard
/// sector mismatch forces the total score to 0 regardless of the other
/// dimensions. Bonus adders are evaluated independently and reported beside
/// the base score, never folded into it.
use crate::model::{
    BonusEligibility, BonusPredicate, Confidence, DimensionScore, EligibilityResult,
    Jurisdiction, ProgramRecord, ProjectProfile, StackingRule,
};

pub const WEIGHT_GEOGRAPHIC: f64 = 25.0;
pub const WEIGHT_SECTOR: f64 = 20.0;
pub const WEIGHT_ENTITY: f64 = 15.0;
pub const WEIGHT_SIZE: f64 = 15.0;
pub const WEIGHT_TECHNOLOGY: f64 = 15.0;
pub const WEIGHT_TIMING: f64 = 5.0;
pub const WEIGHT_COMPLETENESS: f64 = 5.0;

/// Deadlines closer than this still score, but only partially.
const DEADLINE_SOON_SECS: i64 = 30 * 24 * 3600;
/// Sizes within this fraction outside a bound count as a partial match.
const SIZE_SLACK: f64 = 0.10;

struct Dimension {
    sub_score: f64,
    has_data: bool,
    missing: Vec<&'static str>,
}

impl Dimension {
    fn matched(sub_score: f64) -> Self {
        Self {
            sub_score,
            has_data: true,
            missing: Vec::new(),
        }
    }

    fn no_data(missing: &'static str) -> Self {
        Self {
            sub_score: 0.0,
            has_data: false,
            missing: vec![missing],
        }
    }
}

/// Score one (profile, program) pair. `now_unix` is supplied by the caller so
/// timing stays deterministic under test.
pub fn score(profile: &ProjectProfile, program: &ProgramRecord, now_unix: i64) -> EligibilityResult {
    let geographic = score_geographic(profile, program);
    let sector = score_sector(profile, program);
    let entity = score_entity(profile, program);
    let size = score_size(profile, program);
    let technology = score_technology(profile, program);
    let timing = score_timing(program, now_unix);

    let substantive = [&geographic, &sector, &entity, &size, &technology, &timing];
    let with_data = substantive.iter().filter(|d| d.has_data).count();
    let data_fraction = with_data as f64 / substantive.len() as f64;
    let completeness = Dimension::matched(step_score(data_fraction));

    // Hard sector mismatch gates the whole result.
    let sector_hard_fail = sector.has_data && sector.sub_score == 0.0;

    let dimensions = vec![
        ("geographic", WEIGHT_GEOGRAPHIC, &geographic),
        ("sector", WEIGHT_SECTOR, &sector),
        ("entity_type", WEIGHT_ENTITY, &entity),
        ("size", WEIGHT_SIZE, &size),
        ("technology", WEIGHT_TECHNOLOGY, &technology),
        ("timing", WEIGHT_TIMING, &timing),
        ("completeness", WEIGHT_COMPLETENESS, &completeness),
    ];

    let raw: f64 = dimensions
        .iter()
        .map(|(_, weight, d)| d.sub_score * weight)
        .sum();
    let total = if sector_hard_fail {
        0.0
    } else {
        raw.clamp(0.0, 100.0)
    };

    let mut missing_fields: Vec<String> = Vec::new();
    for (_, _, d) in &dimensions {
        for field in &d.missing {
            let owned = field.to_string();
            if !missing_fields.contains(&owned) {
                missing_fields.push(owned);
            }
        }
    }

    let confidence = if data_fraction >= 0.8 {
        Confidence::High
    } else if data_fraction >= 0.5 {
        Confidence::Medium
    } else {
        Confidence::Low
    };

    EligibilityResult {
        program_id: program.id.clone(),
        program_name: program.name.clone(),
        score: total,
        dimensions: dimensions
            .iter()
            .map(|(name, weight, d)| DimensionScore {
                name: name.to_string(),
                weight: *weight,
                sub_score: d.sub_score,
                has_data: d.has_data,
            })
            .collect(),
        missing_fields,
        confidence,
        bonuses: evaluate_bonuses(profile, program),
        estimated_value: program.incentive.estimated_value(profile),
    }
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn list_contains(list: &[String], value: &str) -> bool {
    list.iter().any(|item| eq_ignore_case(item, value))
}

/// Hierarchical geographic match: exact locality 1.0, enclosing-level match
/// 0.5 (e.g. profile supplies only the state of a county-scoped program),
/// wrong state 0.
fn score_geographic(profile: &ProjectProfile, program: &ProgramRecord) -> Dimension {
    let criteria = &program.criteria;
    match criteria.jurisdiction {
        Jurisdiction::Federal => Dimension::matched(1.0),
        Jurisdiction::State => match (&profile.state, &criteria.state) {
            (_, None) => Dimension::matched(1.0),
            (Some(ps), Some(cs)) if eq_ignore_case(ps, cs) => Dimension::matched(1.0),
            (Some(_), Some(_)) => Dimension::matched(0.0),
            (None, Some(_)) => Dimension::no_data("state"),
        },
        Jurisdiction::County => score_local(
            profile.state.as_deref(),
            profile.county.as_deref(),
            criteria.state.as_deref(),
            criteria.county.as_deref(),
        ),
        Jurisdiction::City => score_local(
            profile.state.as_deref(),
            profile.city.as_deref(),
            criteria.state.as_deref(),
            criteria.city.as_deref(),
        ),
    }
}

fn score_local(
    profile_state: Option<&str>,
    profile_local: Option<&str>,
    program_state: Option<&str>,
    program_local: Option<&str>,
) -> Dimension {
    let Some(ps) = profile_state else {
        return Dimension::no_data("state");
    };
    if let Some(cs) = program_state {
        if !eq_ignore_case(ps, cs) {
            return Dimension::matched(0.0);
        }
    }
    match (profile_local, program_local) {
        (_, None) => Dimension::matched(1.0),
        (Some(pl), Some(cl)) if eq_ignore_case(pl, cl) => Dimension::matched(1.0),
        (Some(_), Some(_)) => Dimension::matched(0.0),
        // Profile resolves the enclosing state but not the locality.
        (None, Some(_)) => Dimension::matched(0.5),
    }
}

fn score_sector(profile: &ProjectProfile, program: &ProgramRecord) -> Dimension {
    if program.criteria.sectors.is_empty() {
        return Dimension::matched(1.0);
    }
    match &profile.sector {
        None => Dimension::no_data("sector"),
        Some(sector) if list_contains(&program.criteria.sectors, sector) => {
            Dimension::matched(1.0)
        }
        Some(_) => Dimension::matched(0.0),
    }
}

fn score_entity(profile: &ProjectProfile, program: &ProgramRecord) -> Dimension {
    if program.criteria.entity_types.is_empty() {
        return Dimension::matched(1.0);
    }
    match &profile.entity_type {
        None => Dimension::no_data("entity_type"),
        Some(entity) if list_contains(&program.criteria.entity_types, entity) => {
            Dimension::matched(1.0)
        }
        Some(_) => Dimension::matched(0.0),
    }
}

/// Size bounds plus any project-value threshold declared through a
/// `Threshold` stacking rule. When multiple constraints apply, the dimension
/// takes the worst sub-score; a missing field on either constraint marks the
/// whole dimension as lacking data.
fn score_size(profile: &ProjectProfile, program: &ProgramRecord) -> Dimension {
    let criteria = &program.criteria;
    let unit_bounds = criteria.min_size_units.is_some() || criteria.max_size_units.is_some();
    let cost_floor = program.stacking_rules.iter().find_map(|rule| match rule {
        StackingRule::Threshold { min_project_value } => Some(*min_project_value),
        _ => None,
    });

    if !unit_bounds && cost_floor.is_none() {
        return Dimension::matched(1.0);
    }

    let mut sub_score = 1.0f64;
    let mut has_data = true;
    let mut missing = Vec::new();

    if unit_bounds {
        match profile.size_units {
            // Zero size cannot satisfy a bound check; treated as absent data,
            // never an error.
            None | Some(0) => {
                has_data = false;
                missing.push("size_units");
            }
            Some(units) => {
                sub_score = sub_score.min(bounded_score(
                    f64::from(units),
                    criteria.min_size_units.map(f64::from),
                    criteria.max_size_units.map(f64::from),
                ));
            }
        }
    }

    if let Some(floor) = cost_floor {
        match profile.total_cost {
            None => {
                has_data = false;
                missing.push("total_cost");
            }
            Some(cost) => {
                sub_score = sub_score.min(bounded_score(cost, Some(floor), None));
            }
        }
    }

    Dimension {
        sub_score: if has_data { sub_score } else { 0.0 },
        has_data,
        missing,
    }
}

/// 1.0 inside the bounds, 0.5 within `SIZE_SLACK` outside a bound, else 0.
fn bounded_score(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    if let Some(min) = min {
        if value < min {
            return if value >= min * (1.0 - SIZE_SLACK) {
                0.5
            } else {
                0.0
            };
        }
    }
    if let Some(max) = max {
        if value > max {
            return if value <= max * (1.0 + SIZE_SLACK) {
                0.5
            } else {
                0.0
            };
        }
    }
    1.0
}

fn score_technology(profile: &ProjectProfile, program: &ProgramRecord) -> Dimension {
    let required = &program.criteria.technologies;
    if required.is_empty() {
        return Dimension::matched(1.0);
    }
    if profile.technologies.is_empty() {
        return Dimension::no_data("technologies");
    }
    let matched = required
        .iter()
        .filter(|t| list_contains(&profile.technologies, t))
        .count();
    let sub = if matched == required.len() {
        1.0
    } else if matched > 0 {
        0.5
    } else {
        0.0
    };
    Dimension::matched(sub)
}

fn score_timing(program: &ProgramRecord, now_unix: i64) -> Dimension {
    match program.criteria.deadline_unix {
        None => Dimension::matched(1.0),
        Some(deadline) if deadline >= now_unix + DEADLINE_SOON_SECS => Dimension::matched(1.0),
        Some(deadline) if deadline >= now_unix => Dimension::matched(0.5),
        Some(_) => Dimension::matched(0.0),
    }
}

fn step_score(fraction: f64) -> f64 {
    if fraction >= 0.8 {
        1.0
    } else if fraction >= 0.5 {
        0.5
    } else {
        0.0
    }
}

fn evaluate_bonuses(profile: &ProjectProfile, program: &ProgramRecord) -> Vec<BonusEligibility> {
    program
        .bonus_rules
        .iter()
        .map(|rule| {
            let eligible = match &rule.predicate {
                BonusPredicate::MinAffordablePct { pct } => {
                    match (profile.affordable_units, profile.size_units) {
                        (Some(affordable), Some(total)) if total > 0 => {
                            f64::from(affordable) / f64::from(total) * 100.0 >= *pct
                        }
                        _ => false,
                    }
                }
                BonusPredicate::RequiresTechnology { technology } => {
                    list_contains(&profile.technologies, technology)
                }
                BonusPredicate::EnergyCommunity => {
                    list_contains(&profile.features, "energy-community")
                }
                BonusPredicate::PrevailingWage => {
                    list_contains(&profile.features, "prevailing-wage")
                }
                BonusPredicate::DomesticContent => {
                    list_contains(&profile.features, "domestic-content")
                }
            };
            BonusEligibility {
                name: rule.name.clone(),
                eligible,
                value: rule.value,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BonusRule, EligibilityCriteria, Incentive};

    const NOW: i64 = 1_756_000_000;

    fn program(id: &str) -> ProgramRecord {
        ProgramRecord {
            id: id.to_string(),
            name: format!("Program {id}"),
            description: "test program".to_string(),
            status: Default::default(),
            categories: Vec::new(),
            criteria: EligibilityCriteria::default(),
            bonus_rules: Vec::new(),
            stacking_rules: Vec::new(),
            incentive: Incentive::Fixed { amount: 1_000.0 },
        }
    }

    fn ny_real_estate_profile() -> ProjectProfile {
        ProjectProfile {
            sector: Some("real-estate".to_string()),
            state: Some("NY".to_string()),
            size_units: Some(150),
            affordable_units: Some(120),
            ..Default::default()
        }
    }

    #[test]
    fn weights_sum_to_one_hundred() {
        let total = WEIGHT_GEOGRAPHIC
            + WEIGHT_SECTOR
            + WEIGHT_ENTITY
            + WEIGHT_SIZE
            + WEIGHT_TECHNOLOGY
            + WEIGHT_TIMING
            + WEIGHT_COMPLETENESS;
        assert_eq!(total, 100.0);
    }

    #[test]
    fn scenario_a_ny_affordable_housing() {
        let mut p = program("ny-affordable");
        p.criteria.jurisdiction = Jurisdiction::State;
        p.criteria.state = Some("NY".to_string());
        p.criteria.sectors = vec!["real-estate".to_string()];
        p.bonus_rules.push(BonusRule {
            name: "affordability".to_string(),
            value: 250_000.0,
            predicate: BonusPredicate::MinAffordablePct { pct: 80.0 },
        });

        let result = score(&ny_real_estate_profile(), &p, NOW);

        let geo = result.dimensions.iter().find(|d| d.name == "geographic").unwrap();
        let sector = result.dimensions.iter().find(|d| d.name == "sector").unwrap();
        assert_eq!(geo.sub_score, 1.0);
        assert_eq!(sector.sub_score, 1.0);
        assert!(result.score >= 80.0);
        assert_eq!(result.confidence, Confidence::High);
        // 120 / 150 = 80% meets the 80% floor exactly.
        assert!(result.bonuses[0].eligible);
    }

    #[test]
    fn scenario_b_sector_mismatch_gates_to_zero() {
        let mut p = program("clean-energy-credit");
        p.criteria.sectors = vec!["clean-energy".to_string()];
        // Everything else matches perfectly.
        let result = score(&ny_real_estate_profile(), &p, NOW);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn gating_is_independent_of_other_dimensions() {
        let mut p = program("gated");
        p.criteria.sectors = vec!["manufacturing".to_string()];
        p.criteria.jurisdiction = Jurisdiction::State;
        p.criteria.state = Some("NY".to_string());
        let result = score(&ny_real_estate_profile(), &p, NOW);
        assert_eq!(result.score, 0.0);
        // The sub-scores themselves are still reported for explanation.
        let geo = result.dimensions.iter().find(|d| d.name == "geographic").unwrap();
        assert_eq!(geo.sub_score, 1.0);
    }

    #[test]
    fn missing_sector_is_not_a_mismatch() {
        let mut p = program("sectored");
        p.criteria.sectors = vec!["real-estate".to_string()];
        let profile = ProjectProfile {
            state: Some("NY".to_string()),
            ..Default::default()
        };
        let result = score(&profile, &p, NOW);
        assert!(result.score > 0.0);
        assert!(result.missing_fields.contains(&"sector".to_string()));
    }

    #[test]
    fn county_program_state_only_profile_is_partial() {
        let mut p = program("county-grant");
        p.criteria.jurisdiction = Jurisdiction::County;
        p.criteria.state = Some("NY".to_string());
        p.criteria.county = Some("Westchester".to_string());
        let profile = ProjectProfile {
            state: Some("NY".to_string()),
            sector: Some("real-estate".to_string()),
            ..Default::default()
        };
        let result = score(&profile, &p, NOW);
        let geo = result.dimensions.iter().find(|d| d.name == "geographic").unwrap();
        assert_eq!(geo.sub_score, 0.5);
        assert!(geo.has_data);
    }

    #[test]
    fn wrong_state_county_program_is_zero() {
        let mut p = program("county-grant");
        p.criteria.jurisdiction = Jurisdiction::County;
        p.criteria.state = Some("CA".to_string());
        p.criteria.county = Some("Alameda".to_string());
        let result = score(&ny_real_estate_profile(), &p, NOW);
        let geo = result.dimensions.iter().find(|d| d.name == "geographic").unwrap();
        assert_eq!(geo.sub_score, 0.0);
    }

    #[test]
    fn zero_size_degrades_not_errors() {
        let mut p = program("sized");
        p.criteria.min_size_units = Some(10);
        let profile = ProjectProfile {
            sector: Some("real-estate".to_string()),
            size_units: Some(0),
            ..Default::default()
        };
        let result = score(&profile, &p, NOW);
        let size = result.dimensions.iter().find(|d| d.name == "size").unwrap();
        assert_eq!(size.sub_score, 0.0);
        assert!(!size.has_data);
        assert!(result.missing_fields.contains(&"size_units".to_string()));
    }

    #[test]
    fn size_slack_gives_partial_credit() {
        let mut p = program("sized");
        p.criteria.min_size_units = Some(100);
        let near = ProjectProfile {
            size_units: Some(95),
            ..Default::default()
        };
        let far = ProjectProfile {
            size_units: Some(50),
            ..Default::default()
        };
        let near_dim = score(&near, &p, NOW);
        let far_dim = score(&far, &p, NOW);
        let sub = |r: &EligibilityResult| {
            r.dimensions
                .iter()
                .find(|d| d.name == "size")
                .unwrap()
                .sub_score
        };
        assert_eq!(sub(&near_dim), 0.5);
        assert_eq!(sub(&far_dim), 0.0);
    }

    #[test]
    fn threshold_rule_enforces_cost_floor() {
        let mut p = program("big-projects-only");
        p.stacking_rules.push(StackingRule::Threshold {
            min_project_value: 1_000_000.0,
        });
        let small = ProjectProfile {
            total_cost: Some(200_000.0),
            ..Default::default()
        };
        let big = ProjectProfile {
            total_cost: Some(2_000_000.0),
            ..Default::default()
        };
        let small_r = score(&small, &p, NOW);
        let big_r = score(&big, &p, NOW);
        let sub = |r: &EligibilityResult| {
            r.dimensions
                .iter()
                .find(|d| d.name == "size")
                .unwrap()
                .sub_score
        };
        assert_eq!(sub(&small_r), 0.0);
        assert_eq!(sub(&big_r), 1.0);
    }

    #[test]
    fn partial_technology_overlap() {
        let mut p = program("tech");
        p.criteria.technologies = vec!["solar".to_string(), "storage".to_string()];
        let profile = ProjectProfile {
            technologies: vec!["solar".to_string()],
            ..Default::default()
        };
        let result = score(&profile, &p, NOW);
        let tech = result.dimensions.iter().find(|d| d.name == "technology").unwrap();
        assert_eq!(tech.sub_score, 0.5);
    }

    #[test]
    fn timing_windows() {
        let mut p = program("deadline");
        let mut sub = |deadline: i64| {
            p.criteria.deadline_unix = Some(deadline);
            let r = score(&ProjectProfile::default(), &p, NOW);
            r.dimensions
                .iter()
                .find(|d| d.name == "timing")
                .unwrap()
                .sub_score
        };
        assert_eq!(sub(NOW + 90 * 24 * 3600), 1.0);
        assert_eq!(sub(NOW + 10 * 24 * 3600), 0.5);
        assert_eq!(sub(NOW - 1), 0.0);
    }

    #[test]
    fn confidence_drops_with_missing_data() {
        let mut p = program("needy");
        p.criteria.sectors = vec!["real-estate".to_string()];
        p.criteria.entity_types = vec!["llc".to_string()];
        p.criteria.technologies = vec!["solar".to_string()];
        p.criteria.min_size_units = Some(10);
        p.criteria.jurisdiction = Jurisdiction::State;
        p.criteria.state = Some("NY".to_string());
        // Profile supplies nothing the program needs except timing (implicit).
        let result = score(&ProjectProfile::default(), &p, NOW);
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.missing_fields.len() >= 4);
    }

    #[test]
    fn feature_flag_bonuses() {
        let mut p = program("bonuses");
        p.bonus_rules = vec![
            BonusRule {
                name: "energy-community".to_string(),
                value: 10_000.0,
                predicate: BonusPredicate::EnergyCommunity,
            },
            BonusRule {
                name: "domestic-content".to_string(),
                value: 5_000.0,
                predicate: BonusPredicate::DomesticContent,
            },
        ];
        let profile = ProjectProfile {
            features: vec!["energy-community".to_string()],
            ..Default::default()
        };
        let result = score(&profile, &p, NOW);
        assert!(result.bonuses[0].eligible);
        assert!(!result.bonuses[1].eligible);
        // Bonuses never move the base score.
        let without = score(
            &ProjectProfile::default(),
            &{
                let mut q = program("bonuses");
                q.bonus_rules = Vec::new();
                q
            },
            NOW,
        );
        let base_with = score(&ProjectProfile::default(), &p, NOW);
        assert_eq!(without.score, base_with.score);
    }
}
