/// Stacking analysis: conflict modeling and value-maximizing selection.
///
/// Selection is a weighted-independent-set problem over the hard-conflict
/// graph (mutual exclusions). Cap rules clamp the counted value of the whole
/// combination, never just one component's share, so they are handled
/// globally: components are solved for maximum raw value at each candidate
/// clamp level (no capped members at all, or a binding cap equal to one of
/// the declared cap values), and the level whose union counts highest wins.
/// The optimum's binding cap is always one of those levels, so the search
/// stays exact.
///
/// Components small enough are solved exactly by branch-and-bound with
/// optimistic-bound pruning; larger components fall back to a greedy order by
/// value per conflict degree, and the global result is flagged non-optimal.
/// Everything here is pure CPU-bound computation; no suspension points.
use std::collections::HashSet;

use tracing::warn;

use crate::model::{
    ConflictReason, ExcludedProgram, ProgramRecord, StackCombination, StackingConflict,
    StackingRule,
};

/// Components up to this size are solved exactly.
const MAX_EXACT_COMPONENT: usize = 20;
/// Selections retained per component for alternative generation.
const SELECTIONS_PER_COMPONENT: usize = 4;
/// Alternatives returned to the caller.
const MAX_ALTERNATIVES: usize = 3;

/// One stacking candidate: an eligible program plus its profile-estimated value.
#[derive(Debug, Clone)]
pub struct CandidateProgram {
    pub id: String,
    pub value: f64,
    pub categories: Vec<String>,
    pub excludes: Vec<String>,
    pub allows: Vec<String>,
    pub cap: Option<f64>,
}

impl CandidateProgram {
    pub fn from_record(record: &ProgramRecord, value: f64) -> Self {
        let mut excludes = Vec::new();
        let mut allows = Vec::new();
        let mut cap: Option<f64> = None;
        for rule in &record.stacking_rules {
            match rule {
                StackingRule::Exclude { target } => excludes.push(target.clone()),
                StackingRule::Allow { program_id } => allows.push(program_id.clone()),
                StackingRule::Cap { max_total_value } => {
                    cap = Some(cap.map_or(*max_total_value, |c: f64| c.min(*max_total_value)));
                }
                StackingRule::Threshold { .. } => {} // handled during eligibility
            }
        }
        Self {
            id: record.id.clone(),
            value,
            categories: record.categories.clone(),
            excludes,
            allows,
            cap,
        }
    }
}

pub struct StackingOutcome {
    pub best: StackCombination,
    pub alternatives: Vec<StackCombination>,
    pub conflicts: Vec<StackingConflict>,
}

/// A hard-edge-independent selection within one component and its raw
/// (unclamped) value.
#[derive(Debug, Clone)]
struct Selection {
    members: Vec<usize>,
    raw_value: f64,
}

/// Select the value-maximizing compatible subset of the given candidates.
///
/// An empty candidate set yields an empty combination, not an error. Rule
/// sets that leave no feasible non-empty selection also yield an empty
/// combination, with diagnostic reasons per excluded program.
pub fn optimize(candidates: Vec<CandidateProgram>) -> StackingOutcome {
    let mut excluded: Vec<ExcludedProgram> = Vec::new();

    // Intake filter: data-quality skips and self-contradictory rules.
    let mut usable: Vec<CandidateProgram> = Vec::new();
    for candidate in candidates {
        if candidate.value <= 0.0 {
            excluded.push(ExcludedProgram {
                program_id: candidate.id.clone(),
                reason: "skipped: non-positive estimated value".to_string(),
            });
            warn!(program_id = %candidate.id, "stacking candidate skipped: non-positive value");
            continue;
        }
        if excludes_target(&candidate, &candidate) {
            excluded.push(ExcludedProgram {
                program_id: candidate.id.clone(),
                reason: "contradictory exclusion rules leave no feasible selection".to_string(),
            });
            continue;
        }
        usable.push(candidate);
    }
    // Deterministic node numbering.
    usable.sort_by(|a, b| a.id.cmp(&b.id));

    let n = usable.len();
    if n == 0 {
        return StackingOutcome {
            best: StackCombination {
                program_ids: Vec::new(),
                total_value: 0.0,
                is_optimal: true,
                excluded,
            },
            alternatives: Vec::new(),
            conflicts: Vec::new(),
        };
    }

    let (hard, conflicts) = build_conflict_graph(&usable);
    let components = connected_components(n, |a, b| hard[a].contains(&b));

    // Candidate clamp levels: either no capped member is selected, or the
    // binding cap equals one of the declared cap values.
    let mut cap_levels: Vec<f64> = usable.iter().filter_map(|c| c.cap).collect();
    cap_levels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    cap_levels.dedup();
    let levels: Vec<Option<f64>> = std::iter::once(None)
        .chain(cap_levels.into_iter().map(Some))
        .collect();

    // per_component[c][l]: ranked selections for component c at clamp level l.
    let mut per_component: Vec<Vec<Vec<Selection>>> = Vec::with_capacity(components.len());
    let mut all_optimal = true;
    for component in &components {
        let mut per_level: Vec<Vec<Selection>> = Vec::with_capacity(levels.len());
        for level in &levels {
            let allowed: Vec<usize> = component
                .iter()
                .copied()
                .filter(|&i| admitted(usable[i].cap, *level))
                .collect();
            if allowed.len() <= MAX_EXACT_COMPONENT {
                per_level.push(solve_exact(&usable, &hard, &allowed));
            } else {
                warn!(
                    size = allowed.len(),
                    "component exceeds exact-solve bound, using greedy selection"
                );
                all_optimal = false;
                per_level.push(vec![solve_greedy(&usable, &hard, &allowed)]);
            }
        }
        per_component.push(per_level);
    }

    let union_at = |level_idx: usize| -> Vec<usize> {
        per_component
            .iter()
            .flat_map(|per_level| per_level[level_idx][0].members.iter().copied())
            .collect()
    };

    // Clamp-aware choice over the union: the counted value is recomputed over
    // the full member set, so a declarer gets dropped globally whenever its
    // clamp costs more than its value adds.
    let mut best_level = 0usize;
    let mut best_members = union_at(0);
    let mut best_value = counted_value(&usable, &best_members);
    for level_idx in 1..levels.len() {
        let members = union_at(level_idx);
        let value = counted_value(&usable, &members);
        let better = value > best_value
            || (value == best_value
                && (members.len() > best_members.len()
                    || (members.len() == best_members.len()
                        && ids_key(&usable, &members) < ids_key(&usable, &best_members))));
        if better {
            best_level = level_idx;
            best_members = members;
            best_value = value;
        }
    }

    let selected: HashSet<usize> = best_members.iter().copied().collect();
    for idx in 0..n {
        if !selected.contains(&idx) {
            excluded.push(ExcludedProgram {
                program_id: usable[idx].id.clone(),
                reason: exclusion_reason(&usable, &hard, idx, &selected),
            });
        }
    }

    let best_ids = sorted_ids(&usable, &best_members);
    let alternatives = build_alternatives(
        &usable,
        &per_component,
        levels.len(),
        best_level,
        &best_ids,
        all_optimal,
    );

    StackingOutcome {
        best: StackCombination {
            program_ids: best_ids,
            total_value: best_value,
            is_optimal: all_optimal,
            excluded,
        },
        alternatives,
        conflicts,
    }
}

/// Whether a candidate with this cap may be selected at the given clamp level.
/// `None` level means the combination carries no capped member at all.
fn admitted(cap: Option<f64>, level: Option<f64>) -> bool {
    match (cap, level) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(cap), Some(level)) => cap >= level,
    }
}

fn excludes_target(declarer: &CandidateProgram, target: &CandidateProgram) -> bool {
    declarer.excludes.iter().any(|t| {
        if let Some(category) = t.strip_prefix("category:") {
            target
                .categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(category))
        } else {
            t.eq_ignore_ascii_case(&target.id)
        }
    })
}

fn allows_pair(a: &CandidateProgram, b: &CandidateProgram) -> bool {
    a.allows.iter().any(|p| p.eq_ignore_ascii_case(&b.id))
        || b.allows.iter().any(|p| p.eq_ignore_ascii_case(&a.id))
}

type Adjacency = Vec<HashSet<usize>>;

/// Hard edges (mutual exclusion, unless re-allowed) constrain independence.
/// Pairwise cap breaches are reported as conflicts but impose no edge; the
/// clamp itself is applied over the whole combination.
fn build_conflict_graph(candidates: &[CandidateProgram]) -> (Adjacency, Vec<StackingConflict>) {
    let n = candidates.len();
    let mut hard: Adjacency = vec![HashSet::new(); n];
    let mut conflicts = Vec::new();

    for a in 0..n {
        for b in (a + 1)..n {
            let (ca, cb) = (&candidates[a], &candidates[b]);
            let excluded =
                (excludes_target(ca, cb) || excludes_target(cb, ca)) && !allows_pair(ca, cb);
            if excluded {
                hard[a].insert(b);
                hard[b].insert(a);
                conflicts.push(StackingConflict {
                    program_a: ca.id.clone(),
                    program_b: cb.id.clone(),
                    reason: ConflictReason::MutuallyExclusive,
                });
                continue;
            }
            let pair_cap = match (ca.cap, cb.cap) {
                (Some(x), Some(y)) => Some(x.min(y)),
                (Some(x), None) | (None, Some(x)) => Some(x),
                (None, None) => None,
            };
            if let Some(cap) = pair_cap {
                if ca.value + cb.value > cap {
                    conflicts.push(StackingConflict {
                        program_a: ca.id.clone(),
                        program_b: cb.id.clone(),
                        reason: ConflictReason::ExceedsMaxTotal,
                    });
                }
            }
        }
    }
    (hard, conflicts)
}

fn connected_components<F: Fn(usize, usize) -> bool>(n: usize, adjacent: F) -> Vec<Vec<usize>> {
    let mut visited = vec![false; n];
    let mut components = Vec::new();
    for start in 0..n {
        if visited[start] {
            continue;
        }
        let mut stack = vec![start];
        let mut component = Vec::new();
        visited[start] = true;
        while let Some(node) = stack.pop() {
            component.push(node);
            for other in 0..n {
                if !visited[other] && adjacent(node, other) {
                    visited[other] = true;
                    stack.push(other);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }
    components
}

/// Counted value of a combination: raw sum clamped to the tightest cap
/// declared by any selected member. This is the only place cap clamping
/// happens, and it always sees the full member set.
fn counted_value(candidates: &[CandidateProgram], members: &[usize]) -> f64 {
    let raw: f64 = members.iter().map(|&i| candidates[i].value).sum();
    let cap = members
        .iter()
        .filter_map(|&i| candidates[i].cap)
        .fold(f64::INFINITY, f64::min);
    raw.min(cap)
}

/// Exact branch-and-bound over hard-edge-independent subsets of the allowed
/// nodes, maximizing raw value.
///
/// Nodes are visited in value-descending order; a branch is pruned when even
/// the optimistic bound (current raw value plus all remaining values) cannot
/// beat the worst retained selection. Returns up to
/// `SELECTIONS_PER_COMPONENT` best distinct selections, best first; ties
/// prefer larger selections, then lexicographic ids.
fn solve_exact(
    candidates: &[CandidateProgram],
    hard: &Adjacency,
    allowed: &[usize],
) -> Vec<Selection> {
    let mut order: Vec<usize> = allowed.to_vec();
    order.sort_by(|&a, &b| {
        candidates[b]
            .value
            .partial_cmp(&candidates[a].value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| candidates[a].id.cmp(&candidates[b].id))
    });

    // suffix_sum[i] = total raw value of order[i..]
    let mut suffix_sum = vec![0.0; order.len() + 1];
    for i in (0..order.len()).rev() {
        suffix_sum[i] = suffix_sum[i + 1] + candidates[order[i]].value;
    }

    let mut best: Vec<Selection> = vec![Selection {
        members: Vec::new(),
        raw_value: 0.0,
    }];

    let mut chosen: Vec<usize> = Vec::new();
    branch(
        candidates,
        hard,
        &order,
        &suffix_sum,
        0,
        &mut chosen,
        &mut best,
    );
    best
}

fn branch(
    candidates: &[CandidateProgram],
    hard: &Adjacency,
    order: &[usize],
    suffix_sum: &[f64],
    depth: usize,
    chosen: &mut Vec<usize>,
    best: &mut Vec<Selection>,
) {
    let raw: f64 = chosen.iter().map(|&i| candidates[i].value).sum();
    record_selection(candidates, chosen, raw, best);

    if depth == order.len() {
        return;
    }

    // Optimistic bound: everything remaining fits.
    let bound = raw + suffix_sum[depth];
    if best.len() >= SELECTIONS_PER_COMPONENT {
        let floor = best[best.len() - 1].raw_value;
        if bound < floor {
            return;
        }
    }

    let node = order[depth];
    let compatible = chosen.iter().all(|&sel| !hard[sel].contains(&node));
    if compatible {
        chosen.push(node);
        branch(candidates, hard, order, suffix_sum, depth + 1, chosen, best);
        chosen.pop();
    }
    branch(candidates, hard, order, suffix_sum, depth + 1, chosen, best);
}

fn record_selection(
    candidates: &[CandidateProgram],
    members: &[usize],
    raw_value: f64,
    best: &mut Vec<Selection>,
) {
    let mut sorted_members = members.to_vec();
    sorted_members.sort_unstable();
    if best.iter().any(|s| s.members == sorted_members) {
        return;
    }
    best.push(Selection {
        members: sorted_members,
        raw_value,
    });
    best.sort_by(|a, b| {
        b.raw_value
            .partial_cmp(&a.raw_value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.members.len().cmp(&a.members.len()))
            .then_with(|| ids_key(candidates, &a.members).cmp(&ids_key(candidates, &b.members)))
    });
    best.truncate(SELECTIONS_PER_COMPONENT);
}

fn ids_key(candidates: &[CandidateProgram], members: &[usize]) -> Vec<String> {
    let mut ids: Vec<String> = members.iter().map(|&i| candidates[i].id.clone()).collect();
    ids.sort();
    ids
}

/// Greedy fallback for oversized components: take nodes in order of value per
/// conflict degree, skipping anything that hard-conflicts with the selection.
fn solve_greedy(
    candidates: &[CandidateProgram],
    hard: &Adjacency,
    allowed: &[usize],
) -> Selection {
    let mut order: Vec<usize> = allowed.to_vec();
    order.sort_by(|&a, &b| {
        let score_a = candidates[a].value / (1.0 + hard[a].len() as f64);
        let score_b = candidates[b].value / (1.0 + hard[b].len() as f64);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| candidates[a].id.cmp(&candidates[b].id))
    });

    let mut members: Vec<usize> = Vec::new();
    for node in order {
        if members.iter().all(|&sel| !hard[sel].contains(&node)) {
            members.push(node);
        }
    }
    members.sort_unstable();
    let raw_value = members.iter().map(|&i| candidates[i].value).sum();
    Selection { members, raw_value }
}

fn exclusion_reason(
    candidates: &[CandidateProgram],
    hard: &Adjacency,
    idx: usize,
    selected: &HashSet<usize>,
) -> String {
    let mut conflicting: Vec<&str> = hard[idx]
        .iter()
        .filter(|other| selected.contains(other))
        .map(|&other| candidates[other].id.as_str())
        .collect();
    conflicting.sort_unstable();
    if !conflicting.is_empty() {
        return format!("conflicts with {}", conflicting.join(", "));
    }
    // No hard conflict with the selection: the solver takes every compatible
    // node, so the only other way out is the program's own cap making its
    // inclusion unprofitable.
    if candidates[idx].cap.is_some() {
        return format!(
            "capped by max_total_value rule of {}",
            candidates[idx].id
        );
    }
    "not selected".to_string()
}

fn sorted_ids(candidates: &[CandidateProgram], members: &[usize]) -> Vec<String> {
    let mut ids: Vec<String> = members.iter().map(|&i| candidates[i].id.clone()).collect();
    ids.sort();
    ids
}

/// Alternatives: the unions at the non-winning clamp levels, plus variants
/// that swap exactly one component to its runner-up selection at the winning
/// level. Every variant's value is recomputed over its full member set, so
/// alternatives honor caps the same way the best combination does.
fn build_alternatives(
    candidates: &[CandidateProgram],
    per_component: &[Vec<Vec<Selection>>],
    level_count: usize,
    best_level: usize,
    best_ids: &[String],
    all_optimal: bool,
) -> Vec<StackCombination> {
    let mut variants: Vec<(f64, Vec<usize>)> = Vec::new();

    for level_idx in 0..level_count {
        if level_idx == best_level {
            continue;
        }
        let members: Vec<usize> = per_component
            .iter()
            .flat_map(|per_level| per_level[level_idx][0].members.iter().copied())
            .collect();
        let value = counted_value(candidates, &members);
        variants.push((value, members));
    }

    for (swap_idx, per_level) in per_component.iter().enumerate() {
        for alt in per_level[best_level].iter().skip(1) {
            let members: Vec<usize> = per_component
                .iter()
                .enumerate()
                .flat_map(|(i, p)| {
                    if i == swap_idx {
                        alt.members.clone()
                    } else {
                        p[best_level][0].members.clone()
                    }
                })
                .collect();
            let value = counted_value(candidates, &members);
            variants.push((value, members));
        }
    }

    variants.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ids_key(candidates, &a.1).cmp(&ids_key(candidates, &b.1)))
    });

    let mut seen: HashSet<Vec<String>> = HashSet::new();
    seen.insert(best_ids.to_vec());
    let mut out = Vec::new();
    for (value, members) in variants {
        let ids = sorted_ids(candidates, &members);
        if !seen.insert(ids.clone()) {
            continue;
        }
        out.push(StackCombination {
            program_ids: ids,
            total_value: value,
            is_optimal: all_optimal,
            excluded: Vec::new(),
        });
        if out.len() == MAX_ALTERNATIVES {
            break;
        }
    }
    out
}

/// Convenience for callers holding records: pairs each record with its
/// profile-estimated value and optimizes.
pub fn optimize_records<'a, I>(records: I) -> StackingOutcome
where
    I: IntoIterator<Item = (&'a ProgramRecord, f64)>,
{
    let candidates = records
        .into_iter()
        .map(|(record, value)| CandidateProgram::from_record(record, value))
        .collect();
    optimize(candidates)
}
