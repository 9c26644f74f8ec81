//! Progressive disclosure: fitting skills into a per-request token budget.

use super::index::{ResolvedSkill, SkillConstraints};

/// Rough token estimate used for budgeting: one token per four chars.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Keep skills in input order while their estimated cost fits the budget;
/// oversized ones are dropped and later (smaller) ones may still fit.
pub fn select_within_budget(
    skills: Vec<ResolvedSkill>,
    token_budget: usize,
) -> (Vec<ResolvedSkill>, Vec<String>) {
    let mut remaining = token_budget;
    let mut kept = Vec::new();
    let mut dropped = Vec::new();

    for skill in skills {
        let cost = estimate_tokens(&skill.content);
        if cost <= remaining {
            remaining -= cost;
            kept.push(skill);
        } else {
            dropped.push(skill.entry.id.clone());
        }
    }
    (kept, dropped)
}

/// Merge constraints across the selected skills.
///
/// Skills can only narrow: `allowed_tools` is the intersection of the
/// non-empty lists (empty = unrestricted), `denied_tools` is the union,
/// and the capability flags AND together.
pub fn merge_constraints(constraints: &[SkillConstraints]) -> SkillConstraints {
    let mut allowed: Option<Vec<String>> = None;
    let mut denied: Vec<String> = Vec::new();
    let mut network = true;
    let mut shell = true;

    for c in constraints {
        if !c.allowed_tools.is_empty() {
            allowed = Some(match allowed {
                None => c.allowed_tools.clone(),
                Some(current) => current
                    .into_iter()
                    .filter(|t| c.allowed_tools.contains(t))
                    .collect(),
            });
        }
        for tool in &c.denied_tools {
            if !denied.contains(tool) {
                denied.push(tool.clone());
            }
        }
        network &= c.network_access;
        shell &= c.shell_access;
    }

    SkillConstraints {
        allowed_tools: allowed.unwrap_or_default(),
        denied_tools: denied,
        network_access: network,
        shell_access: shell,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
