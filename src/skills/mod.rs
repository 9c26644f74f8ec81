//! Skill index and budgeted selection.

pub mod budget;
pub mod index;

pub use budget::{estimate_tokens, merge_constraints, select_within_budget};
pub use index::{ResolvedSkill, SkillConstraints, SkillEntry, SkillError, SkillIndex};
