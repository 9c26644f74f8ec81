//! Long-term memory record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum entries allowed in each of tags / people / projects.
pub const MAX_LIST_ITEMS: usize = 10;

// ─── MemoryKind ──────────────────────────────────────────────────────────────

/// Semantic classification of a memory record; drives retrieval decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Fact,
    Preference,
    Event,
    SystemRule,
}

impl MemoryKind {
    /// Decay half-life in days; `None` means the record never decays.
    pub fn half_life_days(self) -> Option<f64> {
        match self {
            MemoryKind::Fact => Some(365.0),
            MemoryKind::Preference => Some(180.0),
            MemoryKind::Event => Some(14.0),
            MemoryKind::SystemRule => None,
        }
    }
}

// ─── MemoryRecord ────────────────────────────────────────────────────────────

/// One persisted memory.
///
/// A record that supersedes another never deletes it; the chain stays in
/// the store for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    /// 1 (trivial) to 5 (critical).
    pub importance: u8,
    /// Extractor confidence in [0, 1].
    pub confidence: f32,
    /// Where this memory came from (e.g. `"session_extraction"`).
    pub source: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes_id: Option<String>,
}

impl MemoryRecord {
    pub fn new(kind: MemoryKind, content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            tags: Vec::new(),
            people: Vec::new(),
            projects: Vec::new(),
            importance: 3,
            confidence: 0.8,
            source: source.into(),
            created_at: Utc::now(),
            access_count: 0,
            last_accessed_at: None,
            supersedes_id: None,
        }
    }

    /// Validate the schema caps.  Returns the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.content.trim().is_empty() {
            return Err("content is empty".into());
        }
        if !(1..=5).contains(&self.importance) {
            return Err(format!("importance {} outside 1..=5", self.importance));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        for (name, list) in [
            ("tags", &self.tags),
            ("people", &self.people),
            ("projects", &self.projects),
        ] {
            if list.len() > MAX_LIST_ITEMS {
                return Err(format!("{name} has {} items (max {MAX_LIST_ITEMS})", list.len()));
            }
        }
        Ok(())
    }
}

/// Union two bounded lists, preserving `base` order and capping the result.
pub fn merge_capped(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = base.to_vec();
    for item in extra {
        if merged.len() >= MAX_LIST_ITEMS {
            break;
        }
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged.truncate(MAX_LIST_ITEMS);
    merged
}

// ─── Tests ───────────────────────────────────────────────────────────────────
