//! Retrieval scoring: similarity blended with recency decay and usage.

use chrono::{DateTime, Utc};

use super::types::{MemoryKind, MemoryRecord};

/// Weight on raw vector similarity.
pub const ALPHA: f32 = 0.55;
/// Weight on recency decay.
pub const BETA: f32 = 0.25;
/// Weight on access utility.
pub const GAMMA: f32 = 0.20;

/// Exponential half-life decay for a record of `kind` aged `age_days`.
/// System rules never decay.
pub fn decay(kind: MemoryKind, age_days: f64) -> f32 {
    match kind.half_life_days() {
        None => 1.0,
        Some(half_life) => {
            let age = age_days.max(0.0);
            (0.5f64.powf(age / half_life)) as f32
        }
    }
}

/// Usage utility: `min(1, log10(access_count + 1) / 3)`.
pub fn utility(access_count: u32) -> f32 {
    let raw = ((access_count as f64) + 1.0).log10() / 3.0;
    raw.min(1.0) as f32
}

/// Final retrieval score for a record against a query similarity.
pub fn score(similarity: f32, record: &MemoryRecord, now: DateTime<Utc>) -> f32 {
    let age_days = (now - record.created_at).num_seconds() as f64 / 86_400.0;
    ALPHA * similarity + BETA * decay(record.kind, age_days) + GAMMA * utility(record.access_count)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
