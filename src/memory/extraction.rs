//! Fact extraction: conversation window → validated memory records.
//!
//! The extractor itself is injected (an LLM call in production); this
//! module owns robust parsing of its output, schema validation, and the
//! dedup / supersede decisions against the vector store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::embeddings::EmbeddingProvider;
use super::types::{MemoryKind, MemoryRecord, merge_capped};
use super::vector::{Filter, VectorPoint, VectorStore, VectorStoreError};

/// Nearest-neighbour similarity at or above which a fact is a duplicate.
pub const DEDUP_THRESHOLD: f32 = 0.92;

/// Similarity at or above which a newer, at-least-as-confident fact
/// supersedes its neighbour.
pub const SUPERSEDE_THRESHOLD: f32 = 0.75;

/// Payload marker distinguishing memory records from other point kinds
/// sharing the vector store.
pub const PAYLOAD_KIND: &str = "memory_record";

// ─── FactExtractor ───────────────────────────────────────────────────────────

/// Injected extraction backend.  Receives the composed prompts and returns
/// raw model output; everything downstream is handled here.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(&self, system_prompt: &str, user_prompt: &str) -> Result<String, String>;
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// One fact as emitted by the extractor, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFact {
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: u8,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_importance() -> u8 {
    3
}

fn default_confidence() -> f32 {
    0.8
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extractor call failed: {0}")]
    Extractor(String),

    #[error("extractor output is not valid JSON: {0}")]
    Parse(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error(transparent)]
    Vector(#[from] VectorStoreError),
}

/// Parse extractor output into facts.
///
/// Accepts a bare JSON object `{"facts": [...]}`, the same wrapped in a
/// fenced code block (with or without a `json` language tag), or JSON
/// surrounded by prose.
pub fn parse_facts(raw: &str) -> Result<Vec<ExtractedFact>, ExtractionError> {
    let body = extract_json(raw.trim());

    #[derive(Deserialize)]
    struct Envelope {
        facts: Vec<serde_json::Value>,
    }

    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| ExtractionError::Parse(e.to_string()))?;

    // Individually undecodable facts are dropped here; schema-invalid ones
    // are counted as `failed` during storage.
    Ok(envelope
        .facts
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

/// Pull the JSON object out of possibly-fenced, possibly-prosy output.
fn extract_json(raw: &str) -> &str {
    // Fenced block anywhere in the response wins.
    if let Some(start) = raw.find("```") {
        let rest = &raw[start + 3..];
        let rest = match rest.find('\n') {
            Some(i) => &rest[i + 1..],
            None => rest,
        };
        if let Some(end) = rest.find("```") {
            return rest[..end].trim();
        }
    }
    // Otherwise the outermost braces.
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => raw,
    }
}

/// Validate one fact against the schema caps.
fn validate_fact(fact: &ExtractedFact) -> Result<(), String> {
    if fact.content.trim().is_empty() {
        return Err("empty content".into());
    }
    if !(1..=5).contains(&fact.importance) {
        return Err(format!("importance {} outside 1..=5", fact.importance));
    }
    if !(0.0..=1.0).contains(&fact.confidence) {
        return Err(format!("confidence {} outside [0, 1]", fact.confidence));
    }
    for (name, list) in [
        ("tags", &fact.tags),
        ("people", &fact.people),
        ("projects", &fact.projects),
    ] {
        if list.len() > super::types::MAX_LIST_ITEMS {
            return Err(format!("{name} over cap"));
        }
    }
    Ok(())
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

/// Outcome counts for one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionSummary {
    pub extracted: usize,
    pub inserted: usize,
    pub deduped: usize,
    pub superseded: usize,
    pub failed: usize,
}

/// Extraction pipeline over the shared vector store.
pub struct MemoryPipeline {
    extractor: Arc<dyn FactExtractor>,
    embeddings: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl MemoryPipeline {
    pub fn new(
        extractor: Arc<dyn FactExtractor>,
        embeddings: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            extractor,
            embeddings,
            store,
        }
    }

    /// Run extraction over a message window and persist the results.
    pub async fn extract_from_window(
        &self,
        messages: &[(String, String)],
    ) -> Result<ExtractionSummary, ExtractionError> {
        let system_prompt = "Extract durable memories from the conversation. Respond with \
                             JSON: {\"facts\": [{\"type\", \"content\", \"tags\", \"people\", \
                             \"projects\", \"importance\", \"confidence\"}]}";
        let user_prompt = messages
            .iter()
            .map(|(role, content)| format!("{role}: {content}"))
            .collect::<Vec<_>>()
            .join("\n");

        let raw = self
            .extractor
            .extract(system_prompt, &user_prompt)
            .await
            .map_err(ExtractionError::Extractor)?;
        let facts = parse_facts(&raw)?;
        self.store_facts(facts).await
    }

    /// Dedup / supersede / insert each fact.
    pub async fn store_facts(
        &self,
        facts: Vec<ExtractedFact>,
    ) -> Result<ExtractionSummary, ExtractionError> {
        let mut summary = ExtractionSummary {
            extracted: facts.len(),
            ..Default::default()
        };
        let filter = Filter::matching("kind", serde_json::json!(PAYLOAD_KIND));

        for fact in facts {
            if let Err(reason) = validate_fact(&fact) {
                log::debug!("memory: dropping invalid fact: {reason}");
                summary.failed += 1;
                continue;
            }

            let vector = self
                .embeddings
                .embed(&fact.content)
                .await
                .map_err(ExtractionError::Embedding)?;

            let neighbours = self.store.search(&vector, Some(&filter), 1).await?;
            let nearest = neighbours.first();

            let mut record = MemoryRecord::new(fact.kind, fact.content, "session_extraction");
            record.tags = fact.tags;
            record.people = fact.people;
            record.projects = fact.projects;
            record.importance = fact.importance;
            record.confidence = fact.confidence;

            match nearest {
                Some(hit) if hit.score >= DEDUP_THRESHOLD => {
                    summary.deduped += 1;
                    continue;
                }
                Some(hit) if hit.score >= SUPERSEDE_THRESHOLD => {
                    let existing: Option<MemoryRecord> =
                        serde_json::from_value(hit.point.payload.get("record").cloned().unwrap_or_default())
                            .ok();
                    if let Some(existing) = existing {
                        let newer = record.created_at > existing.created_at;
                        if newer && record.confidence >= existing.confidence {
                            record.supersedes_id = Some(existing.id.clone());
                            record.tags = merge_capped(&record.tags, &existing.tags);
                            record.people = merge_capped(&record.people, &existing.people);
                            record.projects = merge_capped(&record.projects, &existing.projects);
                            self.upsert_record(&record, vector).await?;
                            summary.superseded += 1;
                            continue;
                        }
                    }
                    // Similar but not supersedable: plain insert.
                    self.upsert_record(&record, vector).await?;
                    summary.inserted += 1;
                }
                _ => {
                    self.upsert_record(&record, vector).await?;
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn upsert_record(
        &self,
        record: &MemoryRecord,
        vector: Vec<f32>,
    ) -> Result<(), ExtractionError> {
        let point = VectorPoint {
            id: record.id.clone(),
            vector,
            payload: serde_json::json!({
                "kind": PAYLOAD_KIND,
                "record": record,
                "createdAt": record.created_at.to_rfc3339(),
            }),
        };
        self.store.upsert(vec![point]).await?;
        Ok(())
    }

    /// Retrieve records for a query, scored per the retrieval policy.
    pub async fn recall(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(MemoryRecord, f32)>, ExtractionError> {
        let vector = self
            .embeddings
            .embed(query)
            .await
            .map_err(ExtractionError::Embedding)?;
        let filter = Filter::matching("kind", serde_json::json!(PAYLOAD_KIND));
        let hits = self.store.search(&vector, Some(&filter), limit.max(1) * 4).await?;

        let now = Utc::now();
        let mut scored: Vec<(MemoryRecord, f32)> = hits
            .into_iter()
            .filter_map(|hit| {
                let record: MemoryRecord =
                    serde_json::from_value(hit.point.payload.get("record").cloned()?).ok()?;
                let s = super::scoring::score(hit.score, &record, now);
                Some((record, s))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
