//! Vector store abstraction shared by the memory pipelines.
//!
//! The real deployment fronts an external vector database; the in-memory
//! implementation here serves tests and single-process installs.  Both
//! sides speak the same four operations: upsert, search, get, delete.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::embeddings::cosine_similarity;

// ─── Types ───────────────────────────────────────────────────────────────────

/// One stored point: deterministic id, vector, opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// Search hit with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub point: VectorPoint,
    pub score: f32,
}

/// Equality filter over top-level payload fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub must: Vec<(String, serde_json::Value)>,
}

impl Filter {
    pub fn matching(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            must: vec![(key.into(), value)],
        }
    }

    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        self.must
            .iter()
            .all(|(key, expected)| payload.get(key) == Some(expected))
    }
}

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("vector store error: {0}")]
    Backend(String),
}

// ─── VectorStore trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace points by id.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), VectorStoreError>;

    /// Nearest neighbours by cosine similarity, best first.
    async fn search(
        &self,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<VectorPoint>, VectorStoreError>;

    async fn delete(&self, ids: &[String]) -> Result<(), VectorStoreError>;

    async fn count(&self) -> Result<usize, VectorStoreError>;
}

// ─── InMemoryVectorStore ─────────────────────────────────────────────────────

/// HashMap-backed store with linear-scan search.
#[derive(Default)]
pub struct InMemoryVectorStore {
    points: Arc<RwLock<HashMap<String, VectorPoint>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), VectorStoreError> {
        let mut map = write(&self.points);
        for point in points {
            map.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        let map = read(&self.points);
        let mut hits: Vec<ScoredPoint> = map
            .values()
            .filter(|p| filter.is_none_or(|f| f.matches(&p.payload)))
            .map(|p| ScoredPoint {
                score: cosine_similarity(vector, &p.vector),
                point: p.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VectorPoint>, VectorStoreError> {
        Ok(read(&self.points).get(id).cloned())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), VectorStoreError> {
        let mut map = write(&self.points);
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, VectorStoreError> {
        Ok(read(&self.points).len())
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
