//! Correction clustering: grouping similar feedback into proposals.
//!
//! Feedback entries are unioned whenever a pair's cosine similarity meets
//! the threshold; clusters that reach the minimum size become proposals
//! whose confidence reflects internal cohesion and cluster mass.

use serde::{Deserialize, Serialize};

use super::embeddings::cosine_similarity;

/// Confidence bonus per clustered entry, capped.
const SIZE_BONUS_PER_ENTRY: f32 = 0.03;
const SIZE_BONUS_CAP: f32 = 0.2;
const CONFIDENCE_CAP: f32 = 0.99;

// ─── Types ───────────────────────────────────────────────────────────────────

/// One piece of correction feedback with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub target_file: Option<String>,
}

/// A surviving cluster, ready to become a correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionProposal {
    pub entry_ids: Vec<String>,
    pub size: usize,
    pub confidence: f32,
    /// Majority vote among member `target_file`s; `None` when all are.
    pub target_file: Option<String>,
}

// ─── Union-find ──────────────────────────────────────────────────────────────

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root; // path compression
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

// ─── cluster_corrections ─────────────────────────────────────────────────────

/// Cluster feedback entries and emit proposals.
///
/// Output ordering: cluster size descending, then confidence descending.
pub fn cluster_corrections(
    entries: &[FeedbackEntry],
    similarity_threshold: f32,
    min_cluster_size: usize,
) -> Vec<CorrectionProposal> {
    if entries.is_empty() {
        return Vec::new();
    }

    let mut uf = UnionFind::new(entries.len());
    for i in 0..entries.len() {
        for j in (i + 1)..entries.len() {
            if cosine_similarity(&entries[i].embedding, &entries[j].embedding)
                >= similarity_threshold
            {
                uf.union(i, j);
            }
        }
    }

    // Group member indexes by root.
    let mut clusters: std::collections::HashMap<usize, Vec<usize>> =
        std::collections::HashMap::new();
    for i in 0..entries.len() {
        clusters.entry(uf.find(i)).or_default().push(i);
    }

    let mut proposals: Vec<CorrectionProposal> = clusters
        .into_values()
        .filter(|members| members.len() >= min_cluster_size.max(1))
        .map(|members| build_proposal(entries, &members))
        .collect();

    proposals.sort_by(|a, b| {
        b.size
            .cmp(&a.size)
            .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });
    proposals
}

fn build_proposal(entries: &[FeedbackEntry], members: &[usize]) -> CorrectionProposal {
    let size = members.len();

    // Average pairwise similarity inside the cluster (1.0 for singletons).
    let mut pair_total = 0.0f32;
    let mut pair_count = 0usize;
    for (a, &i) in members.iter().enumerate() {
        for &j in members.iter().skip(a + 1) {
            pair_total += cosine_similarity(&entries[i].embedding, &entries[j].embedding);
            pair_count += 1;
        }
    }
    let cohesion = if pair_count == 0 {
        1.0
    } else {
        pair_total / pair_count as f32
    };

    let bonus = (SIZE_BONUS_PER_ENTRY * size as f32).min(SIZE_BONUS_CAP);
    let confidence = (cohesion + bonus).min(CONFIDENCE_CAP);

    // Majority vote over non-null target files; ties break lexically so
    // the result is deterministic.
    let mut votes: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for &i in members {
        if let Some(file) = entries[i].target_file.as_deref() {
            *votes.entry(file).or_default() += 1;
        }
    }
    let target_file = votes
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
        .map(|(file, _)| file.to_string());

    let mut entry_ids: Vec<String> = members.iter().map(|&i| entries[i].id.clone()).collect();
    entry_ids.sort();

    CorrectionProposal {
        entry_ids,
        size,
        confidence,
        target_file,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
