//! Idempotent markdown → vector synchronisation.
//!
//! Watched markdown files are chunked by `##` headers, normalised, hashed,
//! and diffed against a persisted state file so that only changed chunks
//! are re-embedded.  Point ids are UUIDv5 over `{filePath}:{headingPath}`
//! under a fixed namespace, so re-running the sync across processes and
//! restarts always addresses the same points.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::embeddings::EmbeddingProvider;
use super::vector::{VectorPoint, VectorStore, VectorStoreError};

/// Namespace for deterministic chunk point ids.
pub const SYNC_NAMESPACE: Uuid = Uuid::from_u128(0x8c5b1ee4_9d3a_4a0f_b6e2_cf4a1d0b7a21);

/// Sections longer than this are split at paragraph boundaries.
pub const MAX_SECTION_CHARS: usize = 4096;

/// Chunks shorter than this (after normalisation) are discarded.
pub const MIN_CHUNK_CHARS: usize = 32;

/// Name of the persisted sync state file inside the watch directory.
pub const STATE_FILE: &str = ".memory-sync-state.json";

/// Payload marker for markdown chunks in the shared vector store.
pub const PAYLOAD_KIND: &str = "markdown_chunk";

// ─── Normalisation ───────────────────────────────────────────────────────────

/// Normalise markdown text: LF line endings, no trailing whitespace per
/// line, at most two consecutive blank lines, trimmed ends.
pub fn normalize(text: &str) -> String {
    let unix = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unix.len());
    let mut blank_run = 0usize;
    for line in unix.split('\n') {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

// ─── Chunking ────────────────────────────────────────────────────────────────

/// One addressable chunk of a markdown file.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownChunk {
    /// Path relative to the watch directory.
    pub file_path: String,
    /// `##` heading text; empty for content before the first heading.
    pub heading: String,
    /// Deterministic vector-store id.
    pub point_id: String,
    /// Normalised chunk text (header line included).
    pub text: String,
    /// SHA-256 of `text`, hex-encoded.
    pub content_hash: String,
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn point_id(file_path: &str, heading_path: &str) -> String {
    Uuid::new_v5(&SYNC_NAMESPACE, format!("{file_path}:{heading_path}").as_bytes()).to_string()
}

/// Split one markdown document into chunks.
pub fn chunk_markdown(file_path: &str, content: &str) -> Vec<MarkdownChunk> {
    // Sections: preamble plus one per `## ` heading.
    let unix = content.replace("\r\n", "\n");
    let mut sections: Vec<(String, Vec<&str>)> = vec![(String::new(), Vec::new())];
    for line in unix.split('\n') {
        if let Some(heading) = line.strip_prefix("## ") {
            sections.push((heading.trim().to_string(), vec![line]));
        } else if let Some((_, lines)) = sections.last_mut() {
            lines.push(line);
        }
    }

    let mut chunks = Vec::new();
    for (heading, lines) in sections {
        let normalized = normalize(&lines.join("\n"));
        if normalized.len() < MIN_CHUNK_CHARS {
            continue;
        }
        let parts = if normalized.len() > MAX_SECTION_CHARS {
            split_section(&heading, &normalized)
        } else {
            vec![normalized]
        };
        for (part_no, text) in parts.into_iter().enumerate() {
            if text.len() < MIN_CHUNK_CHARS {
                continue;
            }
            let heading_path = if part_no == 0 {
                heading.clone()
            } else {
                format!("{heading}#{part_no}")
            };
            chunks.push(MarkdownChunk {
                file_path: file_path.to_string(),
                heading: heading.clone(),
                point_id: point_id(file_path, &heading_path),
                content_hash: hash_text(&text),
                text,
            });
        }
    }
    chunks
}

/// Split an oversized section at paragraph boundaries; every part keeps
/// the section header.
fn split_section(heading: &str, normalized: &str) -> Vec<String> {
    let header_line = if heading.is_empty() {
        String::new()
    } else {
        format!("## {heading}")
    };

    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    for paragraph in normalized.split("\n\n") {
        let candidate_len = current.len() + paragraph.len() + 2;
        if !current.is_empty() && candidate_len > MAX_SECTION_CHARS {
            parts.push(current.trim().to_string());
            current = header_line.clone();
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

// ─── Persisted state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateEntry {
    pub point_id: String,
    pub file_path: String,
    pub heading: String,
    pub content_hash: String,
    pub last_synced_at: DateTime<Utc>,
}

/// State file contents: content-hash → entry.
pub type SyncState = HashMap<String, SyncStateEntry>;

fn load_state(dir: &Path) -> SyncState {
    std::fs::read_to_string(dir.join(STATE_FILE))
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn save_state(dir: &Path, state: &SyncState) -> Result<(), SyncError> {
    let tmp = dir.join(format!("{STATE_FILE}.tmp"));
    let body = serde_json::to_vec_pretty(state).map_err(|e| SyncError::State(e.to_string()))?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, dir.join(STATE_FILE))?;
    Ok(())
}

// ─── Diff plan ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
pub struct SyncPlan {
    pub to_create: Vec<MarkdownChunk>,
    pub to_update: Vec<MarkdownChunk>,
    pub unchanged: Vec<MarkdownChunk>,
    /// Point ids present in state but absent from the current chunk set.
    pub to_delete: Vec<String>,
}

/// Classify current chunks against persisted state.
pub fn plan_sync(chunks: Vec<MarkdownChunk>, state: &SyncState) -> SyncPlan {
    let known_points: HashMap<&str, &SyncStateEntry> =
        state.values().map(|e| (e.point_id.as_str(), e)).collect();
    let current_points: HashSet<&str> = chunks.iter().map(|c| c.point_id.as_str()).collect();

    let mut deleted: Vec<String> = state
        .values()
        .filter(|e| !current_points.contains(e.point_id.as_str()))
        .map(|e| e.point_id.clone())
        .collect();
    deleted.sort();
    deleted.dedup();

    let mut plan = SyncPlan::default();
    for chunk in chunks {
        if state.contains_key(&chunk.content_hash) {
            plan.unchanged.push(chunk);
        } else if known_points.contains_key(chunk.point_id.as_str()) {
            plan.to_update.push(chunk);
        } else {
            plan.to_create.push(chunk);
        }
    }

    plan.to_delete = deleted;
    plan
}

// ─── Errors / report ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sync state error: {0}")]
    State(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error(transparent)]
    Vector(#[from] VectorStoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

// ─── MarkdownSync ────────────────────────────────────────────────────────────

/// The sync engine for one watched directory.
pub struct MarkdownSync {
    watch_dir: PathBuf,
    matcher: Option<GlobMatcher>,
    embeddings: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl MarkdownSync {
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        embeddings: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            // "*.md" always compiles; the extension fallback below only
            // exists to keep this constructor infallible.
            matcher: Glob::new("*.md").map(|g| g.compile_matcher()).ok(),
            embeddings,
            store,
        }
    }

    fn is_watched(&self, name: &std::ffi::OsStr) -> bool {
        match &self.matcher {
            Some(matcher) => matcher.is_match(name),
            None => name.to_string_lossy().ends_with(".md"),
        }
    }

    /// Synchronise every matching file in the watch directory.
    ///
    /// Embeds only created and updated chunks, deletes orphaned points,
    /// and persists the new state.  Running twice on identical inputs is a
    /// no-op: zero upserts, zero deletes, identical point ids.
    pub async fn batch_import(&self) -> Result<SyncReport, SyncError> {
        let previous = load_state(&self.watch_dir);
        let chunks = self.collect_chunks()?;
        let plan = plan_sync(chunks, &previous);

        let report = SyncReport {
            created: plan.to_create.len(),
            updated: plan.to_update.len(),
            deleted: plan.to_delete.len(),
            unchanged: plan.unchanged.len(),
        };

        // Embed and upsert only the changed chunks.
        let mut points = Vec::new();
        for chunk in plan.to_create.iter().chain(plan.to_update.iter()) {
            let vector = self
                .embeddings
                .embed(&chunk.text)
                .await
                .map_err(SyncError::Embedding)?;
            points.push(VectorPoint {
                id: chunk.point_id.clone(),
                vector,
                payload: serde_json::json!({
                    "kind": PAYLOAD_KIND,
                    "filePath": chunk.file_path,
                    "heading": chunk.heading,
                    "text": chunk.text,
                }),
            });
        }
        if !points.is_empty() {
            self.store.upsert(points).await?;
        }
        if !plan.to_delete.is_empty() {
            self.store.delete(&plan.to_delete).await?;
        }

        // New state covers exactly the current chunk set; unchanged
        // entries keep their original sync timestamp.
        let now = Utc::now();
        let mut state = SyncState::new();
        for chunk in plan
            .unchanged
            .iter()
            .chain(plan.to_create.iter())
            .chain(plan.to_update.iter())
        {
            let last_synced_at = previous
                .get(&chunk.content_hash)
                .map(|e| e.last_synced_at)
                .unwrap_or(now);
            state.insert(
                chunk.content_hash.clone(),
                SyncStateEntry {
                    point_id: chunk.point_id.clone(),
                    file_path: chunk.file_path.clone(),
                    heading: chunk.heading.clone(),
                    content_hash: chunk.content_hash.clone(),
                    last_synced_at,
                },
            );
        }
        // Unchanged state is not rewritten: the state file lives inside
        // the watch directory, and a gratuitous write would feed the
        // watcher its own sync forever.
        if state != previous {
            save_state(&self.watch_dir, &state)?;
        }

        log::info!(
            "markdown sync: +{} ~{} -{} ={} ({})",
            report.created,
            report.updated,
            report.deleted,
            report.unchanged,
            self.watch_dir.display()
        );
        Ok(report)
    }

    fn collect_chunks(&self) -> Result<Vec<MarkdownChunk>, SyncError> {
        let mut chunks = Vec::new();
        let entries = match std::fs::read_dir(&self.watch_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(chunks),
            Err(e) => return Err(e.into()),
        };
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name() else {
                continue;
            };
            if path.is_file() && self.is_watched(name) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let relative = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content = std::fs::read_to_string(&path)?;
            chunks.extend(chunk_markdown(&relative, &content));
        }
        Ok(chunks)
    }
}

/// Start a filesystem watcher that re-runs the sync on any change in the
/// watch directory.  The returned watcher must stay alive for events to
/// flow; dropping it stops the feed and ends the task.
pub fn spawn_watcher(
    sync: Arc<MarkdownSync>,
) -> notify::Result<(RecommendedWatcher, tokio::task::JoinHandle<()>)> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if event.is_ok() {
            let _ = tx.send(());
        }
    })?;
    watcher.watch(&sync.watch_dir, RecursiveMode::NonRecursive)?;

    let handle = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Coalesce bursts of events into one pass.
            while rx.try_recv().is_ok() {}
            if let Err(e) = sync.batch_import().await {
                log::warn!("markdown sync: import failed: {e}");
            }
        }
    });
    Ok((watcher, handle))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
