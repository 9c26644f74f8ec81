//! Long-term memory: extraction, retrieval scoring, markdown sync,
//! correction clustering, and signal correlation over a shared vector
//! store abstraction.

pub mod cluster;
pub mod embeddings;
pub mod extraction;
pub mod scoring;
pub mod signals;
pub mod sync;
pub mod types;
pub mod vector;

pub use cluster::{CorrectionProposal, FeedbackEntry, cluster_corrections};
pub use embeddings::{
    EMBEDDING_DIM, EmbeddingProvider, HashEmbedding, LruEmbeddingCache, cosine_similarity,
};
pub use extraction::{
    DEDUP_THRESHOLD, ExtractedFact, ExtractionError, ExtractionSummary, FactExtractor,
    MemoryPipeline, SUPERSEDE_THRESHOLD, parse_facts,
};
pub use scoring::{decay, score, utility};
pub use signals::{CrossSignal, DEFAULT_MIN_OVERLAP, Severity, Signal, correlate, tokenize};
pub use sync::{
    MarkdownChunk, MarkdownSync, SyncError, SyncReport, chunk_markdown, normalize, plan_sync,
    spawn_watcher,
};
pub use types::{MAX_LIST_ITEMS, MemoryKind, MemoryRecord, merge_capped};
pub use vector::{Filter, InMemoryVectorStore, ScoredPoint, VectorPoint, VectorStore,
    VectorStoreError};
