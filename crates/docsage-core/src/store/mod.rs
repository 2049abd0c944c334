//! Storage abstraction for docsage.
//!
//! The [`Store`] trait defines every index operation needed by the
//! synchronizer and the retriever, enabling pluggable backends (SQLite in
//! the app crate, [`memory::InMemoryStore`] for tests).
//!
//! Implementations must be `Send + Sync`: a single synchronizer writes while
//! any number of retrievers read through the same `Arc<dyn Store>`.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::{DocumentEntry, IndexRecord, RecordKey, ScoredChunk};

/// Outcome of [`Store::commit_document`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    /// Records inserted or replaced.
    pub upserted: usize,
    /// Records removed because their chunk no longer exists.
    pub deleted: usize,
}

/// Index-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub records: usize,
    /// Records embedded with the model the stats were requested for.
    pub valid_records: usize,
    /// Records left over from another model.
    pub stale_records: usize,
}

/// Abstract storage backend for the index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](Store::upsert) | Insert or replace one record |
/// | [`delete`](Store::delete) | Remove one record |
/// | [`search`](Store::search) | Cosine nearest-neighbour search |
/// | [`keyword_search`](Store::keyword_search) | Term-match search for hybrid mode |
/// | [`commit_document`](Store::commit_document) | Apply a reconciled document in one transaction |
/// | [`delete_document`](Store::delete_document) | Drop a document and its records |
/// | [`manifest`](Store::manifest) | List indexed documents |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace one record atomically.
    ///
    /// Returns the new `indexed_seq`, which increases monotonically.
    async fn upsert(&self, record: &IndexRecord) -> Result<i64>;

    /// Remove one record. Returns whether it existed.
    async fn delete(&self, chunk_id: &str) -> Result<bool>;

    /// Rank records of `model` by cosine similarity to `query_vec`.
    ///
    /// Records of another model or dimensionality are never returned.
    /// Ordering: score descending, `indexed_seq` descending, chunk id
    /// ascending.
    async fn search(&self, query_vec: &[f32], k: usize, model: &str) -> Result<Vec<ScoredChunk>>;

    /// Rank records of `model` by term match against `query`.
    async fn keyword_search(&self, query: &str, k: usize, model: &str) -> Result<Vec<ScoredChunk>>;

    /// Identity and validity keys of a document's records, by chunk index.
    async fn document_records(&self, document_id: &str) -> Result<Vec<RecordKey>>;

    /// Any stored vector for `(model, content_hash)`, for reuse.
    async fn find_vector(&self, model: &str, content_hash: &str) -> Result<Option<Vec<f32>>>;

    /// Replace a document's manifest entry and records in one transaction.
    ///
    /// Records of the document that are absent from `records` are deleted.
    /// Records whose content hash, model, dimensionality, or position are
    /// unchanged keep their `indexed_seq`.
    async fn commit_document(
        &self,
        entry: &DocumentEntry,
        records: &[IndexRecord],
    ) -> Result<CommitStats>;

    /// Remove a document's manifest entry and records. Returns the number
    /// of records removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    /// All manifest entries, ordered by path.
    async fn manifest(&self) -> Result<Vec<DocumentEntry>>;

    /// Number of records embedded with `model`.
    async fn record_count(&self, model: &str) -> Result<usize>;

    async fn stats(&self, model: &str) -> Result<StoreStats>;

    /// Drop every record and manifest entry.
    async fn clear(&self) -> Result<()>;
}
