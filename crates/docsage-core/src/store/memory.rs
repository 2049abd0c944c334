//! In-memory [`Store`] implementation for tests and embedding in other
//! programs.
//!
//! All state lives behind one `std::sync::RwLock`, so every mutation is
//! atomic with respect to readers. Vector search is brute-force cosine
//! similarity; keyword search is a term-frequency scan.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{DocumentEntry, IndexRecord, RecordKey, ScoredChunk};
use crate::search::{query_terms, rank_candidates, term_match_score};

use super::{CommitStats, Store, StoreStats};

struct StoredRecord {
    record: IndexRecord,
    seq: i64,
}

impl StoredRecord {
    fn scored(&self, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk_id: self.record.chunk_id.clone(),
            document_id: self.record.document_id.clone(),
            path: self.record.path.clone(),
            chunk_index: self.record.chunk_index,
            text: self.record.text.clone(),
            score,
            indexed_seq: self.seq,
        }
    }

    fn matches(&self, record: &IndexRecord) -> bool {
        self.record.content_hash == record.content_hash
            && self.record.model == record.model
            && self.record.vector.len() == record.vector.len()
            && self.record.chunk_index == record.chunk_index
            && self.record.offset == record.offset
    }
}

#[derive(Default)]
struct Inner {
    documents: HashMap<String, DocumentEntry>,
    records: HashMap<String, StoredRecord>,
    next_seq: i64,
}

impl Inner {
    fn put(&mut self, record: &IndexRecord) -> i64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.records.insert(
            record.chunk_id.clone(),
            StoredRecord {
                record: record.clone(),
                seq,
            },
        );
        seq
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::storage("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::storage("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert(&self, record: &IndexRecord) -> Result<i64> {
        Ok(self.write()?.put(record))
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        Ok(self.write()?.records.remove(chunk_id).is_some())
    }

    async fn search(&self, query_vec: &[f32], k: usize, model: &str) -> Result<Vec<ScoredChunk>> {
        let inner = self.read()?;
        let candidates = inner
            .records
            .values()
            .filter(|r| r.record.model == model && r.record.vector.len() == query_vec.len())
            .map(|r| r.scored(cosine_similarity(query_vec, &r.record.vector) as f64))
            .collect();
        Ok(rank_candidates(candidates, k))
    }

    async fn keyword_search(&self, query: &str, k: usize, model: &str) -> Result<Vec<ScoredChunk>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let candidates = inner
            .records
            .values()
            .filter(|r| r.record.model == model)
            .filter_map(|r| {
                let score = term_match_score(&r.record.text, &terms);
                (score > 0.0).then(|| r.scored(score))
            })
            .collect();
        Ok(rank_candidates(candidates, k))
    }

    async fn document_records(&self, document_id: &str) -> Result<Vec<RecordKey>> {
        let inner = self.read()?;
        let mut keys: Vec<RecordKey> = inner
            .records
            .values()
            .filter(|r| r.record.document_id == document_id)
            .map(|r| RecordKey {
                chunk_id: r.record.chunk_id.clone(),
                chunk_index: r.record.chunk_index,
                content_hash: r.record.content_hash.clone(),
                model: r.record.model.clone(),
            })
            .collect();
        keys.sort_by_key(|k| k.chunk_index);
        Ok(keys)
    }

    async fn find_vector(&self, model: &str, content_hash: &str) -> Result<Option<Vec<f32>>> {
        let inner = self.read()?;
        Ok(inner
            .records
            .values()
            .find(|r| r.record.model == model && r.record.content_hash == content_hash)
            .map(|r| r.record.vector.clone()))
    }

    async fn commit_document(
        &self,
        entry: &DocumentEntry,
        records: &[IndexRecord],
    ) -> Result<CommitStats> {
        let mut inner = self.write()?;
        let mut stats = CommitStats::default();

        let stale: Vec<String> = inner
            .records
            .values()
            .filter(|r| r.record.document_id == entry.id)
            .filter(|r| !records.iter().any(|n| n.chunk_id == r.record.chunk_id))
            .map(|r| r.record.chunk_id.clone())
            .collect();
        for chunk_id in stale {
            inner.records.remove(&chunk_id);
            stats.deleted += 1;
        }

        for record in records {
            let unchanged = inner
                .records
                .get(&record.chunk_id)
                .is_some_and(|existing| existing.matches(record));
            if !unchanged {
                inner.put(record);
                stats.upserted += 1;
            }
        }

        inner.documents.insert(entry.id.clone(), entry.clone());
        Ok(stats)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut inner = self.write()?;
        let before = inner.records.len();
        inner
            .records
            .retain(|_, r| r.record.document_id != document_id);
        inner.documents.remove(document_id);
        Ok(before - inner.records.len())
    }

    async fn manifest(&self) -> Result<Vec<DocumentEntry>> {
        let inner = self.read()?;
        let mut entries: Vec<DocumentEntry> = inner.documents.values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn record_count(&self, model: &str) -> Result<usize> {
        let inner = self.read()?;
        Ok(inner
            .records
            .values()
            .filter(|r| r.record.model == model)
            .count())
    }

    async fn stats(&self, model: &str) -> Result<StoreStats> {
        let inner = self.read()?;
        let records = inner.records.len();
        let valid_records = inner
            .records
            .values()
            .filter(|r| r.record.model == model)
            .count();
        Ok(StoreStats {
            documents: inner.documents.len(),
            records,
            valid_records,
            stale_records: records - valid_records,
        })
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.documents.clear();
        inner.records.clear();
        Ok(())
    }
}
