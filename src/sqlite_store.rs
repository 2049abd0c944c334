//! SQLite-backed [`Store`] implementation.
//!
//! Records, the manifest, and an FTS5 index over record text live in one
//! database file. Every mutation runs inside a transaction and writers are
//! serialized through an async mutex, so a crash leaves each record in
//! either its prior or its new state and `indexed_seq` stays monotonic.
//!
//! Vector search is brute-force cosine similarity over the records of the
//! requested model, which is adequate for corpora of a few thousand chunks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;

use docsage_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docsage_core::models::{DocumentEntry, IndexRecord, RecordKey, ScoredChunk};
use docsage_core::search::{query_terms, rank_candidates};
use docsage_core::store::{CommitStats, Store, StoreStats};
use docsage_core::{Error, Result};

use crate::db::{self, map_sqlx_error};
use crate::migrate;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    path: String,
    content_hash: String,
    modified_at: i64,
    format: String,
    chunk_count: i64,
    pipeline_key: String,
    indexed_at: i64,
}

impl TryFrom<DocumentRow> for DocumentEntry {
    type Error = Error;

    fn try_from(row: DocumentRow) -> Result<Self> {
        Ok(DocumentEntry {
            id: row.id,
            path: row.path,
            content_hash: row.content_hash,
            modified_at: row.modified_at,
            format: row.format.parse()?,
            chunk_count: usize::try_from(row.chunk_count)
                .map_err(|_| Error::StorageCorruption("negative chunk count".to_string()))?,
            pipeline_key: row.pipeline_key,
            indexed_at: row.indexed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VectorRow {
    chunk_id: String,
    document_id: String,
    path: String,
    chunk_index: i64,
    text: String,
    dims: i64,
    embedding: Vec<u8>,
    indexed_seq: i64,
}

#[derive(sqlx::FromRow)]
struct KeywordRow {
    chunk_id: String,
    document_id: String,
    path: String,
    chunk_index: i64,
    text: String,
    indexed_seq: i64,
    rank: f64,
}

#[derive(sqlx::FromRow)]
struct ExistingRow {
    chunk_id: String,
    chunk_index: i64,
    byte_offset: i64,
    content_hash: String,
    model: String,
    dims: i64,
}

impl ExistingRow {
    fn matches(&self, record: &IndexRecord) -> bool {
        self.content_hash == record.content_hash
            && self.model == record.model
            && self.dims == record.vector.len() as i64
            && self.chunk_index == record.chunk_index
            && self.byte_offset == record.offset as i64
    }
}

fn decode_vector(blob: &[u8], dims: i64, chunk_id: &str) -> Result<Vec<f32>> {
    usize::try_from(dims)
        .ok()
        .and_then(|dims| blob_to_vec(blob, dims))
        .ok_or_else(|| {
            Error::StorageCorruption(format!(
                "embedding for chunk {chunk_id} is {} bytes, expected {dims} dimensions",
                blob.len()
            ))
        })
}

/// Quote each query term so FTS5 treats it as a literal.
fn fts_match_expression(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

async fn next_seq(conn: &mut SqliteConnection) -> Result<i64> {
    sqlx::query("UPDATE meta SET value = value + 1 WHERE key = 'last_seq'")
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    sqlx::query_scalar("SELECT value FROM meta WHERE key = 'last_seq'")
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx_error)
}

async fn write_record(conn: &mut SqliteConnection, record: &IndexRecord) -> Result<i64> {
    let seq = next_seq(conn).await?;
    let blob = vec_to_blob(&record.vector);

    sqlx::query(
        r#"
        INSERT INTO records (chunk_id, document_id, path, chunk_index, byte_offset, text,
                             content_hash, model, dims, embedding, indexed_seq)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            path = excluded.path,
            chunk_index = excluded.chunk_index,
            byte_offset = excluded.byte_offset,
            text = excluded.text,
            content_hash = excluded.content_hash,
            model = excluded.model,
            dims = excluded.dims,
            embedding = excluded.embedding,
            indexed_seq = excluded.indexed_seq
        "#,
    )
    .bind(&record.chunk_id)
    .bind(&record.document_id)
    .bind(&record.path)
    .bind(record.chunk_index)
    .bind(record.offset as i64)
    .bind(&record.text)
    .bind(&record.content_hash)
    .bind(&record.model)
    .bind(record.vector.len() as i64)
    .bind(&blob)
    .bind(seq)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    sqlx::query("DELETE FROM records_fts WHERE chunk_id = ?")
        .bind(&record.chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    sqlx::query("INSERT INTO records_fts (chunk_id, text) VALUES (?, ?)")
        .bind(&record.chunk_id)
        .bind(&record.text)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

    Ok(seq)
}

async fn remove_record(conn: &mut SqliteConnection, chunk_id: &str) -> Result<bool> {
    sqlx::query("DELETE FROM records_fts WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    let result = sqlx::query("DELETE FROM records WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(result.rows_affected() > 0)
}

impl SqliteStore {
    /// Open (creating if needed) the index at `path`, run migrations, and
    /// verify its integrity.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        if let Err(e) = migrate::run_migrations(&pool).await {
            pool.close().await;
            return Err(e);
        }
        Ok(Self {
            pool,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Delete the database files at `path` and open a fresh, empty index.
    pub async fn recreate(path: &Path) -> Result<Self> {
        db::remove_database_files(path)?;
        Self::open(path).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert(&self, record: &IndexRecord) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let seq = write_record(&mut tx, record).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(seq)
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let removed = remove_record(&mut tx, chunk_id).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(removed)
    }

    async fn search(&self, query_vec: &[f32], k: usize, model: &str) -> Result<Vec<ScoredChunk>> {
        let rows: Vec<VectorRow> = sqlx::query_as(
            r#"
            SELECT chunk_id, document_id, path, chunk_index, text, dims, embedding, indexed_seq
            FROM records
            WHERE model = ? AND dims = ?
            "#,
        )
        .bind(model)
        .bind(query_vec.len() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let vector = decode_vector(&row.embedding, row.dims, &row.chunk_id)?;
            candidates.push(ScoredChunk {
                score: cosine_similarity(query_vec, &vector) as f64,
                chunk_id: row.chunk_id,
                document_id: row.document_id,
                path: row.path,
                chunk_index: row.chunk_index,
                text: row.text,
                indexed_seq: row.indexed_seq,
            });
        }

        Ok(rank_candidates(candidates, k))
    }

    async fn keyword_search(&self, query: &str, k: usize, model: &str) -> Result<Vec<ScoredChunk>> {
        let Some(expression) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let rows: Vec<KeywordRow> = sqlx::query_as(
            r#"
            SELECT r.chunk_id, r.document_id, r.path, r.chunk_index, r.text, r.indexed_seq,
                   bm25(records_fts) AS rank
            FROM records_fts
            JOIN records r ON r.chunk_id = records_fts.chunk_id
            WHERE records_fts MATCH ? AND r.model = ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&expression)
        .bind(model)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let candidates = rows
            .into_iter()
            .map(|row| ScoredChunk {
                chunk_id: row.chunk_id,
                document_id: row.document_id,
                path: row.path,
                chunk_index: row.chunk_index,
                text: row.text,
                // bm25 is lower-is-better
                score: -row.rank,
                indexed_seq: row.indexed_seq,
            })
            .collect();

        Ok(rank_candidates(candidates, k))
    }

    async fn document_records(&self, document_id: &str) -> Result<Vec<RecordKey>> {
        let rows: Vec<ExistingRow> = sqlx::query_as(
            r#"
            SELECT chunk_id, chunk_index, byte_offset, content_hash, model, dims
            FROM records
            WHERE document_id = ?
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|row| RecordKey {
                chunk_id: row.chunk_id,
                chunk_index: row.chunk_index,
                content_hash: row.content_hash,
                model: row.model,
            })
            .collect())
    }

    async fn find_vector(&self, model: &str, content_hash: &str) -> Result<Option<Vec<f32>>> {
        let row: Option<(String, i64, Vec<u8>)> = sqlx::query_as(
            "SELECT chunk_id, dims, embedding FROM records WHERE model = ? AND content_hash = ? LIMIT 1",
        )
        .bind(model)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|(chunk_id, dims, blob)| decode_vector(&blob, dims, &chunk_id))
            .transpose()
    }

    async fn commit_document(
        &self,
        entry: &DocumentEntry,
        records: &[IndexRecord],
    ) -> Result<CommitStats> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut stats = CommitStats::default();

        sqlx::query(
            r#"
            INSERT INTO documents (id, path, content_hash, modified_at, format, chunk_count,
                                   pipeline_key, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                content_hash = excluded.content_hash,
                modified_at = excluded.modified_at,
                format = excluded.format,
                chunk_count = excluded.chunk_count,
                pipeline_key = excluded.pipeline_key,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.path)
        .bind(&entry.content_hash)
        .bind(entry.modified_at)
        .bind(entry.format.as_str())
        .bind(entry.chunk_count as i64)
        .bind(&entry.pipeline_key)
        .bind(entry.indexed_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let existing: Vec<ExistingRow> = sqlx::query_as(
            r#"
            SELECT chunk_id, chunk_index, byte_offset, content_hash, model, dims
            FROM records
            WHERE document_id = ?
            "#,
        )
        .bind(&entry.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        for row in &existing {
            if !records.iter().any(|r| r.chunk_id == row.chunk_id) {
                remove_record(&mut tx, &row.chunk_id).await?;
                stats.deleted += 1;
            }
        }

        for record in records {
            let unchanged = existing
                .iter()
                .any(|row| row.chunk_id == record.chunk_id && row.matches(record));
            if !unchanged {
                write_record(&mut tx, record).await?;
                stats.upserted += 1;
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(stats)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            "DELETE FROM records_fts WHERE chunk_id IN (SELECT chunk_id FROM records WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        let removed = sqlx::query("DELETE FROM records WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(removed as usize)
    }

    async fn manifest(&self) -> Result<Vec<DocumentEntry>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT id, path, content_hash, modified_at, format, chunk_count, pipeline_key, indexed_at
            FROM documents
            ORDER BY path ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(DocumentEntry::try_from).collect()
    }

    async fn record_count(&self, model: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE model = ?")
            .bind(model)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(count as usize)
    }

    async fn stats(&self, model: &str) -> Result<StoreStats> {
        let (documents, records, valid): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM documents),
                (SELECT COUNT(*) FROM records),
                (SELECT COUNT(*) FROM records WHERE model = ?)
            "#,
        )
        .bind(model)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(StoreStats {
            documents: documents as usize,
            records: records as usize,
            valid_records: valid as usize,
            stale_records: (records - valid) as usize,
        })
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for statement in [
            "DELETE FROM records_fts",
            "DELETE FROM records",
            "DELETE FROM documents",
        ] {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsage_core::models::{chunk_id_for, document_id_for, sha256_hex, DocumentFormat};
    use tempfile::TempDir;

    fn record(path: &str, index: usize, text: &str, model: &str, vector: Vec<f32>) -> IndexRecord {
        let document_id = document_id_for(path);
        IndexRecord {
            chunk_id: chunk_id_for(&document_id, index * 1000),
            document_id,
            path: path.to_string(),
            chunk_index: index as i64,
            offset: index * 1000,
            text: text.to_string(),
            content_hash: sha256_hex(text.as_bytes()),
            model: model.to_string(),
            vector,
        }
    }

    fn entry(path: &str, chunk_count: usize) -> DocumentEntry {
        DocumentEntry {
            id: document_id_for(path),
            path: path.to_string(),
            content_hash: sha256_hex(path.as_bytes()),
            modified_at: 1_700_000_000,
            format: DocumentFormat::Word,
            chunk_count,
            pipeline_key: "m|3|1024|0.5".to_string(),
            indexed_at: 1_700_000_100,
        }
    }

    async fn open_tmp() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("data").join("index.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let (tmp, store) = open_tmp().await;
        let records = vec![
            record("plan.docx", 0, "quarterly retention policy", "m", vec![1.0, 0.0, 0.0]),
            record("plan.docx", 1, "holiday calendar", "m", vec![0.0, 1.0, 0.0]),
        ];
        let stats = store.commit_document(&entry("plan.docx", 2), &records).await.unwrap();
        assert_eq!(stats, CommitStats { upserted: 2, deleted: 0 });
        store.close().await;

        let reopened = SqliteStore::open(&tmp.path().join("data").join("index.sqlite"))
            .await
            .unwrap();
        let manifest = reopened.manifest().await.unwrap();
        assert_eq!(manifest, vec![entry("plan.docx", 2)]);
        let hits = reopened.search(&[1.0, 0.0, 0.0], 1, "m").await.unwrap();
        assert_eq!(hits[0].text, "quarterly retention policy");
        assert_eq!(hits[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn recommit_unchanged_is_noop_and_keeps_seq() {
        let (_tmp, store) = open_tmp().await;
        let records = vec![record("a.md", 0, "alpha", "m", vec![1.0, 0.0, 0.0])];
        store.commit_document(&entry("a.md", 1), &records).await.unwrap();
        let before = store.search(&[1.0, 0.0, 0.0], 1, "m").await.unwrap();

        let stats = store.commit_document(&entry("a.md", 1), &records).await.unwrap();
        assert_eq!(stats, CommitStats::default());
        let after = store.search(&[1.0, 0.0, 0.0], 1, "m").await.unwrap();
        assert_eq!(before[0].indexed_seq, after[0].indexed_seq);
    }

    #[tokio::test]
    async fn stale_model_is_excluded() {
        let (_tmp, store) = open_tmp().await;
        store
            .upsert(&record("a.md", 0, "alpha", "old-model", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert!(store.search(&[1.0, 0.0, 0.0], 5, "new-model").await.unwrap().is_empty());
        assert_eq!(store.record_count("new-model").await.unwrap(), 0);
        let stats = store.stats("new-model").await.unwrap();
        assert_eq!(stats.stale_records, 1);
    }

    #[tokio::test]
    async fn sequence_is_monotonic() {
        let (_tmp, store) = open_tmp().await;
        let r = record("a.md", 0, "alpha", "m", vec![1.0, 0.0, 0.0]);
        let first = store.upsert(&r).await.unwrap();
        let second = store.upsert(&r).await.unwrap();
        assert!(second > first);
        assert!(store.delete(&r.chunk_id).await.unwrap());
        assert!(!store.delete(&r.chunk_id).await.unwrap());
        let third = store.upsert(&r).await.unwrap();
        assert!(third > second);
    }

    #[tokio::test]
    async fn keyword_search_uses_fts() {
        let (_tmp, store) = open_tmp().await;
        store
            .upsert(&record("a.md", 0, "The quarterly retention policy", "m", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        store
            .upsert(&record("b.md", 0, "Office seating chart", "m", vec![0.0, 1.0, 0.0]))
            .await
            .unwrap();

        let hits = store
            .keyword_search("retention \"policy\" (draft)", 5, "m")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.md");
        assert!(store.keyword_search("?!", 5, "m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_document_and_clear() {
        let (_tmp, store) = open_tmp().await;
        let records = vec![
            record("a.md", 0, "alpha", "m", vec![1.0, 0.0, 0.0]),
            record("a.md", 1, "beta", "m", vec![0.0, 1.0, 0.0]),
        ];
        store.commit_document(&entry("a.md", 2), &records).await.unwrap();
        assert_eq!(store.delete_document(&document_id_for("a.md")).await.unwrap(), 2);
        assert!(store.manifest().await.unwrap().is_empty());
        assert!(store.keyword_search("alpha", 5, "m").await.unwrap().is_empty());

        store.commit_document(&entry("b.md", 2), &records).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.stats("m").await.unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn truncated_vector_blob_is_corruption() {
        let (_tmp, store) = open_tmp().await;
        let r = record("a.md", 0, "alpha", "m", vec![1.0, 0.0, 0.0]);
        store.upsert(&r).await.unwrap();
        sqlx::query("UPDATE records SET embedding = X'0000' WHERE chunk_id = ?")
            .bind(&r.chunk_id)
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.search(&[1.0, 0.0, 0.0], 5, "m").await.unwrap_err();
        assert!(matches!(err, Error::StorageCorruption(_)), "{err:?}");
    }

    #[tokio::test]
    async fn garbage_file_is_corruption_and_recreate_recovers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        std::fs::write(&path, vec![0x5a; 8192]).unwrap();

        let err = SqliteStore::open(&path).await.err().unwrap();
        assert!(matches!(err, Error::StorageCorruption(_)), "{err:?}");

        let store = SqliteStore::recreate(&path).await.unwrap();
        assert_eq!(store.stats("m").await.unwrap(), StoreStats::default());
    }

    #[test]
    fn fts_expression_quotes_terms() {
        assert_eq!(
            fts_match_expression("retention AND policy*").as_deref(),
            Some("\"retention\" OR \"and\" OR \"policy\"")
        );
        assert_eq!(fts_match_expression("   "), None);
    }
}
