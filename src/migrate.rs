//! Schema creation and integrity checks for the index database.
//!
//! # Tables
//!
//! - `meta`: schema version and the record sequence counter.
//! - `documents`: the manifest, one row per indexed source path.
//! - `records`: chunk text, validity key, and embedding vector.
//! - `records_fts`: FTS5 index over record text for hybrid retrieval.
//!
//! Running migrations is idempotent. An existing database whose integrity
//! check fails, or whose schema version is unknown, is reported as
//! [`Error::StorageCorruption`].

use docsage_core::{Error, Result};
use sqlx::SqlitePool;

use crate::db::map_sqlx_error;

/// Version written to `meta.schema_version` by this build.
pub const SCHEMA_VERSION: i64 = 1;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    check_integrity(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            modified_at INTEGER NOT NULL,
            format TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            pipeline_key TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            path TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            byte_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            indexed_seq INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='records_fts'",
    )
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE records_fts USING fts5(
                chunk_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;
    }

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_records_document_id ON records(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_records_model_hash ON records(model, content_hash)",
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;
    }

    sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;
    sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('last_seq', 0)")
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;

    let version: i64 = sqlx::query_scalar("SELECT value FROM meta WHERE key = 'schema_version'")
        .fetch_one(pool)
        .await
        .map_err(map_sqlx_error)?;
    if version != SCHEMA_VERSION {
        return Err(Error::StorageCorruption(format!(
            "unsupported schema version {version} (expected {SCHEMA_VERSION})"
        )));
    }

    Ok(())
}

/// Run `PRAGMA quick_check` and fail unless SQLite reports `ok`.
async fn check_integrity(pool: &SqlitePool) -> Result<()> {
    let results: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_all(pool)
        .await
        .map_err(map_sqlx_error)?;

    match results.as_slice() {
        [only] if only == "ok" => Ok(()),
        problems => Err(Error::StorageCorruption(format!(
            "integrity check failed: {}",
            problems.join("; ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("index.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let version: i64 =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'schema_version'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn unknown_schema_version_is_corruption() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("index.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        sqlx::query("UPDATE meta SET value = 99 WHERE key = 'schema_version'")
            .execute(&pool)
            .await
            .unwrap();

        let err = run_migrations(&pool).await.unwrap_err();
        assert!(matches!(err, Error::StorageCorruption(_)), "{err:?}");
    }
}
