//! SQLite connection pool for the index database.
//!
//! The database runs in WAL mode so retrievers read a consistent snapshot
//! while the synchronizer writes.

use docsage_core::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// SQLITE_CORRUPT and SQLITE_NOTADB primary result codes.
const CORRUPTION_CODES: [i32; 2] = [11, 26];

pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| Error::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(map_sqlx_error)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)
}

/// Classify a sqlx failure as corruption or an ordinary storage error.
pub fn map_sqlx_error(err: sqlx::Error) -> Error {
    if is_corruption(&err) {
        Error::StorageCorruption(err.to_string())
    } else {
        Error::storage(err)
    }
}

fn is_corruption(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let by_code = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .is_some_and(|c| CORRUPTION_CODES.contains(&(c & 0xff)));
            let message = db.message().to_ascii_lowercase();
            by_code || message.contains("malformed") || message.contains("not a database")
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => true,
        _ => false,
    }
}

/// Remove the database file and its WAL/shared-memory companions.
pub fn remove_database_files(db_path: &Path) -> Result<()> {
    let base = db_path.as_os_str().to_owned();
    for suffix in ["", "-wal", "-shm"] {
        let mut name = base.clone();
        name.push(suffix);
        let path = Path::new(&name);
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    Ok(())
}
