//! Error taxonomy for the index and retrieval engine.
//!
//! Per-document failures ([`Error::UnsupportedFormat`],
//! [`Error::CorruptDocument`], [`Error::EmbeddingUnavailable`]) are isolated
//! by the synchronizer. [`Error::StorageCorruption`] is the only fatal
//! condition; the index is a derived cache and is rebuilt from the source
//! documents.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported document format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("corrupt document {}: {reason}", path.display())]
    CorruptDocument { path: PathBuf, reason: String },

    #[error("embedding provider unavailable after {attempts} attempt(s): {reason}")]
    EmbeddingUnavailable { attempts: u32, reason: String },

    #[error("the index is empty; run a sync first")]
    IndexEmpty,

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("index storage is corrupt and must be rebuilt: {0}")]
    StorageCorruption(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Wrap a backend failure that does not indicate corruption.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Error::Storage(err.to_string())
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Error::CorruptDocument {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable, machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnsupportedFormat { .. } => "UnsupportedFormat",
            Error::CorruptDocument { .. } => "CorruptDocument",
            Error::EmbeddingUnavailable { .. } => "EmbeddingUnavailable",
            Error::IndexEmpty => "IndexEmpty",
            Error::Timeout(_) => "Timeout",
            Error::StorageCorruption(_) => "StorageCorruption",
            Error::Storage(_) => "Storage",
            Error::Io { .. } => "Io",
            Error::InvalidInput(_) => "InvalidInput",
        }
    }

    /// True when the failure concerns a single document and a sync pass
    /// may skip it and continue with the rest.
    pub fn is_document_local(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat { .. }
                | Error::CorruptDocument { .. }
                | Error::EmbeddingUnavailable { .. }
                | Error::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(Error::IndexEmpty.kind(), "IndexEmpty");
        assert_eq!(
            Error::corrupt("a.docx", "bad zip").kind(),
            "CorruptDocument"
        );
        assert_eq!(
            Error::Timeout(Duration::from_millis(5)).kind(),
            "Timeout"
        );
    }

    #[test]
    fn only_document_failures_are_isolatable() {
        assert!(Error::corrupt("a.md", "x").is_document_local());
        assert!(Error::EmbeddingUnavailable {
            attempts: 3,
            reason: "429".into()
        }
        .is_document_local());
        assert!(!Error::StorageCorruption("bad".into()).is_document_local());
        assert!(!Error::storage("locked").is_document_local());
    }

    #[test]
    fn corrupt_document_message_names_path() {
        let msg = Error::corrupt("docs/plan.docx", "word/document.xml not found").to_string();
        assert!(msg.contains("docs/plan.docx"));
        assert!(msg.contains("word/document.xml not found"));
    }
}
