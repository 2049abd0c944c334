//! Core data models used throughout docsage.
//!
//! These types represent the documents, chunks, and index records that flow
//! through the sync and retrieval pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Error;

/// Source formats the loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Markdown,
    Word,
    Pdf,
}

impl DocumentFormat {
    /// Detect the format from a file extension (case-insensitive, without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "docx" => Some(DocumentFormat::Word),
            "pdf" => Some(DocumentFormat::Pdf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Word => "word",
            DocumentFormat::Pdf => "pdf",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markdown" => Ok(DocumentFormat::Markdown),
            "word" => Ok(DocumentFormat::Word),
            "pdf" => Ok(DocumentFormat::Pdf),
            other => Err(Error::StorageCorruption(format!(
                "unknown document format in manifest: {other}"
            ))),
        }
    }
}

/// Manifest entry for one indexed source document.
///
/// Exactly one entry exists per distinct relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    /// Deterministic id derived from `path` (see [`document_id_for`]).
    pub id: String,
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    /// SHA-256 of the raw file bytes.
    pub content_hash: String,
    /// Last-modified time of the file (Unix seconds).
    pub modified_at: i64,
    pub format: DocumentFormat,
    pub chunk_count: usize,
    /// Model and chunking settings the records were derived under.
    pub pipeline_key: String,
    /// When the entry was last committed (Unix seconds).
    pub indexed_at: i64,
}

/// A contiguous span of a document's normalized text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Deterministic id derived from the document id and `offset`.
    pub id: String,
    pub document_id: String,
    /// Position within the document, contiguous from 0.
    pub chunk_index: i64,
    /// Byte offset of `text` within the normalized text.
    pub offset: usize,
    /// Length in bytes of the leading region shared with the previous chunk.
    pub overlap: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    /// The part of the chunk not shared with its predecessor.
    ///
    /// Concatenating this for every chunk of a document yields the
    /// document's normalized text.
    pub fn fresh_text(&self) -> &str {
        self.text.get(self.overlap..).unwrap_or("")
    }
}

/// A durable embedding record: one chunk, its vector, and its validity key.
///
/// A record is valid only while `content_hash` matches the current chunk
/// and `model` equals the active embedding model.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub path: String,
    pub chunk_index: i64,
    pub offset: usize,
    pub text: String,
    pub content_hash: String,
    pub model: String,
    pub vector: Vec<f32>,
}

impl IndexRecord {
    pub fn from_chunk(chunk: &Chunk, path: &str, model: &str, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            path: path.to_string(),
            chunk_index: chunk.chunk_index,
            offset: chunk.offset,
            text: chunk.text.clone(),
            content_hash: chunk.hash.clone(),
            model: model.to_string(),
            vector,
        }
    }
}

/// Identity and validity key of a stored record, without its vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub content_hash: String,
    pub model: String,
}

/// A chunk returned from the index with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub path: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f64,
    /// Monotonic sequence assigned when the record was last written.
    pub indexed_seq: i64,
}

/// Derive the stable document id for a relative path.
pub fn document_id_for(path: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("docsage:{path}").as_bytes()).to_string()
}

/// Derive the stable chunk id for a span of a document.
pub fn chunk_id_for(document_id: &str, offset: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{document_id}:{offset}").as_bytes()).to_string()
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(
            DocumentFormat::from_extension("MD"),
            Some(DocumentFormat::Markdown)
        );
        assert_eq!(
            DocumentFormat::from_extension("docx"),
            Some(DocumentFormat::Word)
        );
        assert_eq!(DocumentFormat::from_extension("doc"), None);
        assert_eq!(DocumentFormat::from_extension("txt"), None);
    }

    #[test]
    fn format_round_trips_through_manifest_string() {
        for format in [
            DocumentFormat::Markdown,
            DocumentFormat::Word,
            DocumentFormat::Pdf,
        ] {
            assert_eq!(format.as_str().parse::<DocumentFormat>().ok(), Some(format));
        }
        assert!("rtf".parse::<DocumentFormat>().is_err());
    }

    #[test]
    fn ids_are_deterministic() {
        assert_eq!(document_id_for("a/b.md"), document_id_for("a/b.md"));
        assert_ne!(document_id_for("a/b.md"), document_id_for("a/c.md"));

        let doc = document_id_for("a/b.md");
        assert_eq!(chunk_id_for(&doc, 0), chunk_id_for(&doc, 0));
        assert_ne!(chunk_id_for(&doc, 0), chunk_id_for(&doc, 10));
    }

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fresh_text_skips_overlap() {
        let chunk = Chunk {
            id: "c".into(),
            document_id: "d".into(),
            chunk_index: 1,
            offset: 4,
            overlap: 3,
            text: "abcdef".into(),
            hash: sha256_hex(b"abcdef"),
        };
        assert_eq!(chunk.fresh_text(), "def");
    }
}
