//! Index synchronization.
//!
//! Reconciles the document tree under `[source] root` with the index:
//!
//! ```text
//! Scanning ──► Diffing ──► Reconciling ──► Idle
//!  walk tree    classify     load → chunk → embed → commit
//! ```
//!
//! # Classification
//!
//! | Class | Condition | Action |
//! |-------|-----------|--------|
//! | `added` | path not in manifest | index |
//! | `modified` | content hash or pipeline key differs | re-index |
//! | `removed` | in manifest, no longer on disk | delete records |
//! | `unchanged` | otherwise | nothing |
//!
//! Vectors already stored for the same `(model, content_hash)` are reused,
//! so only new chunk text reaches the embedding provider. A second pass over
//! an unchanged tree performs no writes.
//!
//! # Failures
//!
//! A document that cannot be loaded or embedded is listed in
//! [`SyncSummary::failures`]. If its new content is corrupt or unsupported,
//! its previous records are dropped; if only embedding or I/O failed, they
//! are kept and the document is retried next pass. Files the scan could not
//! observe are never treated as removed. Storage corruption aborts the pass.
//!
//! # Serialization
//!
//! Passes never overlap. A request that arrives while a pass is running
//! waits for it, then either runs a new pass or, if a pass that started
//! after the request has already finished, returns that pass's summary with
//! `coalesced = true`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use docsage_core::chunk::{chunk_text, ChunkSettings};
use docsage_core::models::{document_id_for, DocumentEntry, IndexRecord};
use docsage_core::store::{CommitStats, Store};
use docsage_core::{Error, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::config::SourceConfig;
use crate::embedding::client::EmbeddingClient;
use crate::loader::load_document;
use crate::source::{scan_source, ScanResult, ScannedFile};

/// Current stage of the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Scanning,
    Diffing,
    Reconciling,
    Idle,
}

/// A document skipped during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub path: String,
    /// [`Error::kind`] of the failure.
    pub kind: String,
    pub message: String,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    /// Sequence number of the pass, starting at 1 per synchronizer.
    pub pass: u64,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failures: Vec<SyncFailure>,
    pub records_upserted: usize,
    pub records_deleted: usize,
    pub elapsed_ms: u64,
    /// True when this summary belongs to a pass started by another request.
    pub coalesced: bool,
}

impl SyncSummary {
    /// Whether the pass wrote anything to the index.
    pub fn changed_index(&self) -> bool {
        self.records_upserted > 0 || self.records_deleted > 0 || self.removed > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Added,
    Modified,
}

/// Identifies the embedding model and chunking settings records were
/// derived under. Records from a different pipeline are re-derived.
pub fn pipeline_key(model: &str, dims: usize, chunking: &ChunkSettings) -> String {
    format!("{model}|{dims}|{}", chunking.fingerprint())
}

/// The single writer of the index.
pub struct Synchronizer {
    store: Arc<dyn Store>,
    client: EmbeddingClient,
    source: SourceConfig,
    chunking: ChunkSettings,
    concurrency: usize,
    passes_started: AtomicU64,
    last_pass: Mutex<Option<SyncSummary>>,
    phase_tx: watch::Sender<SyncPhase>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn Store>,
        client: EmbeddingClient,
        source: SourceConfig,
        chunking: ChunkSettings,
        concurrency: usize,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SyncPhase::Idle);
        Self {
            store,
            client,
            source,
            chunking,
            concurrency: concurrency.max(1),
            passes_started: AtomicU64::new(0),
            last_pass: Mutex::new(None),
            phase_tx,
        }
    }

    /// Watch the current phase.
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase_tx.borrow()
    }

    pub fn pipeline_key(&self) -> String {
        pipeline_key(self.client.model_name(), self.client.dims(), &self.chunking)
    }

    /// Run an incremental pass, or join one that started after this call.
    pub async fn sync(&self) -> Result<SyncSummary> {
        let requested_after = self.passes_started.load(Ordering::SeqCst);
        let mut last_pass = self.last_pass.lock().await;

        if let Some(summary) = last_pass.as_ref() {
            if summary.pass > requested_after {
                tracing::debug!(pass = summary.pass, "sync request coalesced");
                return Ok(SyncSummary {
                    coalesced: true,
                    ..summary.clone()
                });
            }
        }

        let summary = self.run_pass(false).await?;
        *last_pass = Some(summary.clone());
        Ok(summary)
    }

    /// Drop every record and manifest entry, then index from scratch.
    pub async fn rebuild(&self) -> Result<SyncSummary> {
        let mut last_pass = self.last_pass.lock().await;
        let summary = self.run_pass(true).await?;
        *last_pass = Some(summary.clone());
        Ok(summary)
    }

    async fn run_pass(&self, clear_first: bool) -> Result<SyncSummary> {
        let pass = self.passes_started.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.execute(pass, clear_first).await;
        self.phase_tx.send_replace(SyncPhase::Idle);
        result
    }

    async fn execute(&self, pass: u64, clear_first: bool) -> Result<SyncSummary> {
        let start = Instant::now();
        let mut summary = SyncSummary {
            pass,
            ..SyncSummary::default()
        };

        if clear_first {
            tracing::info!(pass, "clearing index before full rebuild");
            self.store.clear().await?;
        }

        // Scanning
        self.phase_tx.send_replace(SyncPhase::Scanning);
        let source = self.source.clone();
        let scan = tokio::task::spawn_blocking(move || scan_source(&source))
            .await
            .map_err(|e| Error::storage(format!("scan task failed: {e}")))??;

        for (path, err) in scan.unreadable.iter().chain(&scan.unreadable_dirs) {
            summary.failures.push(SyncFailure {
                path: path.clone(),
                kind: err.kind().to_string(),
                message: err.to_string(),
            });
        }

        // Diffing
        self.phase_tx.send_replace(SyncPhase::Diffing);
        let key = self.pipeline_key();
        let manifest: HashMap<String, DocumentEntry> = self
            .store
            .manifest()
            .await?
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();

        let removed: Vec<DocumentEntry> = removed_entries(&manifest, &scan)
            .into_iter()
            .cloned()
            .collect();

        let mut work: Vec<(ScannedFile, Change)> = Vec::new();
        for file in scan.files {
            match manifest.get(&file.relative_path) {
                None => work.push((file, Change::Added)),
                Some(entry)
                    if entry.content_hash != file.content_hash || entry.pipeline_key != key =>
                {
                    work.push((file, Change::Modified))
                }
                Some(_) => summary.unchanged += 1,
            }
        }

        tracing::debug!(
            pass,
            changed = work.len(),
            removed = removed.len(),
            unchanged = summary.unchanged,
            "diffed source tree against manifest"
        );

        // Reconciling
        self.phase_tx.send_replace(SyncPhase::Reconciling);
        let key_ref = key.as_str();
        let mut outcomes = stream::iter(work.iter())
            .map(|(file, change)| async move {
                (file, *change, self.reconcile(file, key_ref).await)
            })
            .buffer_unordered(self.concurrency)
            .boxed();

        while let Some((file, change, outcome)) = outcomes.next().await {
            match outcome {
                Ok(stats) => {
                    match change {
                        Change::Added => summary.added += 1,
                        Change::Modified => summary.modified += 1,
                    }
                    summary.records_upserted += stats.upserted;
                    summary.records_deleted += stats.deleted;
                    tracing::debug!(
                        path = %file.relative_path,
                        upserted = stats.upserted,
                        deleted = stats.deleted,
                        "reconciled document"
                    );
                }
                Err(err) if err.is_document_local() => {
                    tracing::warn!(
                        path = %file.relative_path,
                        kind = err.kind(),
                        error = %err,
                        "skipping document"
                    );
                    // The indexed text no longer matches the file on disk.
                    if change == Change::Modified && invalidates_content(&err) {
                        if let Some(entry) = manifest.get(&file.relative_path) {
                            let deleted = self.store.delete_document(&entry.id).await?;
                            tracing::debug!(path = %entry.path, deleted, "dropped stale records");
                            summary.records_deleted += deleted;
                        }
                    }
                    summary.failures.push(SyncFailure {
                        path: file.relative_path.clone(),
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    tracing::error!(path = %file.relative_path, error = %err, "sync pass aborted");
                    return Err(err);
                }
            }
        }
        drop(outcomes);

        for entry in &removed {
            let deleted = self.store.delete_document(&entry.id).await?;
            tracing::debug!(path = %entry.path, deleted, "removed document");
            summary.removed += 1;
            summary.records_deleted += deleted;
        }

        summary.failures.sort_by(|a, b| a.path.cmp(&b.path));
        summary.elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            pass,
            added = summary.added,
            modified = summary.modified,
            removed = summary.removed,
            unchanged = summary.unchanged,
            failed = summary.failures.len(),
            records_upserted = summary.records_upserted,
            records_deleted = summary.records_deleted,
            elapsed_ms = summary.elapsed_ms,
            "sync pass complete"
        );
        Ok(summary)
    }

    /// Load, chunk, embed, and commit one document.
    async fn reconcile(&self, file: &ScannedFile, pipeline_key: &str) -> Result<CommitStats> {
        let path = file.absolute_path.clone();
        let max_bytes = self.source.max_file_bytes;
        let loaded = tokio::task::spawn_blocking(move || load_document(&path, max_bytes))
            .await
            .map_err(|e| Error::corrupt(&file.absolute_path, format!("loader failed: {e}")))??;

        let document_id = document_id_for(&file.relative_path);
        let chunks = chunk_text(&document_id, &loaded.text, &self.chunking);
        let model = self.client.model_name();
        let dims = self.client.dims();

        let mut vectors: Vec<Vec<f32>> = vec![Vec::new(); chunks.len()];
        let mut missing: Vec<usize> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            match self.store.find_vector(model, &chunk.hash).await? {
                Some(vector) if vector.len() == dims => vectors[i] = vector,
                _ => missing.push(i),
            }
        }

        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| chunks[i].text.clone()).collect();
            let embedded = self.client.embed(&texts).await?;
            for (i, vector) in missing.iter().zip(embedded) {
                vectors[*i] = vector;
            }
        }
        tracing::debug!(
            path = %file.relative_path,
            chunks = chunks.len(),
            reused = chunks.len() - missing.len(),
            "embedded document"
        );

        let records: Vec<IndexRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexRecord::from_chunk(chunk, &file.relative_path, model, vector))
            .collect();

        let entry = DocumentEntry {
            id: document_id,
            path: file.relative_path.clone(),
            content_hash: loaded.content_hash,
            modified_at: file.modified_at,
            format: loaded.format,
            chunk_count: records.len(),
            pipeline_key: pipeline_key.to_string(),
            indexed_at: chrono::Utc::now().timestamp(),
        };

        self.store.commit_document(&entry, &records).await
    }
}

/// Manifest entries whose files are gone, sorted by path.
///
/// Entries the scan could not observe (unreadable files, or anything under
/// a directory the walk could not enter) are kept.
fn removed_entries<'a>(
    manifest: &'a HashMap<String, DocumentEntry>,
    scan: &ScanResult,
) -> Vec<&'a DocumentEntry> {
    let on_disk: HashSet<&str> = scan
        .files
        .iter()
        .map(|f| f.relative_path.as_str())
        .collect();
    let mut removed: Vec<&DocumentEntry> = manifest
        .values()
        .filter(|entry| {
            !on_disk.contains(entry.path.as_str()) && !scan.is_unobserved(&entry.path)
        })
        .collect();
    removed.sort_by(|a, b| a.path.cmp(&b.path));
    removed
}

/// Failures that mean the file's current content cannot be indexed, as
/// opposed to a provider or I/O problem worth retrying.
fn invalidates_content(err: &Error) -> bool {
    matches!(
        err,
        Error::CorruptDocument { .. } | Error::UnsupportedFormat { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsage_core::models::DocumentFormat;
    use std::path::PathBuf;

    fn entry(path: &str) -> DocumentEntry {
        DocumentEntry {
            id: document_id_for(path),
            path: path.to_string(),
            content_hash: "h".to_string(),
            modified_at: 0,
            format: DocumentFormat::Markdown,
            chunk_count: 1,
            pipeline_key: "k".to_string(),
            indexed_at: 0,
        }
    }

    fn scanned(path: &str) -> ScannedFile {
        ScannedFile {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from(path),
            content_hash: "h".to_string(),
            modified_at: 0,
            size: 1,
        }
    }

    #[test]
    fn entries_under_unreadable_dirs_are_not_removed() {
        let manifest: HashMap<String, DocumentEntry> =
            ["hr/retention.md", "hr/leave.docx", "kitchen.md", "onboarding.md"]
                .into_iter()
                .map(|p| (p.to_string(), entry(p)))
                .collect();
        let scan = ScanResult {
            files: vec![scanned("onboarding.md")],
            unreadable: Vec::new(),
            unreadable_dirs: vec![(
                "hr".to_string(),
                Error::Io {
                    path: PathBuf::from("hr"),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                },
            )],
        };

        let removed: Vec<&str> = removed_entries(&manifest, &scan)
            .into_iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(removed, vec!["kitchen.md"]);
    }

    #[test]
    fn only_content_failures_invalidate_records() {
        assert!(invalidates_content(&Error::corrupt("a.md", "bad utf-8")));
        assert!(invalidates_content(&Error::UnsupportedFormat {
            path: PathBuf::from("a.txt")
        }));
        assert!(!invalidates_content(&Error::EmbeddingUnavailable {
            attempts: 3,
            reason: "503".into()
        }));
    }

    #[test]
    fn pipeline_key_tracks_model_and_chunking() {
        let base = pipeline_key("text-embedding-3-small", 1536, &ChunkSettings::default());
        assert_eq!(base, "text-embedding-3-small|1536|1024|0.5");
        assert_ne!(
            base,
            pipeline_key("text-embedding-3-large", 1536, &ChunkSettings::default())
        );
        assert_ne!(
            base,
            pipeline_key("text-embedding-3-small", 1536, &ChunkSettings::new(512, 0.5))
        );
    }

    #[test]
    fn summary_reports_index_changes() {
        let mut summary = SyncSummary::default();
        assert!(!summary.changed_index());
        summary.removed = 1;
        assert!(summary.changed_index());
    }
}
