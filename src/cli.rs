//! Command implementations for the `docsage` binary.
//!
//! Each `run_*` function loads what it needs, prints a human-readable report
//! to stdout, and returns `anyhow` errors with context for the binary to
//! print.

use std::path::Path;

use anyhow::{bail, Context, Result};
use docsage_core::Error;
use serde::Serialize;

use crate::config::{self, Config};
use crate::engine::Engine;
use crate::retrieve::{RetrievalMode, RetrievedContext, NO_RESULTS_MESSAGE};
use crate::sqlite_store::SqliteStore;
use crate::sync::SyncSummary;

const STARTER_CONFIG: &str = r#"# docsage configuration

[index]
path = "./data/docsage.sqlite"

[source]
root = "./documents"
# include_globs = ["**/*.md", "**/*.markdown", "**/*.docx", "**/*.pdf"]
# exclude_globs = ["drafts/**"]

[chunking]
max_tokens = 1024
overlap_fraction = 0.5

[embedding]
# openai, ollama, or hashing (offline, no API key)
provider = "openai"
model = "text-embedding-3-small"
dims = 1536
api_key_env = "OPENAI_API_KEY"

[retrieval]
top_k = 5
mode = "semantic"
max_context_chars = 8000

[logging]
level = "info"
"#;

/// Write a starter config (unless one exists) and create the index.
pub async fn run_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("config: {} (existing)", config_path.display());
    } else {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(config_path, STARTER_CONFIG)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("config: {} (created)", config_path.display());
    }

    let cfg = config::load_config(config_path)?;
    std::fs::create_dir_all(&cfg.source.root)
        .with_context(|| format!("Failed to create {}", cfg.source.root.display()))?;

    let store = SqliteStore::open(&cfg.index.path)
        .await
        .map_err(with_rebuild_hint)?;
    store.close().await;

    println!("source: {}", cfg.source.root.display());
    println!("index: {}", cfg.index.path.display());
    println!("ok");
    Ok(())
}

/// Bring the index up to date; `full` clears it first.
pub async fn run_sync(cfg: &Config, full: bool) -> Result<()> {
    let engine = open_engine(cfg).await?;
    let result = if full {
        engine.rebuild().await
    } else {
        engine.sync().await
    };
    engine.close().await;

    let summary = result.map_err(with_rebuild_hint)?;
    print_summary(if full { "sync --full" } else { "sync" }, &summary);
    Ok(())
}

/// Delete the index files and re-index everything.
pub async fn run_rebuild(cfg: &Config) -> Result<()> {
    let engine = Engine::open_recreating(cfg).await?;
    let result = engine.rebuild().await;
    engine.close().await;

    print_summary("rebuild", &result?);
    Ok(())
}

#[derive(Serialize)]
struct AskOutput<'a> {
    query: &'a str,
    mode: RetrievalMode,
    #[serde(flatten)]
    retrieved: &'a RetrievedContext,
    message: Option<&'a str>,
}

/// Retrieve context for `query` and print it.
pub async fn run_ask(
    cfg: &Config,
    query: &str,
    top_k: Option<usize>,
    mode: Option<RetrievalMode>,
    json: bool,
) -> Result<()> {
    let top_k = top_k.unwrap_or(cfg.retrieval.top_k);
    if top_k == 0 {
        bail!("--top-k must be >= 1");
    }
    let mode = mode.unwrap_or(cfg.retrieval.mode);

    let engine = open_engine(cfg).await?;
    let result = engine.retrieve_with_mode(query, top_k, mode).await;
    engine.close().await;

    let retrieved = match result {
        Ok(retrieved) => retrieved,
        Err(Error::IndexEmpty) => {
            tracing::info!("index holds no records for the active model");
            RetrievedContext::default()
        }
        Err(e) => return Err(with_rebuild_hint(e)),
    };

    if json {
        let output = AskOutput {
            query,
            mode,
            retrieved: &retrieved,
            message: retrieved.is_empty().then_some(NO_RESULTS_MESSAGE),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", retrieved.render_or_fallback());
    }
    Ok(())
}

pub async fn run_status(cfg: &Config) -> Result<()> {
    let engine = open_engine(cfg).await?;
    let result = engine.status().await;
    engine.close().await;
    let status = result.map_err(with_rebuild_hint)?;

    if let Some(path) = &status.index_path {
        println!("index: {}", path.display());
    }
    println!("model: {} ({} dims)", status.model, status.dims);
    println!("documents: {}", status.documents);
    println!(
        "records: {} ({} valid, {} stale)",
        status.records, status.valid_records, status.stale_records
    );
    if status.outdated_documents > 0 {
        println!(
            "outdated documents: {} (indexed under another model or chunking; run sync)",
            status.outdated_documents
        );
    }
    match &status.last_indexed_at {
        Some(ts) => println!("last indexed: {ts}"),
        None => println!("last indexed: never"),
    }
    Ok(())
}

async fn open_engine(cfg: &Config) -> Result<Engine> {
    Engine::open(cfg).await.map_err(|e| {
        if matches!(e.downcast_ref::<Error>(), Some(Error::StorageCorruption(_))) {
            e.context("The index is corrupt. Run `docsage rebuild` to recreate it from the source documents")
        } else {
            e
        }
    })
}

fn with_rebuild_hint(err: Error) -> anyhow::Error {
    let hint = matches!(err, Error::StorageCorruption(_));
    let err = anyhow::Error::new(err);
    if hint {
        err.context("The index is corrupt. Run `docsage rebuild` to recreate it from the source documents")
    } else {
        err
    }
}

fn print_summary(label: &str, summary: &SyncSummary) {
    println!("{label}");
    println!("  added: {}", summary.added);
    println!("  modified: {}", summary.modified);
    println!("  removed: {}", summary.removed);
    println!("  unchanged: {}", summary.unchanged);
    println!("  records upserted: {}", summary.records_upserted);
    println!("  records deleted: {}", summary.records_deleted);
    if !summary.failures.is_empty() {
        println!("  failed: {}", summary.failures.len());
        for failure in &summary.failures {
            println!("    {} ({}): {}", failure.path, failure.kind, failure.message);
        }
    }
    println!("  elapsed: {}ms", summary.elapsed_ms);
    println!("ok");
}
