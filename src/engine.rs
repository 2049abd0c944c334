//! The library surface: one [`Engine`] per index.
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! let config = docsage::config::load_config("config/docsage.toml".as_ref())?;
//! let engine = docsage::engine::Engine::open(&config).await?;
//! engine.sync().await?;
//! let context = engine.retrieve("What is the retention policy?", 5).await?;
//! println!("{}", context.render_or_fallback());
//! # Ok(())
//! # }
//! ```
//!
//! The engine owns the store, the embedding client, the synchronizer (the
//! only writer), and the retriever (read-only). Queries do not wait for a
//! running sync pass.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use chrono::{TimeZone, Utc};
use docsage_core::embedding::EmbeddingProvider;
use docsage_core::store::Store;
use docsage_core::Result;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::Config;
use crate::embedding::client::{ClientOptions, EmbeddingClient};
use crate::embedding::create_provider;
use crate::retrieve::{RetrievalMode, RetrievedContext, Retriever};
use crate::sqlite_store::SqliteStore;
use crate::sync::{SyncPhase, SyncSummary, Synchronizer};

/// Snapshot of index health for `docsage status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub index_path: Option<PathBuf>,
    pub model: String,
    pub dims: usize,
    pub pipeline_key: String,
    pub documents: usize,
    pub records: usize,
    pub valid_records: usize,
    pub stale_records: usize,
    /// Documents indexed under another model or chunking setup.
    pub outdated_documents: usize,
    /// RFC 3339 time of the most recent commit.
    pub last_indexed_at: Option<String>,
    pub phase: SyncPhase,
}

pub struct Engine {
    store: Arc<dyn Store>,
    sqlite: Option<Arc<SqliteStore>>,
    client: EmbeddingClient,
    synchronizer: Synchronizer,
    retriever: Retriever,
}

impl Engine {
    /// Open the SQLite index named in `config` and build the provider.
    pub async fn open(config: &Config) -> AnyResult<Self> {
        let store = SqliteStore::open(&config.index.path)
            .await
            .with_context(|| format!("Failed to open index at {}", config.index.path.display()))?;
        Self::with_sqlite(store, config)
    }

    /// Delete the index files and start from an empty index.
    ///
    /// Used to recover from storage corruption.
    pub async fn open_recreating(config: &Config) -> AnyResult<Self> {
        tracing::warn!(path = %config.index.path.display(), "recreating index database");
        let store = SqliteStore::recreate(&config.index.path)
            .await
            .with_context(|| {
                format!("Failed to recreate index at {}", config.index.path.display())
            })?;
        Self::with_sqlite(store, config)
    }

    fn with_sqlite(store: SqliteStore, config: &Config) -> AnyResult<Self> {
        let provider = create_provider(&config.embedding)?;
        let sqlite = Arc::new(store);
        let mut engine = Self::from_parts(sqlite.clone(), provider, config)?;
        engine.sqlite = Some(sqlite);
        Ok(engine)
    }

    /// Assemble an engine over any store and provider.
    pub fn from_parts(
        store: Arc<dyn Store>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Result<Self> {
        let chunking = config.chunking.settings();
        chunking.validate()?;

        let client = EmbeddingClient::new(provider, ClientOptions::from_config(&config.embedding));
        let synchronizer = Synchronizer::new(
            store.clone(),
            client.clone(),
            config.source.clone(),
            chunking,
            config.sync.concurrency,
        );
        let retriever = Retriever::new(store.clone(), client.clone(), config.retrieval.clone());

        Ok(Self {
            store,
            sqlite: None,
            client,
            synchronizer,
            retriever,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn embedding_client(&self) -> &EmbeddingClient {
        &self.client
    }

    /// Bring the index up to date with the source tree.
    pub async fn sync(&self) -> Result<SyncSummary> {
        self.synchronizer.sync().await
    }

    /// Clear the index and re-derive everything.
    pub async fn rebuild(&self) -> Result<SyncSummary> {
        self.synchronizer.rebuild().await
    }

    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievedContext> {
        self.retriever.retrieve(query, top_k).await
    }

    pub async fn retrieve_with_mode(
        &self,
        query: &str,
        top_k: usize,
        mode: RetrievalMode,
    ) -> Result<RetrievedContext> {
        self.retriever.retrieve_with_mode(query, top_k, mode).await
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.synchronizer.subscribe()
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let model = self.client.model_name().to_string();
        let stats = self.store.stats(&model).await?;
        let manifest = self.store.manifest().await?;
        let pipeline_key = self.synchronizer.pipeline_key();

        let outdated_documents = manifest
            .iter()
            .filter(|entry| entry.pipeline_key != pipeline_key)
            .count();
        let last_indexed_at = manifest
            .iter()
            .map(|entry| entry.indexed_at)
            .max()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|dt| dt.to_rfc3339());

        Ok(StatusReport {
            index_path: self.sqlite.as_ref().map(|s| s.path().to_path_buf()),
            dims: self.client.dims(),
            model,
            pipeline_key,
            documents: stats.documents,
            records: stats.records,
            valid_records: stats.valid_records,
            stale_records: stats.stale_records,
            outdated_documents,
            last_indexed_at,
            phase: self.synchronizer.phase(),
        })
    }

    /// Close the database pool, if any.
    pub async fn close(&self) {
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
    }
}
