//! Query-time retrieval: embed a question, rank indexed chunks, and
//! assemble a size-bounded context block for the answer generator.
//!
//! # Modes
//!
//! | Mode | Candidates | Ranking |
//! |------|-----------|---------|
//! | `semantic` | vector search | cosine similarity |
//! | `hybrid` | vector + keyword search | reciprocal rank fusion (k = 60) |
//!
//! Ties are broken by recency (`indexed_seq` descending) and then by chunk
//! id, so the same index state and query always produce the same ranking.
//!
//! # Context Format
//!
//! ```text
//! [1] hr/retention.md (chunk 0)
//! Customer records are kept for seven years...
//!
//! [2] hr/handbook.docx (chunk 3)
//! ...
//! ```
//!
//! Passages are added in rank order while they fit `max_context_chars`.
//! Retrieval never mutates the index.

use std::sync::Arc;
use std::time::Duration;

use docsage_core::models::ScoredChunk;
use docsage_core::search::{reciprocal_rank_fusion, RRF_K};
use docsage_core::store::Store;
use docsage_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::embedding::client::EmbeddingClient;

/// Shown to the user when nothing relevant was retrieved.
pub const NO_RESULTS_MESSAGE: &str = "No relevant information found in the indexed documents.";

/// Hybrid mode pulls this many candidates per `top_k` from each list.
const HYBRID_CANDIDATE_FACTOR: usize = 4;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Semantic,
    Hybrid,
}

impl std::fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrievalMode::Semantic => f.write_str("semantic"),
            RetrievalMode::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Ranked passages plus the rendered context block.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievedContext {
    /// Passages included in `context`, in rank order.
    pub passages: Vec<ScoredChunk>,
    pub context: String,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// The context block, or [`NO_RESULTS_MESSAGE`] when nothing matched.
    pub fn render_or_fallback(&self) -> &str {
        if self.is_empty() {
            NO_RESULTS_MESSAGE
        } else {
            &self.context
        }
    }
}

/// Read-only query path over a [`Store`].
pub struct Retriever {
    store: Arc<dyn Store>,
    client: EmbeddingClient,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(store: Arc<dyn Store>, client: EmbeddingClient, config: RetrievalConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve up to `top_k` passages for `query` using the configured mode.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievedContext> {
        self.retrieve_with_mode(query, top_k, self.config.mode).await
    }

    pub async fn retrieve_with_mode(
        &self,
        query: &str,
        top_k: usize,
        mode: RetrievalMode,
    ) -> Result<RetrievedContext> {
        let query = query.trim();
        if query.is_empty() || top_k == 0 {
            return Ok(RetrievedContext::default());
        }

        let model = self.client.model_name().to_string();
        if self.store.record_count(&model).await? == 0 {
            return Err(Error::IndexEmpty);
        }

        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        let ranked = tokio::time::timeout(timeout, self.rank(query, top_k, mode, &model))
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        let passages: Vec<ScoredChunk> = match self.config.min_score {
            Some(min) => ranked.into_iter().filter(|c| c.score >= min).collect(),
            None => ranked,
        };

        let (passages, context) = assemble_context(passages, self.config.max_context_chars);
        tracing::debug!(
            %mode,
            top_k,
            returned = passages.len(),
            context_chars = context.chars().count(),
            "retrieved context"
        );
        Ok(RetrievedContext { passages, context })
    }

    async fn rank(
        &self,
        query: &str,
        top_k: usize,
        mode: RetrievalMode,
        model: &str,
    ) -> Result<Vec<ScoredChunk>> {
        let query_vec = self.client.embed_query(query).await?;

        match mode {
            RetrievalMode::Semantic => {
                let hits = self.store.search(&query_vec, top_k, model).await?;
                Ok(related_only(hits))
            }
            RetrievalMode::Hybrid => {
                let pool = top_k.saturating_mul(HYBRID_CANDIDATE_FACTOR);
                let vector = related_only(self.store.search(&query_vec, pool, model).await?);
                let keyword = self.store.keyword_search(query, pool, model).await?;
                Ok(reciprocal_rank_fusion(&[vector, keyword], RRF_K, top_k))
            }
        }
    }
}

/// Drop vector hits with no similarity to the query at all.
fn related_only(hits: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
    hits.into_iter().filter(|c| c.score > 0.0).collect()
}

/// Render passages in rank order within `budget` characters.
///
/// Passages that do not fit are dropped. A first passage larger than the
/// whole budget is truncated rather than dropped.
pub fn assemble_context(passages: Vec<ScoredChunk>, budget: usize) -> (Vec<ScoredChunk>, String) {
    let mut included = Vec::new();
    let mut context = String::new();
    let mut used = 0usize;

    for passage in passages {
        let header = format!(
            "[{}] {} (chunk {})",
            included.len() + 1,
            passage.path,
            passage.chunk_index
        );
        let block = format!("{header}\n{}", passage.text.trim());
        let separator = if included.is_empty() { 0 } else { 2 };
        let block_chars = block.chars().count();

        if used + separator + block_chars <= budget {
            if separator > 0 {
                context.push_str("\n\n");
            }
            context.push_str(&block);
            used += separator + block_chars;
            included.push(passage);
        } else if included.is_empty() {
            context = truncate_chars(&block, budget).to_string();
            included.push(passage);
            break;
        }
    }

    (included, context)
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::client::ClientOptions;
    use crate::embedding::HashingProvider;
    use docsage_core::models::IndexRecord;
    use docsage_core::store::memory::InMemoryStore;

    fn passage(path: &str, index: i64, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk_id: format!("{path}#{index}"),
            document_id: path.to_string(),
            path: path.to_string(),
            chunk_index: index,
            text: text.to_string(),
            score: 1.0,
            indexed_seq: 1,
        }
    }

    async fn retriever_with(texts: &[(&str, &str)], config: RetrievalConfig) -> Retriever {
        let provider = Arc::new(HashingProvider::new("hashing-bow", 4096));
        let store = Arc::new(InMemoryStore::new());
        for (path, text) in texts {
            let record = IndexRecord {
                chunk_id: format!("{path}#0"),
                document_id: path.to_string(),
                path: path.to_string(),
                chunk_index: 0,
                offset: 0,
                text: text.to_string(),
                content_hash: docsage_core::models::sha256_hex(text.as_bytes()),
                model: "hashing-bow".to_string(),
                vector: provider.embed_one(text),
            };
            store.upsert(&record).await.unwrap();
        }
        let client = EmbeddingClient::new(provider, ClientOptions::default());
        Retriever::new(store, client, config)
    }

    #[test]
    fn context_has_numbered_headers() {
        let (included, context) = assemble_context(
            vec![passage("a.md", 0, "alpha"), passage("b.docx", 2, "beta")],
            1000,
        );
        assert_eq!(included.len(), 2);
        assert_eq!(context, "[1] a.md (chunk 0)\nalpha\n\n[2] b.docx (chunk 2)\nbeta");
    }

    #[test]
    fn context_respects_budget() {
        let long = "x".repeat(50);
        let (included, context) = assemble_context(
            vec![
                passage("a.md", 0, "short"),
                passage("b.md", 0, &long),
                passage("c.md", 0, "tiny"),
            ],
            50,
        );
        assert!(context.chars().count() <= 50);
        let paths: Vec<&str> = included.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "c.md"]);
        assert!(context.contains("[2] c.md (chunk 0)"));
    }

    #[test]
    fn oversized_first_passage_is_truncated() {
        let text = "é".repeat(100);
        let (included, context) = assemble_context(vec![passage("a.md", 0, &text)], 30);
        assert_eq!(included.len(), 1);
        assert_eq!(context.chars().count(), 30);
    }

    #[test]
    fn fallback_message_when_empty() {
        let empty = RetrievedContext::default();
        assert_eq!(empty.render_or_fallback(), NO_RESULTS_MESSAGE);
    }

    #[tokio::test]
    async fn empty_index_is_reported() {
        let retriever = retriever_with(&[], RetrievalConfig::default()).await;
        let err = retriever.retrieve("anything", 3).await.unwrap_err();
        assert!(matches!(err, Error::IndexEmpty));
    }

    #[tokio::test]
    async fn blank_query_returns_empty_context() {
        let retriever = retriever_with(&[("a.md", "text")], RetrievalConfig::default()).await;
        let result = retriever.retrieve("   ", 3).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn semantic_ranks_matching_passage_first() {
        let retriever = retriever_with(
            &[
                ("kitchen.md", "The kitchen is cleaned every Friday afternoon"),
                ("retention.md", "The quarterly retention policy keeps records seven years"),
                ("travel.md", "Travel expenses are reimbursed within thirty days"),
            ],
            RetrievalConfig::default(),
        )
        .await;
        let result = retriever
            .retrieve("What is the quarterly retention policy?", 2)
            .await
            .unwrap();
        assert_eq!(result.passages[0].path, "retention.md");
        assert!(result.context.starts_with("[1] retention.md (chunk 0)"));
    }

    #[tokio::test]
    async fn min_score_drops_unrelated_passages() {
        let config = RetrievalConfig {
            min_score: Some(0.3),
            ..RetrievalConfig::default()
        };
        let retriever = retriever_with(
            &[
                ("retention.md", "quarterly retention policy"),
                ("kitchen.md", "kitchen cleaning rota"),
            ],
            config,
        )
        .await;
        let result = retriever.retrieve("retention policy", 5).await.unwrap();
        assert_eq!(result.passages.len(), 1);

        let result = retriever.retrieve("parking garage", 5).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn unrelated_query_returns_nothing_by_default() {
        let retriever = retriever_with(
            &[
                ("retention.md", "quarterly retention policy"),
                ("kitchen.md", "kitchen cleaning rota"),
            ],
            RetrievalConfig::default(),
        )
        .await;
        assert!(retriever.config().min_score.is_none());

        let result = retriever.retrieve("Where is the parking garage?", 3).await.unwrap();
        assert!(result.is_empty(), "{:?}", result.passages);
        assert_eq!(result.render_or_fallback(), NO_RESULTS_MESSAGE);

        let hybrid = retriever
            .retrieve_with_mode("Where is the parking garage?", 3, RetrievalMode::Hybrid)
            .await
            .unwrap();
        assert!(hybrid.is_empty());
    }

    #[tokio::test]
    async fn hybrid_mode_fuses_lists() {
        let config = RetrievalConfig {
            mode: RetrievalMode::Hybrid,
            ..RetrievalConfig::default()
        };
        let retriever = retriever_with(
            &[
                ("retention.md", "quarterly retention policy for records"),
                ("kitchen.md", "kitchen cleaning rota"),
            ],
            config,
        )
        .await;
        let result = retriever.retrieve("retention policy", 2).await.unwrap();
        assert_eq!(result.passages[0].path, "retention.md");
        assert!(result.passages[0].score > 0.0);
        assert!(result.passages[0].score <= 2.0 / (RRF_K + 1.0) + f64::EPSILON);
    }
}
