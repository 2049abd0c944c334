//! Configuration parsing and validation.
//!
//! docsage is configured via a TOML file (default: `config/docsage.toml`).
//! The configuration defines where the index lives, which documents are
//! indexed, how they are chunked and embedded, and how context is retrieved.
//!
//! # Example Configuration
//!
//! ```toml
//! [index]
//! path = "./data/docsage.sqlite"
//!
//! [source]
//! root = "./documents"
//! include_globs = ["**/*.md", "**/*.docx"]
//!
//! [chunking]
//! max_tokens = 1024
//! overlap_fraction = 0.5
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [retrieval]
//! top_k = 5
//! mode = "semantic"
//! ```
//!
//! # Environment
//!
//! `CHUNK_SIZE_TOKENS` and `CHUNK_OVERLAP_TOKENS` override the `[chunking]`
//! section. API keys are read from the variable named by
//! `embedding.api_key_env`; a `.env` file in the working directory is loaded
//! by the binary before the config.
//!
//! # Validation
//!
//! [`load_config`] rejects settings that could never produce a working
//! index: zero chunk sizes, out-of-range overlap, missing model settings for
//! remote providers, zero batch sizes or concurrency, and unknown providers.

use anyhow::{bail, Context, Result};
use docsage_core::chunk::{ChunkSettings, MAX_OVERLAP_FRACTION};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retrieve::RetrievalMode;

/// Default config path used by the CLI.
pub const DEFAULT_CONFIG_PATH: &str = "./config/docsage.toml";

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Location of the SQLite index.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Created on first use, along with its parent directory.
    pub path: PathBuf,
}

/// The document tree being indexed.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Files larger than this are reported as corrupt and skipped.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.markdown".to_string(),
        "**/*.docx".to_string(),
        "**/*.pdf".to_string(),
    ]
}

fn default_exclude_globs() -> Vec<String> {
    vec!["**/.git/**".to_string(), "**/~$*".to_string()]
}

fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Fraction of `max_tokens` shared between consecutive chunks.
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_fraction: default_overlap_fraction(),
        }
    }
}

fn default_max_tokens() -> usize {
    1024
}
fn default_overlap_fraction() -> f64 {
    0.5
}

impl ChunkingConfig {
    pub fn settings(&self) -> ChunkSettings {
        ChunkSettings::new(self.max_tokens, self.overlap_fraction)
    }
}

/// Embedding provider settings.
///
/// | Provider | Model | Dims |
/// |----------|-------|------|
/// | `openai` | required | required |
/// | `ollama` | required | required |
/// | `hashing` | optional (`hashing-bow`) | optional (256) |
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// API root. Defaults to `https://api.openai.com` or `http://localhost:11434`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Provider calls in flight across the whole process.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            requests_per_minute: None,
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    32_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    4
}
fn default_cache_capacity() -> usize {
    10_000
}

pub const HASHING_DEFAULT_MODEL: &str = "hashing-bow";
pub const HASHING_DEFAULT_DIMS: usize = 256;

impl EmbeddingConfig {
    /// Model id, with the provider's default applied.
    pub fn model_name(&self) -> String {
        match (&self.model, self.provider.as_str()) {
            (Some(model), _) => model.clone(),
            (None, "hashing") => HASHING_DEFAULT_MODEL.to_string(),
            (None, _) => String::new(),
        }
    }

    /// Vector dimensionality, with the provider's default applied.
    pub fn dimensions(&self) -> usize {
        match (self.dims, self.provider.as_str()) {
            (Some(dims), _) => dims,
            (None, "hashing") => HASHING_DEFAULT_DIMS,
            (None, _) => 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Documents reconciled in parallel.
    #[serde(default = "default_sync_concurrency")]
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_sync_concurrency(),
        }
    }
}

fn default_sync_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub mode: RetrievalMode,
    /// Candidates scoring below this are dropped. Cosine similarity in
    /// semantic mode, fused RRF score in hybrid mode.
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            mode: RetrievalMode::default(),
            min_score: None,
            max_context_chars: default_max_context_chars(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_context_chars() -> usize {
    8000
}
fn default_query_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load, override from the environment, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Parse config text without validation.
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

/// Apply `CHUNK_SIZE_TOKENS` / `CHUNK_OVERLAP_TOKENS` overrides.
///
/// The overlap is given in tokens and converted to a fraction of the
/// chunk size.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup("CHUNK_SIZE_TOKENS") {
        config.chunking.max_tokens = raw
            .trim()
            .parse()
            .with_context(|| format!("CHUNK_SIZE_TOKENS is not a number: {raw}"))?;
    }
    if let Some(raw) = lookup("CHUNK_OVERLAP_TOKENS") {
        let overlap: usize = raw
            .trim()
            .parse()
            .with_context(|| format!("CHUNK_OVERLAP_TOKENS is not a number: {raw}"))?;
        if config.chunking.max_tokens == 0 {
            bail!("CHUNK_OVERLAP_TOKENS requires a non-zero chunk size");
        }
        config.chunking.overlap_fraction = overlap as f64 / config.chunking.max_tokens as f64;
    }
    Ok(())
}

/// Check a parsed config for settings that could never work.
pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if !(0.0..=MAX_OVERLAP_FRACTION).contains(&config.chunking.overlap_fraction) {
        bail!(
            "chunking.overlap_fraction must be in [0.0, {}], got {}",
            MAX_OVERLAP_FRACTION,
            config.chunking.overlap_fraction
        );
    }

    // Validate source
    if config.source.include_globs.is_empty() {
        bail!("source.include_globs must not be empty");
    }
    if config.source.max_file_bytes == 0 {
        bail!("source.max_file_bytes must be > 0");
    }

    // Validate embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "openai" | "ollama" => {
            if embedding.model.as_deref().map_or(true, str::is_empty) {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
            if embedding.dims.map_or(true, |d| d == 0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    embedding.provider
                );
            }
        }
        "hashing" => {
            if embedding.dims == Some(0) {
                bail!("embedding.dims must be > 0");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, or hashing.",
            other
        ),
    }
    if embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }
    if embedding.max_concurrency == 0 {
        bail!("embedding.max_concurrency must be >= 1");
    }
    if embedding.initial_backoff_ms > embedding.max_backoff_ms {
        bail!("embedding.initial_backoff_ms must not exceed embedding.max_backoff_ms");
    }
    if embedding.requests_per_minute == Some(0) {
        bail!("embedding.requests_per_minute must be >= 1 when set");
    }

    if config.sync.concurrency == 0 {
        bail!("sync.concurrency must be >= 1");
    }

    // Validate retrieval
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be >= 1");
    }
    if config.retrieval.query_timeout_ms == 0 {
        bail!("retrieval.query_timeout_ms must be >= 1");
    }

    Ok(())
}
