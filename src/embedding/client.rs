//! Embedding client: batching, retry, caching, and concurrency limits on
//! top of an [`EmbeddingProvider`].
//!
//! # Behaviour
//!
//! 1. Look every text up in the cache, keyed by `(model, sha256(text))`.
//! 2. Deduplicate the misses and send them in batches of `batch_size`.
//! 3. Retry transient and rate-limit failures with exponential backoff;
//!    fail with [`Error::EmbeddingUnavailable`] once retries run out or on
//!    a permanent failure. A text is never silently dropped.
//! 4. Verify every batch returned one vector of the right dimensionality
//!    per input, then populate the cache.
//!
//! Provider calls from all clones of the process-wide semaphore are capped
//! at `max_concurrency`; an optional [`RateLimiter`] spaces them further.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docsage_core::embedding::{EmbeddingProvider, ProviderError};
use docsage_core::models::sha256_hex;
use docsage_core::{Error, Result};
use tokio::sync::Semaphore;

use super::rate_limit::RateLimiter;
use crate::config::EmbeddingConfig;

/// Exponential backoff schedule for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(32_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based):
    /// `initial_backoff × 2^(retry−1)`, capped at `max_backoff`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Tuning for [`EmbeddingClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub max_concurrency: usize,
    pub requests_per_minute: Option<u32>,
    pub cache_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            retry: RetryPolicy::default(),
            max_concurrency: 4,
            requests_per_minute: None,
            cache_capacity: 10_000,
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            retry: RetryPolicy::from_config(config),
            max_concurrency: config.max_concurrency,
            requests_per_minute: config.requests_per_minute,
            cache_capacity: config.cache_capacity,
        }
    }
}

/// Shared, cloneable handle to the embedding pipeline.
#[derive(Clone)]
pub struct EmbeddingClient {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<dyn EmbeddingProvider>,
    options: ClientOptions,
    permits: Semaphore,
    rate_limiter: Option<RateLimiter>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
    provider_calls: AtomicU64,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, options: ClientOptions) -> Self {
        let rate_limiter = options.requests_per_minute.map(RateLimiter::per_minute);
        Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(options.max_concurrency.max(1)),
                provider,
                rate_limiter,
                cache: Mutex::new(HashMap::new()),
                provider_calls: AtomicU64::new(0),
                options,
            }),
        }
    }

    pub fn model_name(&self) -> &str {
        self.inner.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.inner.provider.dims()
    }

    /// Number of provider calls made so far, including failed attempts.
    pub fn provider_calls(&self) -> u64 {
        self.inner.provider_calls.load(Ordering::Relaxed)
    }

    fn cache_key(&self, text: &str) -> String {
        format!("{}:{}", self.model_name(), sha256_hex(text.as_bytes()))
    }

    /// Embed `texts`, returning one vector per text in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| self.cache_key(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        // Unique misses in first-seen order, with every position they fill.
        let mut misses: Vec<(String, String)> = Vec::new();
        let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
        {
            let cache = self.inner.cache.lock().ok();
            for (i, key) in keys.iter().enumerate() {
                if let Some(hit) = cache.as_ref().and_then(|c| c.get(key)) {
                    results[i] = Some(hit.clone());
                    continue;
                }
                let slots = positions.entry(key.clone()).or_default();
                if slots.is_empty() {
                    misses.push((key.clone(), texts[i].clone()));
                }
                slots.push(i);
            }
        }

        if !misses.is_empty() {
            tracing::debug!(
                total = texts.len(),
                misses = misses.len(),
                "embedding cache misses"
            );
        }

        for batch in misses.chunks(self.inner.options.batch_size.max(1)) {
            let batch_texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            let vectors = self.call_with_retry(&batch_texts).await?;
            self.check_batch(&batch_texts, &vectors)?;

            for ((key, _), vector) in batch.iter().zip(vectors) {
                if let Some(slots) = positions.get(key) {
                    for &i in slots {
                        results[i] = Some(vector.clone());
                    }
                }
                self.remember(key, vector);
            }
        }

        results
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| Error::EmbeddingUnavailable {
                    attempts: 0,
                    reason: "provider returned no vector for a text".to_string(),
                })
            })
            .collect()
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::EmbeddingUnavailable {
                attempts: 0,
                reason: "empty embedding response".to_string(),
            })
    }

    fn remember(&self, key: &str, vector: Vec<f32>) {
        if let Ok(mut cache) = self.inner.cache.lock() {
            if cache.len() < self.inner.options.cache_capacity || cache.contains_key(key) {
                cache.insert(key.to_string(), vector);
            }
        }
    }

    fn check_batch(&self, texts: &[String], vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != texts.len() {
            return Err(Error::EmbeddingUnavailable {
                attempts: 1,
                reason: format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                ),
            });
        }
        let dims = self.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(Error::EmbeddingUnavailable {
                attempts: 1,
                reason: format!(
                    "provider returned a {}-dimensional vector, expected {dims}",
                    bad.len()
                ),
            });
        }
        Ok(())
    }

    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let retry = self.inner.options.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if let Some(limiter) = &self.inner.rate_limiter {
                limiter.acquire().await;
            }

            let outcome = {
                let _permit = self
                    .inner
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| Error::EmbeddingUnavailable {
                        attempts: attempt,
                        reason: "embedding client is shut down".to_string(),
                    })?;
                self.inner.provider_calls.fetch_add(1, Ordering::Relaxed);
                self.inner.provider.embed(texts).await
            };

            match outcome {
                Ok(vectors) => return Ok(vectors),
                Err(err) if err.is_retryable() && attempt <= retry.max_retries => {
                    let mut delay = retry.delay_for(attempt);
                    if let ProviderError::RateLimited {
                        retry_after: Some(hint),
                    } = &err
                    {
                        delay = delay.max(*hint);
                    }
                    tracing::warn!(
                        attempt,
                        batch = texts.len(),
                        ?delay,
                        error = %err,
                        "embedding request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "embedding request failed, giving up");
                    return Err(Error::EmbeddingUnavailable {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` calls with `error`, then delegates.
    struct FlakyProvider {
        inner: HashingProvider,
        failures: u32,
        error: ProviderError,
        calls: AtomicU32,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl FlakyProvider {
        fn new(failures: u32, error: ProviderError) -> Self {
            Self {
                inner: HashingProvider::new("flaky", 16),
                failures,
                error,
                calls: AtomicU32::new(0),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.batch_sizes.lock().unwrap().push(texts.len());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            self.inner.embed(texts).await
        }
    }

    /// Returns vectors of the wrong size.
    struct WrongDimsProvider;

    #[async_trait]
    impl EmbeddingProvider for WrongDimsProvider {
        fn model_name(&self) -> &str {
            "wrong"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![1.0; 4]).collect())
        }
    }

    fn fast_options() -> ClientOptions {
        ClientOptions {
            retry: RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            ..ClientOptions::default()
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(7), Duration::from_millis(32_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(32_000));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let provider = Arc::new(FlakyProvider::new(
            2,
            ProviderError::Transient("503".to_string()),
        ));
        let client = EmbeddingClient::new(provider.clone(), fast_options());
        let input = texts(&["retention policy", "holiday calendar"]);

        let vectors = client.embed(&input).await.unwrap();
        let expected = provider.inner.embed(&input).await.unwrap();
        assert_eq!(vectors, expected);
        assert_eq!(client.provider_calls(), 3);
    }

    #[tokio::test]
    async fn rate_limits_are_retried() {
        let provider = Arc::new(FlakyProvider::new(
            1,
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_millis(2)),
            },
        ));
        let client = EmbeddingClient::new(provider, fast_options());
        assert!(client.embed(&texts(&["a b c"])).await.is_ok());
        assert_eq!(client.provider_calls(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let provider = Arc::new(FlakyProvider::new(
            100,
            ProviderError::Transient("timeout".to_string()),
        ));
        let client = EmbeddingClient::new(provider, fast_options());
        let err = client.embed(&texts(&["x"])).await.unwrap_err();
        assert!(
            matches!(err, Error::EmbeddingUnavailable { attempts: 4, .. }),
            "{err:?}"
        );
        assert_eq!(client.provider_calls(), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let provider = Arc::new(FlakyProvider::new(
            1,
            ProviderError::Permanent("401 unauthorized".to_string()),
        ));
        let client = EmbeddingClient::new(provider, fast_options());
        let err = client.embed(&texts(&["x"])).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable { attempts: 1, .. }));
        assert_eq!(client.provider_calls(), 1);
    }

    #[tokio::test]
    async fn cache_hits_skip_the_provider() {
        let provider = Arc::new(FlakyProvider::new(0, ProviderError::Transient(String::new())));
        let client = EmbeddingClient::new(provider, fast_options());
        let input = texts(&["alpha", "beta"]);

        let first = client.embed(&input).await.unwrap();
        assert_eq!(client.provider_calls(), 1);
        let second = client.embed(&input).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.provider_calls(), 1);
        client.embed_query("beta").await.unwrap();
        assert_eq!(client.provider_calls(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_sent_once_and_batched() {
        let provider = Arc::new(FlakyProvider::new(0, ProviderError::Transient(String::new())));
        let options = ClientOptions {
            batch_size: 2,
            ..fast_options()
        };
        let client = EmbeddingClient::new(provider.clone(), options);
        let input = texts(&["one", "two", "one", "three", "two", "four", "five"]);

        let vectors = client.embed(&input).await.unwrap();
        assert_eq!(vectors.len(), 7);
        assert_eq!(vectors[0], vectors[2]);
        assert_eq!(vectors[1], vectors[4]);
        assert_eq!(*provider.batch_sizes.lock().unwrap(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn cache_capacity_is_respected() {
        let provider = Arc::new(FlakyProvider::new(0, ProviderError::Transient(String::new())));
        let options = ClientOptions {
            cache_capacity: 1,
            ..fast_options()
        };
        let client = EmbeddingClient::new(provider, options);
        client.embed(&texts(&["one", "two"])).await.unwrap();
        client.embed(&texts(&["two"])).await.unwrap();
        assert_eq!(client.provider_calls(), 2);
    }

    #[tokio::test]
    async fn wrong_dimensions_are_rejected() {
        let client = EmbeddingClient::new(Arc::new(WrongDimsProvider), fast_options());
        let err = client.embed(&texts(&["x"])).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingUnavailable { .. }));
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let client = EmbeddingClient::new(Arc::new(WrongDimsProvider), fast_options());
        assert!(client.embed(&[]).await.unwrap().is_empty());
        assert_eq!(client.provider_calls(), 0);
    }
}
