//! Embedding gateway: cache, batching, timeouts, and request coalescing.
//!
//! Every embedding request in the engine goes through [`EmbeddingGateway`].
//! For each text it:
//!
//! 1. Computes a cache key from `(model, intent, text)`.
//! 2. Returns a cached vector when one is live.
//! 3. Otherwise joins an identical request already in flight, if any.
//! 4. Otherwise claims the key; all claimed keys are sent upstream together,
//!    split into provider batches of `batch_size`, each bounded by `timeout`.
//!
//! A batch either fully succeeds or fails as a whole with
//! [`EngineError::ExternalService`]; no partial results are returned and
//! nothing is cached on failure. Failed in-flight entries are released so
//! the next caller issues a fresh request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::cache::{cache_key, EmbeddingCache};
use crate::embedding::{estimate_usage, EmbedIntent, EmbeddingProvider, UsageEstimate};
use crate::error::{EngineError, EngineResult};

type SharedVector = Shared<BoxFuture<'static, EngineResult<Arc<Vec<f32>>>>>;
type InflightMap = Mutex<HashMap<String, SharedVector>>;

/// Gateway tuning knobs.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum texts per upstream call.
    pub batch_size: usize,
    /// Upper bound on each upstream call.
    pub timeout: Duration,
    /// Used by [`EmbeddingGateway::estimate`] only.
    pub price_per_1k_tokens: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            timeout: Duration::from_secs(30),
            price_per_1k_tokens: 0.00002,
        }
    }
}

pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    inflight: Arc<InflightMap>,
    config: GatewayConfig,
}

/// Releases claimed in-flight keys when the owning request finishes or is
/// dropped, unless another request has since replaced the entry.
struct InflightGuard {
    inflight: Arc<InflightMap>,
    claimed: Vec<(String, SharedVector)>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut map = self.inflight.lock();
        for (key, fut) in self.claimed.drain(..) {
            if map.get(&key).is_some_and(|current| current.ptr_eq(&fut)) {
                map.remove(&key);
            }
        }
    }
}

enum Slot {
    Ready(Arc<Vec<f32>>),
    Pending(SharedVector),
}

impl EmbeddingGateway {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Token / cost estimate for embedding `texts`. Never used for control flow.
    pub fn estimate<S: AsRef<str>>(&self, texts: &[S]) -> UsageEstimate {
        estimate_usage(texts, self.config.price_per_1k_tokens)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut vectors = self
            .embed_batch(&[text.to_string()], EmbedIntent::Query)
            .await?;
        vectors
            .pop()
            .ok_or_else(|| EngineError::external("embedding", "empty embedding response"))
    }

    /// Embed `texts`, one vector per text, in input order.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        intent: EmbedIntent,
    ) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.provider.model_name().to_string();
        let keys: Vec<String> = texts.iter().map(|t| cache_key(&model, intent, t)).collect();

        let mut slots: Vec<Slot> = Vec::with_capacity(texts.len());
        let mut guard = InflightGuard {
            inflight: self.inflight.clone(),
            claimed: Vec::new(),
        };
        let (mut hits, mut coalesced) = (0usize, 0usize);

        {
            let mut inflight = self.inflight.lock();
            let mut claimed_here: HashMap<&str, SharedVector> = HashMap::new();
            let mut miss_keys: Vec<&str> = Vec::new();
            let mut miss_texts: Vec<String> = Vec::new();
            let mut pending_misses: Vec<(usize, usize)> = Vec::new();

            for (i, key) in keys.iter().enumerate() {
                if let Some(vector) = self.cache.get(key) {
                    hits += 1;
                    slots.push(Slot::Ready(vector));
                } else if let Some(fut) = inflight.get(key.as_str()) {
                    coalesced += 1;
                    slots.push(Slot::Pending(fut.clone()));
                } else if let Some(pos) = miss_keys.iter().position(|k| *k == key.as_str()) {
                    // Duplicate text within this batch; resolved below.
                    pending_misses.push((i, pos));
                    slots.push(Slot::Ready(Arc::new(Vec::new())));
                } else {
                    pending_misses.push((i, miss_keys.len()));
                    miss_keys.push(key.as_str());
                    miss_texts.push(texts[i].clone());
                    slots.push(Slot::Ready(Arc::new(Vec::new())));
                }
            }

            if !miss_keys.is_empty() {
                let batch = self.upstream(miss_texts, intent).boxed().shared();
                for (j, key) in miss_keys.iter().enumerate() {
                    let batch = batch.clone();
                    let per_key: SharedVector = async move {
                        let all = batch.await?;
                        Ok::<_, EngineError>(Arc::new(all[j].clone()))
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.to_string(), per_key.clone());
                    guard.claimed.push((key.to_string(), per_key.clone()));
                    claimed_here.insert(key, per_key);
                }
                for (i, j) in pending_misses {
                    slots[i] = Slot::Pending(claimed_here[miss_keys[j]].clone());
                }
            }
        }

        tracing::debug!(
            model = %model,
            intent = intent.as_str(),
            total = texts.len(),
            hits,
            coalesced,
            claimed = guard.claimed.len(),
            "embedding batch"
        );

        let resolved = join_all(slots.into_iter().map(|slot| async move {
            match slot {
                Slot::Ready(v) => Ok(v),
                Slot::Pending(fut) => fut.await,
            }
        }))
        .await;

        let mut vectors = Vec::with_capacity(resolved.len());
        for r in resolved {
            vectors.push(r?);
        }

        for (key, fut) in &guard.claimed {
            if let Some(Ok(vector)) = fut.peek() {
                self.cache.insert(key.clone(), vector.clone());
            }
        }
        drop(guard);

        Ok(vectors
            .into_iter()
            .map(|v| Arc::try_unwrap(v).unwrap_or_else(|shared| (*shared).clone()))
            .collect())
    }

    /// Send `texts` upstream in provider-sized batches.
    fn upstream(
        &self,
        texts: Vec<String>,
        intent: EmbedIntent,
    ) -> impl std::future::Future<Output = EngineResult<Arc<Vec<Vec<f32>>>>> + Send + 'static
    {
        let provider = self.provider.clone();
        let batch_size = self.config.batch_size.max(1);
        let timeout = self.config.timeout;

        async move {
            let mut out = Vec::with_capacity(texts.len());
            for batch in texts.chunks(batch_size) {
                let started = std::time::Instant::now();
                let vectors = match tokio::time::timeout(timeout, provider.embed(batch, intent)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(EngineError::external(
                            "embedding",
                            format!("request timed out after {:?}", timeout),
                        ))
                    }
                };
                if vectors.len() != batch.len() {
                    return Err(EngineError::external(
                        "embedding",
                        format!(
                            "provider returned {} vectors for {} texts",
                            vectors.len(),
                            batch.len()
                        ),
                    ));
                }
                let dims = provider.dims();
                if dims > 0 {
                    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                        return Err(EngineError::external(
                            "embedding",
                            format!("expected {} dimensions, got {}", dims, bad.len()),
                        ));
                    }
                }
                tracing::debug!(
                    batch = batch.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "embedding upstream call"
                );
                out.extend(vectors);
            }
            Ok(Arc::new(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddingProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts upstream calls and texts; optionally sleeps or misbehaves.
    struct CountingProvider {
        inner: HashEmbeddingProvider,
        calls: AtomicUsize,
        texts: AtomicUsize,
        delay: Duration,
        drop_last: bool,
        fail: bool,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: HashEmbeddingProvider::new(8),
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
                delay: Duration::ZERO,
                drop_last: false,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String], intent: EmbedIntent) -> EngineResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(EngineError::external("embedding", "upstream 503"));
            }
            let mut out = self.inner.embed(texts, intent).await?;
            if self.drop_last {
                out.pop();
            }
            Ok(out)
        }
    }

    fn gateway(provider: Arc<CountingProvider>, config: GatewayConfig) -> EmbeddingGateway {
        let cache = Arc::new(EmbeddingCache::new(Duration::from_secs(300), 1000));
        EmbeddingGateway::new(provider, cache, config)
    }

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_preserves_order_and_uses_cache() {
        let provider = Arc::new(CountingProvider::new());
        let gw = gateway(provider.clone(), GatewayConfig::default());
        let texts = strings(&["alpha", "beta", "gamma"]);

        let first = gw.embed_batch(&texts, EmbedIntent::Document).await.unwrap();
        let expected = HashEmbeddingProvider::new(8);
        for (t, v) in texts.iter().zip(&first) {
            assert_eq!(v, &expected.embed_one(t));
        }

        let second = gw.embed_batch(&texts, EmbedIntent::Document).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // A different intent is a different cache entry.
        gw.embed_batch(&texts[..1], EmbedIntent::Query).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_only_misses_go_upstream() {
        let provider = Arc::new(CountingProvider::new());
        let gw = gateway(provider.clone(), GatewayConfig::default());
        gw.embed_batch(&strings(&["a", "b"]), EmbedIntent::Document)
            .await
            .unwrap();
        gw.embed_batch(&strings(&["a", "b", "c", "c"]), EmbedIntent::Document)
            .await
            .unwrap();
        assert_eq!(provider.texts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_splits_into_provider_batches() {
        let provider = Arc::new(CountingProvider::new());
        let config = GatewayConfig {
            batch_size: 2,
            ..GatewayConfig::default()
        };
        let gw = gateway(provider.clone(), config);
        let texts: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();
        let out = gw.embed_batch(&texts, EmbedIntent::Document).await.unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_coalesce() {
        let mut p = CountingProvider::new();
        p.delay = Duration::from_millis(50);
        let provider = Arc::new(p);
        let gw = Arc::new(gateway(provider.clone(), GatewayConfig::default()));

        let a = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.embed_query("what is rust?").await })
        };
        let b = {
            let gw = gw.clone();
            tokio::spawn(async move { gw.embed_query("what is rust?").await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, b);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(gw.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_count_mismatch_fails_atomically() {
        let mut p = CountingProvider::new();
        p.drop_last = true;
        let gw = gateway(Arc::new(p), GatewayConfig::default());
        let err = gw
            .embed_batch(&strings(&["a", "b"]), EmbedIntent::Document)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExternalService { .. }));
        assert!(gw.cache().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_not_sticky() {
        let mut p = CountingProvider::new();
        p.fail = true;
        let provider = Arc::new(p);
        let gw = gateway(provider.clone(), GatewayConfig::default());
        assert!(gw.embed_query("q").await.is_err());
        assert!(gw.embed_query("q").await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert!(gw.inflight.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_as_external_error() {
        let mut p = CountingProvider::new();
        p.delay = Duration::from_secs(60);
        let config = GatewayConfig {
            timeout: Duration::from_secs(1),
            ..GatewayConfig::default()
        };
        let gw = gateway(Arc::new(p), config);
        let err = gw.embed_query("slow").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let gw = gateway(Arc::new(CountingProvider::new()), GatewayConfig::default());
        assert!(gw
            .embed_batch(&[], EmbedIntent::Document)
            .await
            .unwrap()
            .is_empty());
    }
}
