//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, the [`EmbedIntent`] distinguishing document from query
//! embeddings, a cost estimator used for observability, and pure helpers
//! for vector serialization and similarity.
//!
//! Concrete network providers (OpenAI-compatible, Ollama) live in the
//! `knowledge-harness` app crate. This crate ships [`DisabledProvider`] and
//! the offline [`HashEmbeddingProvider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

/// Approximate characters-per-token ratio used for cost estimation.
const CHARS_PER_TOKEN: usize = 4;

/// Whether a text is embedded for storage or for querying.
///
/// Asymmetric embedding models produce different vectors for the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedIntent {
    Document,
    Query,
}

impl EmbedIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedIntent::Document => "document",
            EmbedIntent::Query => "query",
        }
    }
}

/// Trait for embedding providers.
///
/// Implementations must return exactly one vector per input text, in input
/// order. The [`EmbeddingGateway`](crate::gateway::EmbeddingGateway)
/// verifies this and enforces timeouts; providers only talk to their backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1024`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String], intent: EmbedIntent) -> EngineResult<Vec<Vec<f32>>>;
}

/// A no-op provider used when embeddings are not configured.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String], _intent: EmbedIntent) -> EngineResult<Vec<Vec<f32>>> {
        Err(EngineError::external(
            "embedding",
            "embedding provider is disabled",
        ))
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed into one of `dims` buckets
/// with a sign bit, and the result is L2-normalized. Texts sharing vocabulary
/// end up close in cosine space. Needs no network and no model files, which
/// makes it suitable for local development and tests.
pub struct HashEmbeddingProvider {
    dims: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], _intent: EmbedIntent) -> EngineResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Lowercase alphanumeric tokens, shared by the hash embedder and the
/// in-memory lexical index.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Token and cost estimate for a batch of texts. Observability only.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEstimate {
    pub tokens: u64,
    pub estimated_cost: f64,
}

/// Estimate tokens for one text (`ceil(chars / 4)`).
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u64
}

/// Estimate tokens and monetary cost for a batch of texts.
pub fn estimate_usage<S: AsRef<str>>(texts: &[S], price_per_1k_tokens: f64) -> UsageEstimate {
    let tokens: u64 = texts.iter().map(|t| estimate_tokens(t.as_ref())).sum();
    UsageEstimate {
        tokens,
        estimated_cost: tokens as f64 / 1000.0 * price_per_1k_tokens,
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use knowledge_harness_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_estimate_usage() {
        let texts = vec!["abcd".to_string(), "abcde".to_string(), String::new()];
        let usage = estimate_usage(&texts, 0.02);
        assert_eq!(usage.tokens, 3);
        assert!((usage.estimated_cost - 0.00006).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_disabled_provider_fails() {
        let err = DisabledProvider
            .embed(&["x".to_string()], EmbedIntent::Query)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExternalService { .. }));
    }

    #[test]
    fn test_hash_embedder_similarity_follows_vocabulary() {
        let p = HashEmbeddingProvider::new(256);
        let a = p.embed_one("rust ownership and borrowing");
        let b = p.embed_one("borrowing rules in rust");
        let c = p.embed_one("gardening tomatoes in spring");
        assert_eq!(a.len(), 256);
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        assert_eq!(a, p.embed_one("rust ownership and borrowing"));
    }
}
