//! Hybrid retrieval with Reciprocal Rank Fusion.
//!
//! The retriever operates entirely through the [`ChunkStore`] trait and the
//! [`EmbeddingGateway`]; it owns no data.
//!
//! # Algorithm
//!
//! 1. Classify the query ([`classify_query`]) to pick fusion weights.
//! 2. Concurrently run semantic search (embed the query with intent
//!    `query`, then rank by vector similarity) and lexical search (BM25).
//!    Each fetches `max(candidate_k, top_k)` candidates. If one fails the
//!    other is used alone; if both fail the call fails with
//!    [`EngineError::Retrieval`].
//! 3. Fuse by rank: `score(x) = Σ weight_i / (k + rank_i(x))` over the lists
//!    containing `x`, ranks starting at 1.
//! 4. Normalize by the best achievable score, `Σ weight_i / (k + 1)` over the
//!    lists that ran, so a chunk ranked first everywhere scores `1.0`.
//! 5. Sort by score (desc) then chunk id (asc), truncate to `top_k`.
//! 6. Tag relevance tiers and drop results below `min_score`.
//!
//! Raw backend scores never enter the fused score, so BM25 and cosine scales
//! cannot distort each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::classify::{classify_query, FusionPolicy, FusionWeights, QueryClass};
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::gateway::EmbeddingGateway;
use crate::models::{ChunkCandidate, RetrievalResult, TenantId, TierThresholds};
use crate::store::ChunkStore;

/// Largest `top_k` a caller may request.
pub const MAX_TOP_K: usize = 100;

/// Retriever tuning, decoupled from application config.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    /// Candidates fetched from each search before fusion.
    pub candidate_k: usize,
    pub tiers: TierThresholds,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            candidate_k: 50,
            tiers: TierThresholds::default(),
        }
    }
}

impl RetrievalParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.candidate_k == 0 {
            return Err(EngineError::Configuration(
                "candidate_k must be at least 1".to_string(),
            ));
        }
        let t = self.tiers;
        if !(0.0..=1.0).contains(&t.medium) || !(0.0..=1.0).contains(&t.high) || t.medium > t.high
        {
            return Err(EngineError::Configuration(format!(
                "tier thresholds must satisfy 0 <= medium <= high <= 1, got medium={} high={}",
                t.medium, t.high
            )));
        }
        Ok(())
    }
}

/// Per-call retrieval options.
#[derive(Debug, Clone, Copy)]
pub struct RetrieveOptions {
    pub top_k: usize,
    pub min_score: f64,
    /// When false only semantic search runs.
    pub use_hybrid: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.7,
            use_hybrid: true,
        }
    }
}

impl RetrieveOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.top_k == 0 || self.top_k > MAX_TOP_K {
            return Err(ValidationError::InvalidTopK {
                got: self.top_k,
                max: MAX_TOP_K,
            });
        }
        if !self.min_score.is_finite() || !(0.0..=1.0).contains(&self.min_score) {
            return Err(ValidationError::InvalidMinScore(self.min_score));
        }
        Ok(())
    }
}

/// A chunk after fusion, before hydration.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Normalized fused score in `[0.0, 1.0]`.
    pub score: f64,
    /// 1-based rank in the semantic list.
    pub semantic_rank: Option<usize>,
    /// 1-based rank in the lexical list.
    pub lexical_rank: Option<usize>,
}

/// Fuse ranked lists with weighted Reciprocal Rank Fusion.
///
/// `None` means the list did not run (disabled or failed) and contributes
/// nothing to the normalization bound. The output is sorted by score
/// descending with ties broken by chunk id.
pub fn rrf_fuse(
    semantic: Option<&[ChunkCandidate]>,
    lexical: Option<&[ChunkCandidate]>,
    weights: FusionWeights,
    k: f64,
) -> Vec<FusedCandidate> {
    let mut fused: BTreeMap<&str, FusedCandidate> = BTreeMap::new();
    let mut best = 0.0;

    for (list, weight, is_semantic) in [
        (semantic, weights.semantic, true),
        (lexical, weights.lexical, false),
    ] {
        let Some(list) = list else { continue };
        best += weight / (k + 1.0);
        for (idx, cand) in list.iter().enumerate() {
            let rank = idx + 1;
            let entry = fused
                .entry(cand.chunk_id.as_str())
                .or_insert_with(|| FusedCandidate {
                    chunk_id: cand.chunk_id.clone(),
                    document_id: cand.document_id.clone(),
                    score: 0.0,
                    semantic_rank: None,
                    lexical_rank: None,
                });
            // A list may repeat an id; only its best rank counts.
            let slot = if is_semantic {
                &mut entry.semantic_rank
            } else {
                &mut entry.lexical_rank
            };
            if slot.is_none() {
                *slot = Some(rank);
                entry.score += weight / (k + rank as f64);
            }
        }
    }

    let mut out: Vec<FusedCandidate> = fused
        .into_values()
        .map(|mut c| {
            c.score = if best > 0.0 {
                (c.score / best).clamp(0.0, 1.0)
            } else {
                0.0
            };
            c
        })
        .collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    out
}

/// Result of one retrieval call.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub results: Vec<RetrievalResult>,
    pub class: QueryClass,
    /// Distinct chunks seen across both lists before truncation.
    pub candidates_considered: usize,
    /// Set when semantic search failed and lexical results were used alone.
    pub semantic_error: Option<String>,
    /// Set when lexical search failed and semantic results were used alone.
    pub lexical_error: Option<String>,
}

impl RetrievalOutcome {
    pub fn degraded(&self) -> bool {
        self.semantic_error.is_some() || self.lexical_error.is_some()
    }
}

/// Orchestrates parallel semantic and lexical search and fuses the results.
pub struct HybridRetriever {
    store: Arc<dyn ChunkStore>,
    gateway: Arc<EmbeddingGateway>,
    params: RetrievalParams,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        gateway: Arc<EmbeddingGateway>,
        params: RetrievalParams,
    ) -> EngineResult<Self> {
        params.validate()?;
        Ok(Self {
            store,
            gateway,
            params,
        })
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Classify `query` and retrieve.
    pub async fn retrieve(
        &self,
        tenant: &TenantId,
        query: &str,
        options: RetrieveOptions,
        policy: &FusionPolicy,
    ) -> EngineResult<RetrievalOutcome> {
        self.retrieve_classified(tenant, query, classify_query(query), options, policy)
            .await
    }

    /// Retrieve with a classification computed by the caller.
    pub async fn retrieve_classified(
        &self,
        tenant: &TenantId,
        query: &str,
        class: QueryClass,
        options: RetrieveOptions,
        policy: &FusionPolicy,
    ) -> EngineResult<RetrievalOutcome> {
        if query.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        options.validate()?;

        let limit = self.params.candidate_k.max(options.top_k);

        let semantic = async {
            let vector = self.gateway.embed_query(query).await?;
            self.store.vector_search(tenant, &vector, limit).await
        };
        let lexical = async {
            if options.use_hybrid {
                Some(self.store.keyword_search(tenant, query, limit).await)
            } else {
                None
            }
        };
        let (semantic, lexical) = futures::join!(semantic, lexical);

        let (semantic, semantic_error) = split(semantic);
        let (lexical, lexical_error) = match lexical {
            Some(result) => split(result),
            None => (None, None),
        };

        if semantic.is_none() && lexical.is_none() {
            let semantic = semantic_error.unwrap_or_else(|| "no result".to_string());
            let lexical = lexical_error.unwrap_or_else(|| "disabled".to_string());
            tracing::error!(
                tenant = %tenant,
                semantic = %semantic,
                lexical = %lexical,
                "all searches failed"
            );
            return Err(EngineError::Retrieval { semantic, lexical });
        }
        if let Some(err) = &semantic_error {
            tracing::warn!(tenant = %tenant, error = %err, "semantic search failed, using lexical results only");
        }
        if let Some(err) = &lexical_error {
            tracing::warn!(tenant = %tenant, error = %err, "lexical search failed, using semantic results only");
        }

        let weights = policy.weights_for(class);
        let mut fused = rrf_fuse(
            semantic.as_deref(),
            lexical.as_deref(),
            weights,
            policy.rrf_k,
        );
        let candidates_considered = fused.len();
        fused.truncate(options.top_k);

        let ids: Vec<String> = fused.iter().map(|c| c.chunk_id.clone()).collect();
        let mut records: HashMap<String, _> = self
            .store
            .get_chunks(tenant, &ids)
            .await?
            .into_iter()
            .map(|r| (r.chunk_id.clone(), r))
            .collect();

        let results: Vec<RetrievalResult> = fused
            .into_iter()
            .filter(|c| c.score >= options.min_score)
            .filter_map(|c| {
                let record = records.remove(&c.chunk_id)?;
                Some(RetrievalResult {
                    chunk_id: record.chunk_id,
                    document_id: record.document_id,
                    position: record.position,
                    content: record.content,
                    context: None,
                    score: c.score,
                    tier: self.params.tiers.tier(c.score),
                    title: record.title,
                    category: record.category,
                    parent: record.metadata.parent,
                })
            })
            .collect();

        tracing::debug!(
            tenant = %tenant,
            class = %class,
            semantic = semantic.as_ref().map_or(0, Vec::len),
            lexical = lexical.as_ref().map_or(0, Vec::len),
            returned = results.len(),
            "hybrid retrieval complete"
        );

        Ok(RetrievalOutcome {
            results,
            class,
            candidates_considered,
            semantic_error,
            lexical_error,
        })
    }
}

fn split(
    result: EngineResult<Vec<ChunkCandidate>>,
) -> (Option<Vec<ChunkCandidate>>, Option<String>) {
    match result {
        Ok(list) => (Some(list), None),
        Err(e) => (None, Some(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cands(ids: &[&str]) -> Vec<ChunkCandidate> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| ChunkCandidate {
                chunk_id: id.to_string(),
                document_id: "d".to_string(),
                raw_score: 100.0 - i as f64,
            })
            .collect()
    }

    fn score_of(fused: &[FusedCandidate], id: &str) -> f64 {
        fused.iter().find(|c| c.chunk_id == id).unwrap().score
    }

    #[test]
    fn test_rrf_top_of_both_lists_scores_one() {
        let s = cands(&["a", "b"]);
        let l = cands(&["a", "c"]);
        let fused = rrf_fuse(Some(&s), Some(&l), FusionWeights::new(0.5, 0.5), 60.0);
        assert_eq!(fused[0].chunk_id, "a");
        assert!((fused[0].score - 1.0).abs() < 1e-12);
        assert_eq!(fused[0].semantic_rank, Some(1));
        assert_eq!(fused[0].lexical_rank, Some(1));
    }

    #[test]
    fn test_rrf_presence_in_both_lists_never_lowers_score() {
        let w = FusionWeights::new(0.6, 0.4);
        for r1 in 0..5 {
            for r2 in 0..5 {
                let mut s: Vec<String> = (0..5).map(|i| format!("s{}", i)).collect();
                let mut l: Vec<String> = (0..5).map(|i| format!("l{}", i)).collect();
                s[r1] = "x".to_string();
                l[r2] = "x".to_string();
                let s_only: Vec<&str> = s.iter().map(String::as_str).collect();
                let l_only: Vec<&str> = l.iter().map(String::as_str).collect();
                let s = cands(&s_only);
                let l = cands(&l_only);

                let both = score_of(&rrf_fuse(Some(&s), Some(&l), w, 60.0), "x");
                let mut l_without = l.clone();
                l_without[r2].chunk_id = "other".to_string();
                let sem_only = score_of(&rrf_fuse(Some(&s), Some(&l_without), w, 60.0), "x");
                let mut s_without = s.clone();
                s_without[r1].chunk_id = "other".to_string();
                let lex_only = score_of(&rrf_fuse(Some(&s_without), Some(&l), w, 60.0), "x");
                assert!(both >= sem_only && both >= lex_only);
            }
        }
    }

    #[test]
    fn test_rrf_ignores_raw_score_scale() {
        let mut s = cands(&["a", "b"]);
        s[0].raw_score = 0.9;
        s[1].raw_score = 0.1;
        let mut l = cands(&["b", "a"]);
        l[0].raw_score = 5000.0;
        l[1].raw_score = 1.0;
        let fused = rrf_fuse(Some(&s), Some(&l), FusionWeights::new(0.5, 0.5), 60.0);
        assert!((fused[0].score - fused[1].score).abs() < 1e-12);
        // Tie broken by id.
        assert_eq!(fused[0].chunk_id, "a");
    }

    #[test]
    fn test_rrf_single_list_still_normalized() {
        let l = cands(&["a", "b", "c"]);
        let fused = rrf_fuse(None, Some(&l), FusionWeights::new(0.7, 0.3), 60.0);
        assert!((fused[0].score - 1.0).abs() < 1e-12);
        assert!(fused.iter().all(|c| (0.0..=1.0).contains(&c.score)));
        assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_rrf_empty_inputs() {
        assert!(rrf_fuse(None, None, FusionWeights::new(0.5, 0.5), 60.0).is_empty());
        assert!(rrf_fuse(Some(&[][..]), Some(&[][..]), FusionWeights::new(0.5, 0.5), 60.0).is_empty());
    }

    #[test]
    fn test_rrf_duplicate_ids_count_once() {
        let l = cands(&["a", "a", "b"]);
        let fused = rrf_fuse(None, Some(&l), FusionWeights::new(0.5, 0.5), 60.0);
        assert_eq!(fused.len(), 2);
        assert!((score_of(&fused, "a") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_options_validation() {
        assert!(RetrieveOptions::default().validate().is_ok());
        let bad_k = RetrieveOptions {
            top_k: 0,
            ..Default::default()
        };
        assert!(matches!(
            bad_k.validate(),
            Err(ValidationError::InvalidTopK { got: 0, .. })
        ));
        let bad_score = RetrieveOptions {
            min_score: 1.5,
            ..Default::default()
        };
        assert_eq!(
            bad_score.validate(),
            Err(ValidationError::InvalidMinScore(1.5))
        );
    }

    #[test]
    fn test_params_validation() {
        let mut p = RetrievalParams::default();
        assert!(p.validate().is_ok());
        p.tiers = TierThresholds {
            high: 0.5,
            medium: 0.7,
        };
        assert!(p.validate().is_err());
    }
}
