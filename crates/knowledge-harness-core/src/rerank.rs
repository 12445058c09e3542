//! Optional precision pass over the top fused candidates.
//!
//! A [`Reranker`] scores `(query, passage)` pairs, typically through a
//! cross-encoder service. [`RerankStage`] bounds the candidate set, enforces
//! a timeout, and degrades to the unreranked input on any failure: reranking
//! improves ordering but is never required for a correct answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::models::{RetrievalResult, TierThresholds};

/// A relevance scorer for query/passage pairs.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// One score per passage, in input order. Higher is more relevant.
    /// Scores may be probabilities in `[0, 1]` or raw logits.
    async fn score(&self, query: &str, passages: &[String]) -> EngineResult<Vec<f64>>;
}

/// Reranker used when none is configured. Always fails.
pub struct DisabledReranker;

#[async_trait]
impl Reranker for DisabledReranker {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn score(&self, _query: &str, _passages: &[String]) -> EngineResult<Vec<f64>> {
        Err(EngineError::external("rerank", "reranker is disabled"))
    }
}

/// What happened in the rerank stage.
#[derive(Debug, Clone, PartialEq)]
pub enum RerankOutcome {
    /// Candidates reordered with new scores.
    Applied,
    /// The reranker failed or timed out; candidates returned unchanged.
    Degraded(String),
}

#[derive(Clone)]
pub struct RerankStage {
    reranker: Arc<dyn Reranker>,
    /// Candidates sent to the reranker; the rest keep their fused order.
    pub max_candidates: usize,
    pub timeout: Duration,
    pub tiers: TierThresholds,
}

impl RerankStage {
    pub fn new(reranker: Arc<dyn Reranker>, max_candidates: usize, timeout: Duration) -> Self {
        Self {
            reranker,
            max_candidates: max_candidates.max(1),
            timeout,
            tiers: TierThresholds::default(),
        }
    }

    pub fn with_tiers(mut self, tiers: TierThresholds) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn reranker_name(&self) -> &str {
        self.reranker.name()
    }

    /// Rerank the head of `candidates`.
    ///
    /// On success the head is reordered by the raw reranker score (ties keep
    /// fused order), then its scores are normalized into `[0, 1]` by
    /// [`normalize_scores`] and its tiers recomputed. Candidates beyond
    /// `max_candidates` are dropped, since their fused scores are not
    /// comparable to reranker scores.
    pub async fn apply(
        &self,
        query: &str,
        candidates: Vec<RetrievalResult>,
    ) -> (Vec<RetrievalResult>, RerankOutcome) {
        if candidates.is_empty() {
            return (candidates, RerankOutcome::Applied);
        }
        let take = candidates.len().min(self.max_candidates);
        let passages: Vec<String> = candidates[..take]
            .iter()
            .map(|c| c.content.clone())
            .collect();

        let scores =
            match tokio::time::timeout(self.timeout, self.reranker.score(query, &passages)).await {
                Ok(Ok(scores)) if scores.len() == take => scores,
                Ok(Ok(scores)) => {
                    return self.degrade(
                        candidates,
                        format!("expected {} scores, got {}", take, scores.len()),
                    )
                }
                Ok(Err(e)) => return self.degrade(candidates, e.to_string()),
                Err(_) => {
                    return self.degrade(
                        candidates,
                        format!("timed out after {}ms", self.timeout.as_millis()),
                    )
                }
            };

        let normalized = normalize_scores(&scores);
        let mut head: Vec<(f64, f64, RetrievalResult)> = candidates
            .into_iter()
            .take(take)
            .zip(scores.iter().map(|s| if s.is_nan() { f64::NEG_INFINITY } else { *s }))
            .zip(normalized)
            .map(|((c, raw), score)| (raw, score, c))
            .collect();
        // Stable sort: equal raw scores keep fused order.
        head.sort_by(|a, b| b.0.total_cmp(&a.0));

        let reranked = head
            .into_iter()
            .map(|(_, score, mut c)| {
                c.score = score;
                c.tier = self.tiers.tier(score);
                c
            })
            .collect();
        tracing::debug!(reranker = self.reranker.name(), candidates = take, "rerank applied");
        (reranked, RerankOutcome::Applied)
    }

    fn degrade(
        &self,
        candidates: Vec<RetrievalResult>,
        reason: String,
    ) -> (Vec<RetrievalResult>, RerankOutcome) {
        tracing::warn!(
            reranker = self.reranker.name(),
            error = %reason,
            "rerank failed, keeping fused order"
        );
        (candidates, RerankOutcome::Degraded(reason))
    }
}

/// Map reranker scores into `[0, 1]` without changing their order.
///
/// A batch already inside `[0, 1]` is kept as is. Otherwise the scores are
/// treated as logits and passed through the logistic function. NaN maps
/// to 0.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let in_unit_range = scores
        .iter()
        .filter(|s| !s.is_nan())
        .all(|s| (0.0..=1.0).contains(s));
    scores
        .iter()
        .map(|&s| match s {
            s if s.is_nan() => 0.0,
            s if in_unit_range => s,
            s => 1.0 / (1.0 + (-s).exp()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelevanceTier;

    struct LengthReranker;

    #[async_trait]
    impl Reranker for LengthReranker {
        fn name(&self) -> &str {
            "length"
        }

        async fn score(&self, _query: &str, passages: &[String]) -> EngineResult<Vec<f64>> {
            Ok(passages.iter().map(|p| p.len() as f64 / 20.0).collect())
        }
    }

    /// Returns fixed scores, truncated to the passage count.
    struct FixedReranker(Vec<f64>);

    #[async_trait]
    impl Reranker for FixedReranker {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn score(&self, _query: &str, passages: &[String]) -> EngineResult<Vec<f64>> {
            Ok(self.0.iter().copied().take(passages.len()).collect())
        }
    }

    struct SlowReranker;

    #[async_trait]
    impl Reranker for SlowReranker {
        fn name(&self) -> &str {
            "slow"
        }

        async fn score(&self, _query: &str, passages: &[String]) -> EngineResult<Vec<f64>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![1.0; passages.len()])
        }
    }

    fn result(id: &str, content: &str, score: f64) -> RetrievalResult {
        RetrievalResult {
            chunk_id: id.to_string(),
            document_id: "d".to_string(),
            position: 0,
            content: content.to_string(),
            context: None,
            score,
            tier: TierThresholds::default().tier(score),
            title: "t".to_string(),
            category: None,
            parent: None,
        }
    }

    fn ids(results: &[RetrievalResult]) -> Vec<&str> {
        results.iter().map(|r| r.chunk_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_rerank_reorders_by_probability_scores() {
        let stage = RerankStage::new(Arc::new(LengthReranker), 10, Duration::from_secs(1));
        let input = vec![
            result("a", "xxxx", 0.9),
            result("b", "xxxxxxxxxxxxxxxxxxx", 0.8),
            result("c", "xxxxxxxxxx", 0.7),
        ];
        let (out, outcome) = stage.apply("q", input).await;
        assert_eq!(outcome, RerankOutcome::Applied);
        assert_eq!(ids(&out), vec!["b", "c", "a"]);
        assert!((out[0].score - 0.95).abs() < 1e-12);
        assert_eq!(out[0].tier, RelevanceTier::High);
        assert!((out[2].score - 0.2).abs() < 1e-12);
        assert_eq!(out[2].tier, RelevanceTier::Low);
    }

    #[tokio::test]
    async fn test_rerank_orders_logits_before_normalizing() {
        let stage = RerankStage::new(
            Arc::new(FixedReranker(vec![2.0, 5.0, 3.0])),
            10,
            Duration::from_secs(1),
        );
        let input = vec![
            result("a", "x", 0.9),
            result("b", "y", 0.8),
            result("c", "z", 0.7),
        ];
        let (out, outcome) = stage.apply("q", input).await;
        assert_eq!(outcome, RerankOutcome::Applied);
        assert_eq!(ids(&out), vec!["b", "c", "a"]);
        assert!(out.windows(2).all(|w| w[0].score > w[1].score));
        assert!(out.iter().all(|r| r.score > 0.0 && r.score < 1.0));

        let stage = RerankStage::new(
            Arc::new(FixedReranker(vec![-4.0, -1.0])),
            10,
            Duration::from_secs(1),
        );
        let (out, _) = stage
            .apply("q", vec![result("a", "x", 0.9), result("b", "y", 0.8)])
            .await;
        assert_eq!(ids(&out), vec!["b", "a"]);
        assert!(out[1].score > 0.0);
    }

    #[tokio::test]
    async fn test_rerank_failure_keeps_input() {
        let stage = RerankStage::new(Arc::new(DisabledReranker), 10, Duration::from_secs(1));
        let input = vec![result("a", "x", 0.9), result("b", "y", 0.8)];
        let (out, outcome) = stage.apply("q", input.clone()).await;
        assert!(matches!(outcome, RerankOutcome::Degraded(_)));
        assert_eq!(out, input);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerank_timeout_degrades() {
        let stage = RerankStage::new(Arc::new(SlowReranker), 10, Duration::from_millis(200));
        let input = vec![result("a", "x", 0.9)];
        let (out, outcome) = stage.apply("q", input.clone()).await;
        match outcome {
            RerankOutcome::Degraded(reason) => assert!(reason.contains("timed out")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_rerank_bounds_candidate_set() {
        let stage = RerankStage::new(Arc::new(LengthReranker), 2, Duration::from_secs(1));
        let input = vec![
            result("a", "xx", 0.9),
            result("b", "xxxxxxxx", 0.8),
            result("c", "xxxxxxxxxxxxxxxx", 0.7),
        ];
        let (out, _) = stage.apply("q", input).await;
        assert_eq!(ids(&out), vec!["b", "a"]);
    }

    #[test]
    fn test_normalize_scores() {
        assert_eq!(normalize_scores(&[0.42, 1.0, 0.0]), vec![0.42, 1.0, 0.0]);
        assert_eq!(normalize_scores(&[f64::NAN, 0.5]), vec![0.0, 0.5]);
        let logits = normalize_scores(&[0.0, 7.0, -3.0]);
        assert!((logits[0] - 0.5).abs() < 1e-12);
        assert!(logits[1] > 0.99 && logits[1] < 1.0);
        assert!(logits[2] > 0.0 && logits[2] < 0.1);
    }
}
