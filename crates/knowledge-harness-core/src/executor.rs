//! Top-level query orchestration.
//!
//! [`RagQueryExecutor::execute`] runs, in order:
//!
//! | Stage | Component | On failure |
//! |-------|-----------|------------|
//! | classify | [`classify_query`] | cannot fail |
//! | retrieve | [`HybridRetriever`] | one search failing degrades; both failing is an error |
//! | rerank (optional) | [`RerankStage`] | fused order kept |
//! | expand (optional) | [`SmallToBigExpander`] | chunk text kept |
//! | assemble | [`assemble_context`] | cannot fail |
//!
//! Each stage is timed; `processingTimeMs` is the sum of the stage timings.
//! Tenant scoping is enforced by the store, not re-checked here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::classify::{classify_query, QueryClass};
use crate::error::{EngineResult, ValidationError};
use crate::expand::SmallToBigExpander;
use crate::models::{ParentSpan, RetrievalResult, TenantId};
use crate::rerank::{RerankOutcome, RerankStage};
use crate::search::{HybridRetriever, RetrieveOptions, MAX_TOP_K};
use crate::tenant::TenantSettingsSource;

fn default_top_k() -> usize {
    5
}

fn default_min_score() -> f64 {
    0.7
}

fn default_true() -> bool {
    true
}

/// Caller-facing query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_true")]
    pub use_hybrid_search: bool,
    #[serde(default, rename = "useSmall2Big")]
    pub use_small_to_big: bool,
    /// `None` defers to the tenant's default.
    #[serde(default)]
    pub use_reranking: Option<bool>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: default_top_k(),
            min_score: default_min_score(),
            use_hybrid_search: true,
            use_small_to_big: false,
            use_reranking: None,
        }
    }
}

/// How an optional stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Skipped,
    Applied,
    Degraded,
}

/// Elapsed milliseconds per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub classify_ms: u64,
    pub retrieve_ms: u64,
    pub rerank_ms: u64,
    pub expand_ms: u64,
    pub assemble_ms: u64,
}

impl StageTimings {
    pub fn total(&self) -> u64 {
        self.classify_ms + self.retrieve_ms + self.rerank_ms + self.expand_ms + self.assemble_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDiagnostics {
    pub classification: QueryClass,
    pub timings: StageTimings,
    /// One of the two searches failed and the other was used alone.
    pub search_degraded: bool,
    pub rerank: StageStatus,
    pub expand: StageStatus,
    pub context_truncated: bool,
    pub candidates_considered: usize,
}

/// Caller-facing query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub context: String,
    pub chunks: Vec<RetrievalResult>,
    pub total_chunks: usize,
    pub processing_time_ms: u64,
    pub diagnostics: QueryDiagnostics,
}

/// Output of [`assemble_context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledContext {
    pub text: String,
    /// Some results did not fit, or the first block was cut.
    pub truncated: bool,
}

/// Concatenate result texts in rank order, bounded by `max_chars`.
///
/// Each block is headed `[n] <title> (relevance: <tier>, score: <s>)`.
/// A parent window shared by several results is emitted once, at the rank
/// of its best result. Blocks are never split except when the first block
/// alone exceeds the budget.
pub fn assemble_context(results: &[RetrievalResult], max_chars: usize) -> AssembledContext {
    let mut text = String::new();
    let mut used = 0usize;
    let mut emitted: HashSet<(&str, ParentSpan)> = HashSet::new();
    let mut n = 0usize;

    for r in results {
        if r.context.is_some() {
            if let Some(span) = r.parent {
                if !emitted.insert((r.document_id.as_str(), span)) {
                    continue;
                }
            }
        }
        let block = format!(
            "[{}] {} (relevance: {}, score: {:.2})\n{}",
            n + 1,
            r.title,
            r.tier.as_str(),
            r.score,
            r.context_text()
        );
        let separator = if n == 0 { 0 } else { 2 };
        let len = block.chars().count();

        if used + separator + len > max_chars {
            if n == 0 {
                text = block.chars().take(max_chars).collect();
            }
            return AssembledContext {
                text,
                truncated: true,
            };
        }
        if n > 0 {
            text.push_str("\n\n");
        }
        text.push_str(&block);
        used += separator + len;
        n += 1;
    }

    AssembledContext {
        text,
        truncated: false,
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Composes retrieval, the optional stages, and context assembly.
pub struct RagQueryExecutor {
    retriever: Arc<HybridRetriever>,
    reranker: Option<RerankStage>,
    expander: SmallToBigExpander,
    settings: Arc<dyn TenantSettingsSource>,
}

impl RagQueryExecutor {
    pub fn new(
        retriever: Arc<HybridRetriever>,
        reranker: Option<RerankStage>,
        settings: Arc<dyn TenantSettingsSource>,
    ) -> Self {
        let expander = SmallToBigExpander::new(retriever.store().clone());
        Self {
            retriever,
            reranker,
            expander,
            settings,
        }
    }

    pub async fn execute(
        &self,
        tenant: &TenantId,
        request: &QueryRequest,
    ) -> EngineResult<QueryResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        let requested = RetrieveOptions {
            top_k: request.top_k,
            min_score: request.min_score,
            use_hybrid: request.use_hybrid_search,
        };
        requested.validate()?;

        let settings = self.settings.settings(tenant);
        let mut timings = StageTimings::default();

        let start = Instant::now();
        let class = classify_query(query);
        timings.classify_ms = elapsed_ms(start);

        let rerank_stage = match (request.use_reranking.unwrap_or(settings.rerank_by_default), &self.reranker) {
            (true, Some(stage)) => Some(stage),
            (true, None) => {
                tracing::debug!(tenant = %tenant, "reranking requested but no reranker configured");
                None
            }
            (false, _) => None,
        };

        // Reranking needs a wider pool and must see candidates below min_score.
        let options = match rerank_stage {
            Some(stage) => RetrieveOptions {
                top_k: requested.top_k.max(stage.max_candidates).min(MAX_TOP_K),
                min_score: 0.0,
                ..requested
            },
            None => requested,
        };

        let start = Instant::now();
        let outcome = self
            .retriever
            .retrieve_classified(tenant, query, class, options, &settings.fusion)
            .await?;
        timings.retrieve_ms = elapsed_ms(start);
        let search_degraded = outcome.degraded();
        let candidates_considered = outcome.candidates_considered;
        let mut results = outcome.results;

        let mut rerank = StageStatus::Skipped;
        if let Some(stage) = rerank_stage {
            let start = Instant::now();
            let (reranked, status) = stage.apply(query, results).await;
            rerank = match status {
                RerankOutcome::Applied => StageStatus::Applied,
                RerankOutcome::Degraded(_) => StageStatus::Degraded,
            };
            // Only the reranked head survives a successful rerank, so the
            // result count is capped at max_candidates whatever the outcome.
            results = reranked
                .into_iter()
                .filter(|r| r.score >= requested.min_score)
                .take(requested.top_k.min(stage.max_candidates))
                .collect();
            timings.rerank_ms = elapsed_ms(start);
        }

        let mut expand = StageStatus::Skipped;
        if request.use_small_to_big {
            let start = Instant::now();
            let report = self.expander.expand(tenant, &mut results).await;
            expand = if report.failed > 0 {
                StageStatus::Degraded
            } else {
                StageStatus::Applied
            };
            timings.expand_ms = elapsed_ms(start);
        }

        let start = Instant::now();
        let assembled = assemble_context(&results, settings.max_context_chars);
        timings.assemble_ms = elapsed_ms(start);

        let processing_time_ms = timings.total();
        tracing::info!(
            tenant = %tenant,
            class = %class,
            results = results.len(),
            rerank = ?rerank,
            expand = ?expand,
            processing_time_ms,
            "query executed"
        );

        Ok(QueryResponse {
            context: assembled.text,
            total_chunks: results.len(),
            chunks: results,
            processing_time_ms,
            diagnostics: QueryDiagnostics {
                classification: class,
                timings,
                search_degraded,
                rerank,
                expand,
                context_truncated: assembled.truncated,
                candidates_considered,
            },
        })
    }
}
