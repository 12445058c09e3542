//! HTTP cross-encoder reranker.
//!
//! Speaks the common rerank API shape used by hosted and self-hosted
//! cross-encoders:
//!
//! ```text
//! POST {url}
//! {"query": "...", "documents": ["...", ...], "model": "..."}
//!
//! {"results": [{"index": 0, "relevance_score": 0.93}, ...]}
//! ```
//!
//! Results may come back in any order; they are mapped back to input order
//! by `index`. Timeouts are enforced by the rerank stage, not here.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use knowledge_harness_core::rerank::Reranker;
use knowledge_harness_core::{EngineError, EngineResult};

use crate::config::RerankConfig;

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankItem>,
}

#[derive(Deserialize)]
struct RerankItem {
    index: usize,
    relevance_score: f64,
}

pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    model: Option<String>,
    api_key: Option<String>,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let Some(url) = config.url.clone() else {
            bail!("rerank.url required for http reranker");
        };
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url,
            model: config.model.clone(),
            api_key,
        })
    }
}

fn error(message: impl std::fmt::Display) -> EngineError {
    EngineError::external("rerank", message)
}

/// Map index-tagged results back to input order. Every input must be scored
/// exactly once.
fn scores_in_order(items: Vec<RerankItem>, expected: usize) -> EngineResult<Vec<f64>> {
    let mut scores: Vec<Option<f64>> = vec![None; expected];
    for item in items {
        let Some(slot) = scores.get_mut(item.index) else {
            return Err(error(format!("index {} out of range", item.index)));
        };
        if slot.is_some() {
            return Err(error(format!("duplicate index {}", item.index)));
        }
        *slot = Some(item.relevance_score);
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| error(format!("no score for passage {}", i))))
        .collect()
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        self.model.as_deref().unwrap_or("http")
    }

    async fn score(&self, query: &str, passages: &[String]) -> EngineResult<Vec<f64>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(&self.url).json(&RerankRequest {
            query,
            documents: passages,
            model: self.model.as_deref(),
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(error)?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(error(format!("API error {}: {}", status, body_text)));
        }

        let parsed: RerankResponse = response.json().await.map_err(error)?;
        scores_in_order(parsed.results, passages.len())
    }
}

/// Build the reranker named by `rerank.provider`, or `None` when disabled.
pub fn create_reranker(config: &RerankConfig) -> Result<Option<Arc<dyn Reranker>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Arc::new(HttpReranker::new(config)?))),
        other => bail!("Unknown rerank provider: {}", other),
    }
}
