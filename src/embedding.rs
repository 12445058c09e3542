//! HTTP embedding providers.
//!
//! Implements the core [`EmbeddingProvider`] trait for remote APIs:
//! - **OpenAI**: `POST {url}/v1/embeddings` with a bearer key.
//! - **Ollama**: `POST {url}/api/embed` on a local instance.
//!
//! Both speak the same request shape (`{"model", "input"}`) and differ only
//! in endpoint, auth, and response layout, so they share one client.
//!
//! The embedding intent (document or query) reaches the upstream through
//! `embedding.intent_field` (an extra request field such as `input_type`)
//! and the per-intent text prefixes, so asymmetric models see which side of
//! the search they are embedding.
//!
//! # Retry Strategy
//!
//! Only HTTP 429 is retried, with exponential backoff (1s, 2s, 4s, ...
//! capped at 32s) up to `embedding.max_retries` times. Any other failure
//! surfaces immediately; the gateway's own timeout bounds the total wait.
//!
//! Use [`create_provider`] to build the provider named in the config.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use knowledge_harness_core::embedding::{
    DisabledProvider, EmbedIntent, EmbeddingProvider, HashEmbeddingProvider,
};
use knowledge_harness_core::{EngineError, EngineResult};

use crate::config::EmbeddingConfig;

const DEFAULT_HASH_DIMS: usize = 256;
const MAX_BACKOFF_EXPONENT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    OpenAi,
    Ollama,
}

impl ApiFlavor {
    fn default_url(&self) -> &'static str {
        match self {
            ApiFlavor::OpenAi => "https://api.openai.com",
            ApiFlavor::Ollama => "http://localhost:11434",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            ApiFlavor::OpenAi => "/v1/embeddings",
            ApiFlavor::Ollama => "/api/embed",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ApiFlavor::OpenAi => "OpenAI",
            ApiFlavor::Ollama => "Ollama",
        }
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiItem>,
}

#[derive(Deserialize)]
struct OpenAiItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedding provider backed by an HTTP API.
pub struct HttpEmbeddingProvider {
    flavor: ApiFlavor,
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
    max_retries: u32,
    backoff_base: Duration,
    intent_field: Option<String>,
    query_prefix: Option<String>,
    document_prefix: Option<String>,
}

impl HttpEmbeddingProvider {
    pub fn new(flavor: ApiFlavor, config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .with_context(|| format!("embedding.model required for {} provider", flavor.label()))?;
        let dims = config
            .dims
            .with_context(|| format!("embedding.dims required for {} provider", flavor.label()))?;

        let api_key = match flavor {
            ApiFlavor::OpenAi => Some(std::env::var(&config.api_key_env).map_err(|_| {
                anyhow::anyhow!("{} environment variable not set", config.api_key_env)
            })?),
            ApiFlavor::Ollama => None,
        };

        let base = config
            .url
            .as_deref()
            .unwrap_or(flavor.default_url())
            .trim_end_matches('/');

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            flavor,
            client,
            endpoint: format!("{}{}", base, flavor.path()),
            model,
            dims,
            api_key,
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(1),
            intent_field: config.intent_field.clone(),
            query_prefix: config.query_prefix.clone(),
            document_prefix: config.document_prefix.clone(),
        })
    }

    /// Override the first backoff delay; later delays double from it.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn error(&self, message: impl std::fmt::Display) -> EngineError {
        EngineError::external("embedding", format!("{}: {}", self.flavor.label(), message))
    }

    fn request_body(&self, texts: &[String], intent: EmbedIntent) -> serde_json::Value {
        let prefix = match intent {
            EmbedIntent::Query => self.query_prefix.as_deref(),
            EmbedIntent::Document => self.document_prefix.as_deref(),
        };
        let input: Vec<String> = match prefix {
            Some(p) => texts.iter().map(|t| format!("{}{}", p, t)).collect(),
            None => texts.to_vec(),
        };

        let mut body = serde_json::json!({
            "model": self.model,
            "input": input,
        });
        if let Some(field) = &self.intent_field {
            body[field.as_str()] = serde_json::Value::from(intent.as_str());
        }
        body
    }

    async fn post(
        &self,
        texts: &[String],
        intent: EmbedIntent,
    ) -> EngineResult<reqwest::Response> {
        let body = self.request_body(texts, intent);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(MAX_BACKOFF_EXPONENT));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request.send().await.map_err(|e| self.error(e))?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                tracing::warn!(
                    provider = self.flavor.label(),
                    attempt = attempt + 1,
                    "embedding API rate limited"
                );
                continue;
            }

            let body_text = response.text().await.unwrap_or_default();
            return Err(self.error(format!("API error {}: {}", status, body_text)));
        }

        Err(self.error(format!(
            "rate limited after {} retries",
            self.max_retries
        )))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String], intent: EmbedIntent) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self.post(texts, intent).await?;
        match self.flavor {
            ApiFlavor::OpenAi => {
                let parsed: OpenAiResponse = response.json().await.map_err(|e| self.error(e))?;
                let mut items = parsed.data;
                if items.iter().all(|i| i.index.is_some()) {
                    items.sort_by_key(|i| i.index);
                }
                Ok(items.into_iter().map(|i| i.embedding).collect())
            }
            ApiFlavor::Ollama => {
                let parsed: OllamaResponse = response.json().await.map_err(|e| self.error(e))?;
                Ok(parsed.embeddings)
            }
        }
    }
}

/// Create the [`EmbeddingProvider`] named by `embedding.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"hash"` | [`HashEmbeddingProvider`] (offline, deterministic) |
/// | `"openai"` | [`HttpEmbeddingProvider`] with [`ApiFlavor::OpenAi`] |
/// | `"ollama"` | [`HttpEmbeddingProvider`] with [`ApiFlavor::Ollama`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "hash" => Ok(Arc::new(HashEmbeddingProvider::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(HttpEmbeddingProvider::new(ApiFlavor::OpenAi, config)?)),
        "ollama" => Ok(Arc::new(HttpEmbeddingProvider::new(ApiFlavor::Ollama, config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(url: &str, max_retries: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "ollama".to_string(),
            model: Some("nomic-embed-text".to_string()),
            dims: Some(2),
            url: Some(url.to_string()),
            max_retries,
            timeout_secs: 5,
            ..EmbeddingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_ollama_embeds_in_order() {
        let app = Router::new().route(
            "/api/embed",
            post(|Json(body): Json<serde_json::Value>| async move {
                let n = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
                let embeddings: Vec<Vec<f32>> = (0..n).map(|i| vec![i as f32, 1.0]).collect();
                Json(serde_json::json!({ "embeddings": embeddings }))
            }),
        );
        let url = spawn(app).await;
        let provider = HttpEmbeddingProvider::new(ApiFlavor::Ollama, &config(&url, 0)).unwrap();

        let out = provider
            .embed(&["a".to_string(), "b".to_string()], EmbedIntent::Document)
            .await
            .unwrap();
        assert_eq!(out, vec![vec![0.0, 1.0], vec![1.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_retries_only_on_rate_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/api/embed",
                post(|State(calls): State<Arc<AtomicUsize>>| async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(StatusCode::TOO_MANY_REQUESTS);
                    }
                    Ok(Json(serde_json::json!({ "embeddings": [[1.0, 0.0]] })))
                }),
            )
            .with_state(calls.clone());
        let url = spawn(app).await;
        let provider = HttpEmbeddingProvider::new(ApiFlavor::Ollama, &config(&url, 2))
            .unwrap()
            .with_backoff_base(Duration::from_millis(5));

        let out = provider.embed(&["a".to_string()], EmbedIntent::Query).await.unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0]]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_error_fails_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/api/embed",
                post(|State(calls): State<Arc<AtomicUsize>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }),
            )
            .with_state(calls.clone());
        let url = spawn(app).await;
        let provider = HttpEmbeddingProvider::new(ApiFlavor::Ollama, &config(&url, 3))
            .unwrap()
            .with_backoff_base(Duration::from_millis(5));

        let err = provider.embed(&["a".to_string()], EmbedIntent::Query).await.unwrap_err();
        assert!(matches!(err, EngineError::ExternalService { service: "embedding", .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_body_carries_intent() {
        let config = EmbeddingConfig {
            intent_field: Some("input_type".to_string()),
            query_prefix: Some("search_query: ".to_string()),
            document_prefix: Some("search_document: ".to_string()),
            ..config("http://localhost:1", 0)
        };
        let provider = HttpEmbeddingProvider::new(ApiFlavor::Ollama, &config).unwrap();
        let texts = vec!["refund policy".to_string()];

        let query = provider.request_body(&texts, EmbedIntent::Query);
        let document = provider.request_body(&texts, EmbedIntent::Document);
        assert_ne!(query, document);
        assert_eq!(query["input_type"], "query");
        assert_eq!(query["input"][0], "search_query: refund policy");
        assert_eq!(document["input_type"], "document");
        assert_eq!(document["input"][0], "search_document: refund policy");
    }

    #[test]
    fn test_request_body_without_intent_settings() {
        let provider =
            HttpEmbeddingProvider::new(ApiFlavor::Ollama, &config("http://localhost:1", 0)).unwrap();
        let texts = vec!["a".to_string()];
        let body = provider.request_body(&texts, EmbedIntent::Query);
        assert_eq!(body, serde_json::json!({ "model": "nomic-embed-text", "input": ["a"] }));
    }

    #[tokio::test]
    async fn test_intent_field_reaches_upstream() {
        let app = Router::new().route(
            "/api/embed",
            post(|Json(body): Json<serde_json::Value>| async move {
                let x = if body["input_type"] == "query" { 1.0 } else { 0.0 };
                Json(serde_json::json!({ "embeddings": [[x, 1.0]] }))
            }),
        );
        let url = spawn(app).await;
        let config = EmbeddingConfig {
            intent_field: Some("input_type".to_string()),
            ..config(&url, 0)
        };
        let provider = HttpEmbeddingProvider::new(ApiFlavor::Ollama, &config).unwrap();
        let texts = vec!["a".to_string()];

        let q = provider.embed(&texts, EmbedIntent::Query).await.unwrap();
        let d = provider.embed(&texts, EmbedIntent::Document).await.unwrap();
        assert_eq!(q, vec![vec![1.0, 1.0]]);
        assert_eq!(d, vec![vec![0.0, 1.0]]);
    }

    #[test]
    fn test_create_provider() {
        let hash = EmbeddingConfig {
            provider: "hash".to_string(),
            dims: Some(32),
            ..EmbeddingConfig::default()
        };
        assert_eq!(create_provider(&hash).unwrap().dims(), 32);
        assert_eq!(
            create_provider(&EmbeddingConfig::default()).unwrap().model_name(),
            "disabled"
        );

        let unknown = EmbeddingConfig {
            provider: "magic".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&unknown).is_err());
    }
}
