//! Wiring of the core pipeline from configuration.
//!
//! [`Engine`] owns the shared handles (store, gateway, ingestor, executor)
//! used by both the CLI commands and the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use knowledge_harness_core::cache::EmbeddingCache;
use knowledge_harness_core::executor::{QueryRequest, RagQueryExecutor};
use knowledge_harness_core::gateway::EmbeddingGateway;
use knowledge_harness_core::ingest::DocumentIngestor;
use knowledge_harness_core::rerank::RerankStage;
use knowledge_harness_core::search::HybridRetriever;
use knowledge_harness_core::store::ChunkStore;

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::migrate::run_migrations;
use crate::rerank::create_reranker;
use crate::sqlite_store::SqliteStore;

/// Query parameters applied when a caller leaves them out.
#[derive(Debug, Clone, Copy)]
pub struct QueryDefaults {
    pub top_k: usize,
    pub min_score: f64,
}

#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn ChunkStore>,
    pub gateway: Arc<EmbeddingGateway>,
    pub ingestor: Arc<DocumentIngestor>,
    pub executor: Arc<RagQueryExecutor>,
    pub defaults: QueryDefaults,
}

impl Engine {
    /// Open the configured SQLite database, apply migrations, and build the
    /// pipeline on top of it.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        run_migrations(&pool)
            .await
            .context("Failed to apply database migrations")?;
        Self::build(config, Arc::new(SqliteStore::new(pool)))
    }

    /// Build the pipeline over an arbitrary store.
    pub fn build(config: &Config, store: Arc<dyn ChunkStore>) -> Result<Self> {
        let provider = create_provider(&config.embedding)?;
        let cache = Arc::new(EmbeddingCache::new(
            Duration::from_secs(config.cache.ttl_secs),
            config.cache.max_entries,
        ));
        let gateway = Arc::new(EmbeddingGateway::new(
            provider,
            cache,
            config.gateway_config(),
        ));

        let settings = Arc::new(config.tenant_settings()?);
        let retriever = Arc::new(
            HybridRetriever::new(store.clone(), gateway.clone(), config.retrieval_params())
                .context("invalid retrieval settings")?,
        );

        let rerank_stage = create_reranker(&config.rerank)?.map(|reranker| {
            RerankStage::new(
                reranker,
                config.retrieval.rerank_candidates,
                Duration::from_millis(config.rerank.timeout_ms),
            )
            .with_tiers(config.tiers())
        });

        let executor = Arc::new(RagQueryExecutor::new(
            retriever,
            rerank_stage,
            settings.clone(),
        ));
        let ingestor = Arc::new(DocumentIngestor::new(
            gateway.clone(),
            store.clone(),
            settings,
            config.ingest_limits(),
        ));

        tracing::debug!(
            embedding = gateway.model_name(),
            dims = gateway.dims(),
            rerank = config.rerank.provider.as_str(),
            "engine ready"
        );

        Ok(Self {
            store,
            gateway,
            ingestor,
            executor,
            defaults: QueryDefaults {
                top_k: config.retrieval.default_top_k,
                min_score: config.retrieval.default_min_score,
            },
        })
    }

    /// A query request carrying the configured defaults.
    pub fn query_request(&self, query: impl Into<String>) -> QueryRequest {
        QueryRequest {
            top_k: self.defaults.top_k,
            min_score: self.defaults.min_score,
            ..QueryRequest::new(query)
        }
    }
}
