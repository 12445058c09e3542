//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] parses and validates the file; the typed
//! parameter structs of the engine are derived from it with the
//! `*_params` / `*_settings` helpers, so invalid values are rejected at
//! startup rather than mid-request.
//!
//! ```toml
//! [db]
//! path = "./data/kh.sqlite"
//!
//! [chunking]
//! chunk_size = 500
//! overlap_size = 50
//! preserve_sentences = true
//! parent_size = 1500
//!
//! [retrieval]
//! candidate_k = 50
//! max_context_chars = 8000
//!
//! [retrieval.fusion.exact_match]
//! semantic = 0.2
//! lexical = 0.8
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [tenants.acme]
//! max_context_chars = 4000
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use knowledge_harness_core::chunk::ChunkOptions;
use knowledge_harness_core::classify::FusionPolicy;
use knowledge_harness_core::gateway::GatewayConfig;
use knowledge_harness_core::ingest::IngestLimits;
use knowledge_harness_core::models::{TenantId, TierThresholds};
use knowledge_harness_core::search::{RetrievalParams, MAX_TOP_K};
use knowledge_harness_core::tenant::{StaticTenantSettings, TenantSettings};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tenants: HashMap<String, TenantOverride>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap_size")]
    pub overlap_size: usize,
    #[serde(default = "default_true")]
    pub preserve_sentences: bool,
    #[serde(default)]
    pub parent_size: Option<usize>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap_size: default_overlap_size(),
            preserve_sentences: true,
            parent_size: None,
        }
    }
}

impl ChunkingConfig {
    pub fn options(&self) -> ChunkOptions {
        ChunkOptions {
            chunk_size: self.chunk_size,
            overlap_size: self.overlap_size,
            preserve_sentences: self.preserve_sentences,
            parent_size: self.parent_size,
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_overlap_size() -> usize {
    50
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
    #[serde(default = "default_content_types")]
    pub allowed_content_types: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content_bytes(),
            allowed_content_types: default_content_types(),
        }
    }
}

fn default_max_content_bytes() -> usize {
    IngestLimits::default().max_content_bytes
}
fn default_content_types() -> Vec<String> {
    IngestLimits::default().allowed_content_types
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Candidates fetched from each of the two searches.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_min_score")]
    pub default_min_score: f64,
    #[serde(default = "default_tier_high")]
    pub tier_high: f64,
    #[serde(default = "default_tier_medium")]
    pub tier_medium: f64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
    #[serde(default)]
    pub rerank_by_default: bool,
    #[serde(default)]
    pub fusion: FusionPolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
            default_top_k: default_top_k(),
            default_min_score: default_min_score(),
            tier_high: default_tier_high(),
            tier_medium: default_tier_medium(),
            max_context_chars: default_max_context_chars(),
            rerank_candidates: default_rerank_candidates(),
            rerank_by_default: false,
            fusion: FusionPolicy::default(),
        }
    }
}

fn default_candidate_k() -> usize {
    50
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f64 {
    0.7
}
fn default_tier_high() -> f64 {
    0.85
}
fn default_tier_medium() -> f64 {
    0.70
}
fn default_max_context_chars() -> usize {
    8000
}
fn default_rerank_candidates() -> usize {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `hash`, `openai`, or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL; defaults depend on the provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key (openai only).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts made after an HTTP 429 before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_price")]
    pub price_per_1k_tokens: f64,
    /// Request field that carries `"document"` or `"query"`, for APIs with
    /// asymmetric embeddings (e.g. `input_type`). Omitted when unset.
    #[serde(default)]
    pub intent_field: Option<String>,
    /// Prepended to every text embedded for a query.
    #[serde(default)]
    pub query_prefix: Option<String>,
    /// Prepended to every text embedded for a document chunk.
    #[serde(default)]
    pub document_prefix: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            price_per_1k_tokens: default_price(),
            intent_field: None,
            query_prefix: None,
            document_prefix: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
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
fn default_timeout_secs() -> u64 {
    30
}
fn default_price() -> f64 {
    0.00002
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}
fn default_max_entries() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// `disabled` or `http`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_rerank_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            api_key_env: None,
            timeout_ms: default_rerank_timeout_ms(),
        }
    }
}

impl RerankConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_rerank_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Per-tenant overrides. Unset fields inherit the global values.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TenantOverride {
    #[serde(default)]
    pub max_context_chars: Option<usize>,
    #[serde(default)]
    pub rerank_by_default: Option<bool>,
    #[serde(default)]
    pub fusion: Option<FusionPolicy>,
    #[serde(default)]
    pub chunking: Option<ChunkingConfig>,
}

impl Config {
    pub fn retrieval_params(&self) -> RetrievalParams {
        RetrievalParams {
            candidate_k: self.retrieval.candidate_k,
            tiers: self.tiers(),
        }
    }

    pub fn tiers(&self) -> TierThresholds {
        TierThresholds {
            high: self.retrieval.tier_high,
            medium: self.retrieval.tier_medium,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            batch_size: self.embedding.batch_size,
            timeout: Duration::from_secs(self.embedding.timeout_secs),
            price_per_1k_tokens: self.embedding.price_per_1k_tokens,
        }
    }

    pub fn ingest_limits(&self) -> IngestLimits {
        IngestLimits {
            max_content_bytes: self.ingest.max_content_bytes,
            allowed_content_types: self.ingest.allowed_content_types.clone(),
        }
    }

    fn default_tenant_settings(&self) -> TenantSettings {
        TenantSettings {
            fusion: self.retrieval.fusion.clone(),
            max_context_chars: self.retrieval.max_context_chars,
            chunk_options: self.chunking.options(),
            rerank_by_default: self.retrieval.rerank_by_default,
        }
    }

    /// Build the tenant settings source, validating every snapshot.
    pub fn tenant_settings(&self) -> Result<StaticTenantSettings> {
        let base = self.default_tenant_settings();
        let mut source = StaticTenantSettings::new(base.clone())
            .context("invalid [retrieval] / [chunking] settings")?;
        for (id, over) in &self.tenants {
            let tenant = TenantId::new(id.as_str())
                .with_context(|| format!("invalid tenant id in [tenants.{}]", id))?;
            let settings = TenantSettings {
                fusion: over.fusion.clone().unwrap_or_else(|| base.fusion.clone()),
                max_context_chars: over.max_context_chars.unwrap_or(base.max_context_chars),
                chunk_options: over
                    .chunking
                    .as_ref()
                    .map(ChunkingConfig::options)
                    .unwrap_or(base.chunk_options),
                rerank_by_default: over.rerank_by_default.unwrap_or(base.rerank_by_default),
            };
            source = source
                .with_override(tenant, settings)
                .with_context(|| format!("invalid settings in [tenants.{}]", id))?;
        }
        Ok(source)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config
        .retrieval_params()
        .validate()
        .context("invalid [retrieval] settings")?;
    config.tenant_settings()?;

    let r = &config.retrieval;
    if r.default_top_k == 0 || r.default_top_k > MAX_TOP_K {
        bail!("retrieval.default_top_k must be within [1, {}]", MAX_TOP_K);
    }
    if !(0.0..=1.0).contains(&r.default_min_score) {
        bail!("retrieval.default_min_score must be in [0.0, 1.0]");
    }
    if r.rerank_candidates == 0 || r.rerank_candidates > MAX_TOP_K {
        bail!("retrieval.rerank_candidates must be within [1, {}]", MAX_TOP_K);
    }

    if config.cache.ttl_secs == 0 || config.cache.max_entries == 0 {
        bail!("cache.ttl_secs and cache.max_entries must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.timeout_secs == 0 {
        bail!("embedding.timeout_secs must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "hash" => {
            if config.embedding.dims == Some(0) {
                bail!("embedding.dims must be > 0");
            }
        }
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
            other
        ),
    }

    match config.rerank.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.rerank.url.is_none() {
                bail!("rerank.url must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/kh.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.retrieval.candidate_k, 50);
        assert_eq!(config.retrieval.fusion, FusionPolicy::default());
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_tenant_override_inherits_unset_fields() {
        let config = parse(
            r#"
[db]
path = "kh.sqlite"

[retrieval]
max_context_chars = 6000

[retrieval.fusion.exact_match]
semantic = 0.1
lexical = 0.9

[tenants.acme]
max_context_chars = 1200
"#,
        )
        .unwrap();
        use knowledge_harness_core::classify::{FusionWeights, QueryClass};
        use knowledge_harness_core::tenant::TenantSettingsSource;
        let source = config.tenant_settings().unwrap();

        let acme = source.settings(&TenantId::new("acme").unwrap());
        assert_eq!(acme.max_context_chars, 1200);
        assert_eq!(
            acme.fusion.weights_for(QueryClass::ExactMatch),
            FusionWeights::new(0.1, 0.9)
        );

        let other = source.settings(&TenantId::new("other").unwrap());
        assert_eq!(other.max_context_chars, 6000);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(parse("[db]\npath = \"x\"\n[chunking]\nchunk_size = 50\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[rerank]\nprovider = \"http\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\ntier_high = 0.5\n").is_err());
        assert!(parse(
            "[db]\npath = \"x\"\n[tenants.acme.fusion.technical]\nsemantic = 0.0\nlexical = 0.0\n"
        )
        .is_err());
    }
}
