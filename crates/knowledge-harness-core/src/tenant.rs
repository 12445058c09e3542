//! Per-tenant settings lookup.
//!
//! The engine never reads global configuration. Each request asks a
//! [`TenantSettingsSource`] for an immutable [`TenantSettings`] snapshot and
//! uses it for the whole request, so concurrent configuration changes can
//! never be observed half-applied.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chunk::ChunkOptions;
use crate::classify::FusionPolicy;
use crate::error::EngineResult;
use crate::models::TenantId;

/// Default budget for assembled context, in characters.
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 8000;

#[derive(Debug, Clone, PartialEq)]
pub struct TenantSettings {
    pub fusion: FusionPolicy,
    pub max_context_chars: usize,
    /// Chunk options used when an ingestion request does not supply its own.
    pub chunk_options: ChunkOptions,
    /// Applied when a query does not say whether to rerank.
    pub rerank_by_default: bool,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            fusion: FusionPolicy::default(),
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            chunk_options: ChunkOptions::default(),
            rerank_by_default: false,
        }
    }
}

impl TenantSettings {
    pub fn validate(&self) -> EngineResult<()> {
        self.fusion.validate()?;
        self.chunk_options.validate()?;
        if self.max_context_chars == 0 {
            return Err(crate::error::EngineError::Configuration(
                "max_context_chars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolves the settings snapshot for a tenant.
pub trait TenantSettingsSource: Send + Sync {
    fn settings(&self, tenant: &TenantId) -> Arc<TenantSettings>;
}

/// Fixed settings: a default plus optional per-tenant overrides.
pub struct StaticTenantSettings {
    default: Arc<TenantSettings>,
    overrides: HashMap<TenantId, Arc<TenantSettings>>,
}

impl StaticTenantSettings {
    pub fn new(default: TenantSettings) -> EngineResult<Self> {
        default.validate()?;
        Ok(Self {
            default: Arc::new(default),
            overrides: HashMap::new(),
        })
    }

    pub fn with_override(mut self, tenant: TenantId, settings: TenantSettings) -> EngineResult<Self> {
        settings.validate()?;
        self.overrides.insert(tenant, Arc::new(settings));
        Ok(self)
    }
}

impl TenantSettingsSource for StaticTenantSettings {
    fn settings(&self, tenant: &TenantId) -> Arc<TenantSettings> {
        self.overrides
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
