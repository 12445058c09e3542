//! Write-side orchestration: validate, chunk, embed, persist.
//!
//! Every write follows the same pipeline:
//!
//! 1. Validate title, content size and content type, and chunk options.
//! 2. Chunk the content ([`chunk_text`]).
//! 3. Embed every chunk in one gateway call with intent `document`.
//! 4. Check that the vector count equals the chunk count.
//! 5. Persist document and chunks in one atomic store call.
//!
//! Nothing is written before step 5, so a failure in steps 1-4 leaves no
//! trace in the store, and the store itself guarantees step 5 is
//! all-or-nothing.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::chunk::{chunk_text, ChunkOptions};
use crate::embedding::{EmbedIntent, UsageEstimate};
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::gateway::EmbeddingGateway;
use crate::models::{Chunk, Document, TenantId, TextChunk};
use crate::store::ChunkStore;
use crate::tenant::TenantSettingsSource;

/// Content type assumed when a request does not name one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Caller-facing ingestion parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Overrides the tenant's default chunk options.
    #[serde(default)]
    pub chunk_options: Option<ChunkOptions>,
}

/// Partial update. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub chunk_options: Option<ChunkOptions>,
}

/// Input limits checked before any work happens.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestLimits {
    pub max_content_bytes: usize,
    pub allowed_content_types: Vec<String>,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_content_bytes: 5 * 1024 * 1024,
            allowed_content_types: vec![
                "text/plain".to_string(),
                "text/markdown".to_string(),
                "text/csv".to_string(),
            ],
        }
    }
}

/// Processing stats returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub document_id: String,
    pub title: String,
    pub chunks_created: usize,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    pub processing_time_ms: u64,
}

/// A persisted document and the stats of the write that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    pub document: Document,
    pub report: IngestReport,
}

pub struct DocumentIngestor {
    gateway: Arc<EmbeddingGateway>,
    store: Arc<dyn ChunkStore>,
    settings: Arc<dyn TenantSettingsSource>,
    limits: IngestLimits,
}

impl DocumentIngestor {
    pub fn new(
        gateway: Arc<EmbeddingGateway>,
        store: Arc<dyn ChunkStore>,
        settings: Arc<dyn TenantSettingsSource>,
        limits: IngestLimits,
    ) -> Self {
        Self {
            gateway,
            store,
            settings,
            limits,
        }
    }

    /// Create a new document.
    pub async fn ingest(&self, tenant: &TenantId, request: IngestRequest) -> EngineResult<Ingested> {
        let started = Instant::now();
        let content_type = self.validate(
            &request.title,
            &request.content,
            request.content_type.as_deref(),
        )?;
        let options = self.resolve_options(tenant, request.chunk_options)?;

        let now = chrono::Utc::now().timestamp();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            title: request.title.trim().to_string(),
            content: request.content,
            category: request.category,
            content_type,
            metadata: request.metadata,
            chunk_options: Some(options),
            created_at: now,
            updated_at: now,
        };

        let (chunks, usage) = self.prepare_chunks(&document, &options).await?;
        self.store
            .insert_document(tenant, &document, &chunks)
            .await
            .inspect_err(|e| tracing::error!(tenant = %tenant, error = %e, "document insert failed"))?;

        let report = self.report(&document, chunks.len(), usage, started);
        tracing::info!(
            tenant = %tenant,
            document_id = %document.id,
            chunks = chunks.len(),
            tokens = report.total_tokens,
            "document ingested"
        );
        Ok(Ingested { document, report })
    }

    /// Update a document. The chunk set is rebuilt and replaced atomically,
    /// using the options the document was last chunked with unless the
    /// request supplies new ones.
    pub async fn update(
        &self,
        tenant: &TenantId,
        document_id: &str,
        request: UpdateRequest,
    ) -> EngineResult<Ingested> {
        let started = Instant::now();
        let existing = self
            .store
            .get_document(tenant, document_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("document {}", document_id)))?;

        let title = request.title.unwrap_or(existing.title);
        let content = request.content.unwrap_or(existing.content);
        let content_type = request.content_type.unwrap_or(existing.content_type);
        let content_type = self.validate(&title, &content, Some(&content_type))?;
        let options =
            self.resolve_options(tenant, request.chunk_options.or(existing.chunk_options))?;

        let document = Document {
            id: existing.id,
            tenant_id: tenant.clone(),
            title: title.trim().to_string(),
            content,
            category: request.category.or(existing.category),
            content_type,
            metadata: request.metadata.unwrap_or(existing.metadata),
            chunk_options: Some(options),
            created_at: existing.created_at,
            updated_at: chrono::Utc::now().timestamp(),
        };

        let (chunks, usage) = self.prepare_chunks(&document, &options).await?;
        self.store
            .replace_document(tenant, &document, &chunks)
            .await?;

        let report = self.report(&document, chunks.len(), usage, started);
        tracing::info!(
            tenant = %tenant,
            document_id = %document.id,
            chunks = chunks.len(),
            "document updated"
        );
        Ok(Ingested { document, report })
    }

    /// Delete a document and its chunks.
    pub async fn delete(&self, tenant: &TenantId, document_id: &str) -> EngineResult<()> {
        if !self.store.delete_document(tenant, document_id).await? {
            return Err(EngineError::NotFound(format!("document {}", document_id)));
        }
        tracing::info!(tenant = %tenant, document_id, "document deleted");
        Ok(())
    }

    fn validate(
        &self,
        title: &str,
        content: &str,
        content_type: Option<&str>,
    ) -> Result<String, ValidationError> {
        if title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if content.len() > self.limits.max_content_bytes {
            return Err(ValidationError::ContentTooLarge {
                len: content.len(),
                max: self.limits.max_content_bytes,
            });
        }
        let content_type = content_type
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        if !self
            .limits
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&content_type))
        {
            return Err(ValidationError::UnsupportedContentType(content_type));
        }
        Ok(content_type)
    }

    fn resolve_options(
        &self,
        tenant: &TenantId,
        requested: Option<ChunkOptions>,
    ) -> EngineResult<ChunkOptions> {
        let options = requested.unwrap_or_else(|| self.settings.settings(tenant).chunk_options);
        options.validate().map_err(|e| match e {
            EngineError::Configuration(msg) => ValidationError::InvalidChunkOptions(msg).into(),
            other => other,
        })?;
        Ok(options)
    }

    async fn prepare_chunks(
        &self,
        document: &Document,
        options: &ChunkOptions,
    ) -> EngineResult<(Vec<Chunk>, UsageEstimate)> {
        let pieces = chunk_text(&document.content, options)?;
        if pieces.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }

        let texts: Vec<String> = pieces.iter().map(|p| p.content.clone()).collect();
        let usage = self.gateway.estimate(&texts);
        let vectors = self
            .gateway
            .embed_batch(&texts, EmbedIntent::Document)
            .await
            .inspect_err(|e| {
                tracing::error!(document_id = %document.id, error = %e, "embedding failed, nothing persisted")
            })?;

        if vectors.len() != pieces.len() {
            return Err(EngineError::InternalInvariant(format!(
                "{} embeddings for {} chunks",
                vectors.len(),
                pieces.len()
            )));
        }

        let chunks = pieces
            .into_iter()
            .zip(vectors)
            .map(|(piece, embedding)| to_chunk(&document.id, piece, embedding))
            .collect();
        Ok((chunks, usage))
    }

    fn report(
        &self,
        document: &Document,
        chunks_created: usize,
        usage: UsageEstimate,
        started: Instant,
    ) -> IngestReport {
        IngestReport {
            document_id: document.id.clone(),
            title: document.title.clone(),
            chunks_created,
            total_tokens: usage.tokens,
            estimated_cost: usage.estimated_cost,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn to_chunk(document_id: &str, piece: TextChunk, embedding: Vec<f32>) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        position: piece.position,
        content: piece.content,
        embedding,
        metadata: piece.metadata,
    }
}
