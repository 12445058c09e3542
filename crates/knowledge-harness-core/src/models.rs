//! Core data models used throughout Knowledge Harness.
//!
//! These types represent the tenants, documents, chunks, and retrieval
//! results that flow through the ingestion and query pipelines.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chunk::ChunkOptions;
use crate::error::ValidationError;

/// Identifier of the isolation boundary every document and query belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyTenant);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tenant-owned unit of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub tenant_id: TenantId,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub content_type: String,
    pub metadata: Map<String, Value>,
    /// Options the current chunk set was built with; reused on update.
    #[serde(default)]
    pub chunk_options: Option<ChunkOptions>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

/// Character span of a larger context window surrounding a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentSpan {
    pub start_char: usize,
    pub end_char: usize,
}

/// Metadata recorded for every chunk at ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Inclusive start offset in the source content, in characters.
    pub start_char: usize,
    /// Exclusive end offset in the source content, in characters.
    pub end_char: usize,
    /// SHA-256 of the chunk text.
    pub content_hash: String,
    /// Parent window for small-to-big expansion, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentSpan>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Output of the chunker: a slice of content with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    pub position: i64,
    pub metadata: ChunkMetadata,
}

/// A persisted chunk with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub position: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A candidate chunk returned from keyword or vector search.
///
/// `raw_score` is backend-specific (BM25 or cosine similarity) and only
/// its rank within the list matters to fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    pub raw_score: f64,
}

/// A chunk joined with the display fields of its document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub position: i64,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub title: String,
    pub category: Option<String>,
}

/// Relevance bucket derived from a normalized score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelevanceTier {
    High,
    Medium,
    Low,
}

impl RelevanceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelevanceTier::High => "high",
            RelevanceTier::Medium => "medium",
            RelevanceTier::Low => "low",
        }
    }
}

/// Score thresholds separating relevance tiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub high: f64,
    pub medium: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            high: 0.85,
            medium: 0.70,
        }
    }
}

impl TierThresholds {
    pub fn tier(&self, score: f64) -> RelevanceTier {
        if score >= self.high {
            RelevanceTier::High
        } else if score >= self.medium {
            RelevanceTier::Medium
        } else {
            RelevanceTier::Low
        }
    }
}

/// One ranked passage produced for a query. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub document_id: String,
    pub position: i64,
    /// The matched chunk text.
    pub content: String,
    /// Parent window substituted by small-to-big expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Normalized score in `[0.0, 1.0]`.
    pub score: f64,
    pub tier: RelevanceTier,
    pub title: String,
    pub category: Option<String>,
    #[serde(skip)]
    pub parent: Option<ParentSpan>,
}

impl RetrievalResult {
    /// Text handed downstream: the parent window if expanded, else the chunk.
    pub fn context_text(&self) -> &str {
        self.context.as_deref().unwrap_or(&self.content)
    }
}
