//! Storage abstraction for Knowledge Harness.
//!
//! The [`ChunkStore`] trait is the persistence boundary of the engine and
//! the place where tenant isolation is enforced: every operation takes the
//! caller's [`TenantId`] and implementations must make rows of other tenants
//! unreachable (partitioned maps in memory, a `tenant_id` predicate bound on
//! every SQL statement in SQLite). The engine never re-checks ownership.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::models::{Chunk, ChunkCandidate, ChunkRecord, Document, TenantId};

/// Abstract storage backend for documents and their chunks.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_document`](ChunkStore::insert_document) | Atomically insert a document and all its chunks |
/// | [`replace_document`](ChunkStore::replace_document) | Atomically update a document and swap its chunk set |
/// | [`delete_document`](ChunkStore::delete_document) | Delete a document, cascading to its chunks |
/// | [`get_document`](ChunkStore::get_document) | Fetch a document by id |
/// | [`list_documents`](ChunkStore::list_documents) | List a tenant's documents |
/// | [`list_chunks`](ChunkStore::list_chunks) | Chunks of one document in position order |
/// | [`vector_search`](ChunkStore::vector_search) | Rank chunks by cosine similarity |
/// | [`keyword_search`](ChunkStore::keyword_search) | Rank chunks by BM25 relevance |
/// | [`get_chunks`](ChunkStore::get_chunks) | Resolve chunk ids to records with document fields |
/// | [`parent_window`](ChunkStore::parent_window) | Resolve a chunk's registered parent window |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert a new document together with its chunks. All or nothing.
    async fn insert_document(
        &self,
        tenant: &TenantId,
        doc: &Document,
        chunks: &[Chunk],
    ) -> EngineResult<()>;

    /// Update an existing document and replace its full chunk set. All or
    /// nothing; fails with `NotFound` if the document does not exist.
    async fn replace_document(
        &self,
        tenant: &TenantId,
        doc: &Document,
        chunks: &[Chunk],
    ) -> EngineResult<()>;

    /// Delete a document and its chunks. Returns whether it existed.
    async fn delete_document(&self, tenant: &TenantId, document_id: &str) -> EngineResult<bool>;

    async fn get_document(&self, tenant: &TenantId, document_id: &str)
        -> EngineResult<Option<Document>>;

    /// Documents ordered by `created_at` then id.
    async fn list_documents(&self, tenant: &TenantId) -> EngineResult<Vec<Document>>;

    async fn list_chunks(&self, tenant: &TenantId, document_id: &str) -> EngineResult<Vec<Chunk>>;

    /// Top `limit` chunks by cosine similarity, best first. Chunks with
    /// non-positive similarity are not returned.
    async fn vector_search(
        &self,
        tenant: &TenantId,
        query_vec: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<ChunkCandidate>>;

    /// Top `limit` chunks by lexical relevance, best first. Chunks with no
    /// matching term are not returned.
    async fn keyword_search(
        &self,
        tenant: &TenantId,
        query: &str,
        limit: usize,
    ) -> EngineResult<Vec<ChunkCandidate>>;

    /// Records for the given ids. Unknown ids are skipped; order is unspecified.
    async fn get_chunks(
        &self,
        tenant: &TenantId,
        chunk_ids: &[String],
    ) -> EngineResult<Vec<ChunkRecord>>;

    /// Text of the parent window recorded for a chunk, if any.
    async fn parent_window(&self, tenant: &TenantId, chunk_id: &str)
        -> EngineResult<Option<String>>;
}

/// Best-first ordering with a deterministic tie-break on chunk id.
pub fn sort_candidates(candidates: &mut [ChunkCandidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}
