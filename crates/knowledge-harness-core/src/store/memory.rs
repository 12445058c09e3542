//! In-memory [`ChunkStore`] implementation for tests and embedding.
//!
//! Data is partitioned by tenant behind a single `RwLock`; every operation
//! looks up exactly one partition, so a query can never observe another
//! tenant's rows. Writes take the write lock for their whole duration, which
//! makes document + chunk inserts atomic with respect to readers.
//!
//! Vector search is brute-force cosine similarity. Keyword search is BM25
//! (`k1 = 1.2`, `b = 0.75`) over lowercase alphanumeric tokens.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::chunk::slice_chars;
use crate::embedding::{cosine_similarity, tokenize};
use crate::error::{EngineError, EngineResult};
use crate::models::{Chunk, ChunkCandidate, ChunkRecord, Document, TenantId};

use super::{sort_candidates, ChunkStore};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Default)]
struct Partition {
    docs: HashMap<String, Document>,
    /// Chunks per document id, in position order.
    chunks: HashMap<String, Vec<Chunk>>,
}

impl Partition {
    fn all_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values().flatten()
    }

    fn find_chunk(&self, chunk_id: &str) -> Option<&Chunk> {
        self.all_chunks().find(|c| c.id == chunk_id)
    }
}

/// In-memory store. Cheap to construct; share via `Arc`.
pub struct InMemoryStore {
    partitions: RwLock<HashMap<TenantId, Partition>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_chunks(doc: &Document, chunks: &[Chunk]) -> EngineResult<()> {
    let mut seen = HashSet::new();
    for c in chunks {
        if c.document_id != doc.id {
            return Err(EngineError::persistence(format!(
                "chunk {} does not belong to document {}",
                c.id, doc.id
            )));
        }
        if !seen.insert(c.id.as_str()) {
            return Err(EngineError::persistence(format!("duplicate chunk id {}", c.id)));
        }
    }
    Ok(())
}

fn sorted(chunks: &[Chunk]) -> Vec<Chunk> {
    let mut v = chunks.to_vec();
    v.sort_by_key(|c| c.position);
    v
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn insert_document(
        &self,
        tenant: &TenantId,
        doc: &Document,
        chunks: &[Chunk],
    ) -> EngineResult<()> {
        check_chunks(doc, chunks)?;
        let mut partitions = self.partitions.write();
        let partition = partitions.entry(tenant.clone()).or_default();
        if partition.docs.contains_key(&doc.id) {
            return Err(EngineError::persistence(format!(
                "document {} already exists",
                doc.id
            )));
        }
        partition.docs.insert(doc.id.clone(), doc.clone());
        partition.chunks.insert(doc.id.clone(), sorted(chunks));
        Ok(())
    }

    async fn replace_document(
        &self,
        tenant: &TenantId,
        doc: &Document,
        chunks: &[Chunk],
    ) -> EngineResult<()> {
        check_chunks(doc, chunks)?;
        let mut partitions = self.partitions.write();
        let partition = partitions
            .get_mut(tenant)
            .filter(|p| p.docs.contains_key(&doc.id))
            .ok_or_else(|| EngineError::NotFound(format!("document {}", doc.id)))?;
        partition.docs.insert(doc.id.clone(), doc.clone());
        partition.chunks.insert(doc.id.clone(), sorted(chunks));
        Ok(())
    }

    async fn delete_document(&self, tenant: &TenantId, document_id: &str) -> EngineResult<bool> {
        let mut partitions = self.partitions.write();
        let Some(partition) = partitions.get_mut(tenant) else {
            return Ok(false);
        };
        partition.chunks.remove(document_id);
        Ok(partition.docs.remove(document_id).is_some())
    }

    async fn get_document(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> EngineResult<Option<Document>> {
        let partitions = self.partitions.read();
        Ok(partitions
            .get(tenant)
            .and_then(|p| p.docs.get(document_id))
            .cloned())
    }

    async fn list_documents(&self, tenant: &TenantId) -> EngineResult<Vec<Document>> {
        let partitions = self.partitions.read();
        let mut docs: Vec<Document> = partitions
            .get(tenant)
            .map(|p| p.docs.values().cloned().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn list_chunks(&self, tenant: &TenantId, document_id: &str) -> EngineResult<Vec<Chunk>> {
        let partitions = self.partitions.read();
        Ok(partitions
            .get(tenant)
            .and_then(|p| p.chunks.get(document_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn vector_search(
        &self,
        tenant: &TenantId,
        query_vec: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<ChunkCandidate>> {
        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(tenant) else {
            return Ok(Vec::new());
        };
        let mut candidates: Vec<ChunkCandidate> = partition
            .all_chunks()
            .filter_map(|c| {
                let similarity = cosine_similarity(query_vec, &c.embedding) as f64;
                (similarity > 0.0).then(|| ChunkCandidate {
                    chunk_id: c.id.clone(),
                    document_id: c.document_id.clone(),
                    raw_score: similarity,
                })
            })
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn keyword_search(
        &self,
        tenant: &TenantId,
        query: &str,
        limit: usize,
    ) -> EngineResult<Vec<ChunkCandidate>> {
        let terms: HashSet<String> = tokenize(query).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(tenant) else {
            return Ok(Vec::new());
        };

        let docs: Vec<(&Chunk, Vec<String>)> = partition
            .all_chunks()
            .map(|c| (c, tokenize(&c.content).collect()))
            .collect();
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let n = docs.len() as f64;
        let avg_len = docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / n;

        let mut df: HashMap<&str, usize> = HashMap::new();
        for (_, tokens) in &docs {
            let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
            for t in unique {
                if terms.contains(t) {
                    *df.entry(t).or_default() += 1;
                }
            }
        }

        let mut candidates: Vec<ChunkCandidate> = docs
            .iter()
            .filter_map(|(chunk, tokens)| {
                let len = tokens.len() as f64;
                let mut score = 0.0;
                for term in &terms {
                    let tf = tokens.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = df.get(term.as_str()).copied().unwrap_or(0) as f64;
                    let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                    let norm = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0));
                    score += idf * tf * (BM25_K1 + 1.0) / norm;
                }
                (score > 0.0).then(|| ChunkCandidate {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    raw_score: score,
                })
            })
            .collect();
        sort_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn get_chunks(
        &self,
        tenant: &TenantId,
        chunk_ids: &[String],
    ) -> EngineResult<Vec<ChunkRecord>> {
        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(tenant) else {
            return Ok(Vec::new());
        };
        let wanted: HashSet<&str> = chunk_ids.iter().map(String::as_str).collect();
        Ok(partition
            .all_chunks()
            .filter(|c| wanted.contains(c.id.as_str()))
            .filter_map(|c| {
                let doc = partition.docs.get(&c.document_id)?;
                Some(ChunkRecord {
                    chunk_id: c.id.clone(),
                    document_id: c.document_id.clone(),
                    position: c.position,
                    content: c.content.clone(),
                    metadata: c.metadata.clone(),
                    title: doc.title.clone(),
                    category: doc.category.clone(),
                })
            })
            .collect())
    }

    async fn parent_window(
        &self,
        tenant: &TenantId,
        chunk_id: &str,
    ) -> EngineResult<Option<String>> {
        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(tenant) else {
            return Ok(None);
        };
        let Some(chunk) = partition.find_chunk(chunk_id) else {
            return Ok(None);
        };
        let Some(span) = chunk.metadata.parent else {
            return Ok(None);
        };
        Ok(partition
            .docs
            .get(&chunk.document_id)
            .map(|doc| slice_chars(&doc.content, span.start_char, span.end_char)))
    }
}
