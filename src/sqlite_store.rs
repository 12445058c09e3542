//! SQLite-backed [`ChunkStore`] implementation.
//!
//! Every statement binds the caller's tenant id, so rows of other tenants
//! are unreachable by construction. Writes that touch a document and its
//! chunks run in a single transaction.
//!
//! Keyword search uses the FTS5 `bm25` rank; vector search loads the
//! tenant's embedding BLOBs and ranks them by cosine similarity in process.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use knowledge_harness_core::chunk::{slice_chars, ChunkOptions};
use knowledge_harness_core::embedding::{blob_to_vec, cosine_similarity, tokenize, vec_to_blob};
use knowledge_harness_core::models::{
    Chunk, ChunkCandidate, ChunkMetadata, ChunkRecord, Document, TenantId,
};
use knowledge_harness_core::store::{sort_candidates, ChunkStore};
use knowledge_harness_core::{EngineError, EngineResult};

/// SQLite implementation of the [`ChunkStore`] trait.
///
/// Wraps a [`SqlitePool`] over the schema created by
/// [`run_migrations`](crate::migrate::run_migrations): `documents`,
/// `chunks`, and the `chunks_fts` full-text index.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(err: sqlx::Error) -> EngineError {
    EngineError::persistence(err)
}

fn json_err(err: serde_json::Error) -> EngineError {
    EngineError::persistence(format!("corrupt metadata: {}", err))
}

/// Turn free text into an FTS5 expression: each token quoted, joined by OR.
/// Returns `None` when the text has no searchable tokens.
fn fts_query(text: &str) -> Option<String> {
    let mut terms: Vec<String> = tokenize(text).collect();
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn check_chunks(doc: &Document, chunks: &[Chunk]) -> EngineResult<()> {
    match chunks.iter().find(|c| c.document_id != doc.id) {
        Some(c) => Err(EngineError::persistence(format!(
            "chunk {} does not belong to document {}",
            c.id, doc.id
        ))),
        None => Ok(()),
    }
}

fn row_to_document(tenant: &TenantId, row: &SqliteRow) -> EngineResult<Document> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Map<String, Value> = serde_json::from_str(&metadata_json).map_err(json_err)?;
    let chunk_options_json: Option<String> = row.get("chunk_options_json");
    let chunk_options = chunk_options_json
        .map(|j| serde_json::from_str::<ChunkOptions>(&j))
        .transpose()
        .map_err(json_err)?;
    Ok(Document {
        id: row.get("id"),
        tenant_id: tenant.clone(),
        title: row.get("title"),
        content: row.get("content"),
        category: row.get("category"),
        content_type: row.get("content_type"),
        metadata,
        chunk_options,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn options_json(doc: &Document) -> EngineResult<Option<String>> {
    doc.chunk_options
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(json_err)
}

async fn insert_chunks(
    tx: &mut Transaction<'_, Sqlite>,
    tenant: &TenantId,
    chunks: &[Chunk],
) -> EngineResult<()> {
    for chunk in chunks {
        let metadata_json = serde_json::to_string(&chunk.metadata).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO chunks (tenant_id, id, document_id, position, content, embedding, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant.as_str())
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.position)
        .bind(&chunk.content)
        .bind(vec_to_blob(&chunk.embedding))
        .bind(&metadata_json)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO chunks_fts (tenant_id, chunk_id, document_id, content) VALUES (?, ?, ?, ?)",
        )
        .bind(tenant.as_str())
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(&chunk.content)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

async fn delete_chunks(
    tx: &mut Transaction<'_, Sqlite>,
    tenant: &TenantId,
    document_id: &str,
) -> EngineResult<()> {
    sqlx::query("DELETE FROM chunks_fts WHERE tenant_id = ? AND document_id = ?")
        .bind(tenant.as_str())
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND document_id = ?")
        .bind(tenant.as_str())
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn insert_document(
        &self,
        tenant: &TenantId,
        doc: &Document,
        chunks: &[Chunk],
    ) -> EngineResult<()> {
        check_chunks(doc, chunks)?;
        let metadata_json = serde_json::to_string(&doc.metadata).map_err(json_err)?;
        let chunk_options_json = options_json(doc)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO documents (tenant_id, id, title, content, category, content_type,
                                   metadata_json, chunk_options_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant.as_str())
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.category)
        .bind(&doc.content_type)
        .bind(&metadata_json)
        .bind(&chunk_options_json)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        insert_chunks(&mut tx, tenant, chunks).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn replace_document(
        &self,
        tenant: &TenantId,
        doc: &Document,
        chunks: &[Chunk],
    ) -> EngineResult<()> {
        check_chunks(doc, chunks)?;
        let metadata_json = serde_json::to_string(&doc.metadata).map_err(json_err)?;
        let chunk_options_json = options_json(doc)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let updated = sqlx::query(
            r#"
            UPDATE documents SET
                title = ?, content = ?, category = ?, content_type = ?,
                metadata_json = ?, chunk_options_json = ?, updated_at = ?
            WHERE tenant_id = ? AND id = ?
            "#,
        )
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.category)
        .bind(&doc.content_type)
        .bind(&metadata_json)
        .bind(&chunk_options_json)
        .bind(doc.updated_at)
        .bind(tenant.as_str())
        .bind(&doc.id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("document {}", doc.id)));
        }

        delete_chunks(&mut tx, tenant, &doc.id).await?;
        insert_chunks(&mut tx, tenant, chunks).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_document(&self, tenant: &TenantId, document_id: &str) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        delete_chunks(&mut tx, tenant, document_id).await?;
        let deleted = sqlx::query("DELETE FROM documents WHERE tenant_id = ? AND id = ?")
            .bind(tenant.as_str())
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn get_document(
        &self,
        tenant: &TenantId,
        document_id: &str,
    ) -> EngineResult<Option<Document>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, content, category, content_type, metadata_json, chunk_options_json,
                   created_at, updated_at
            FROM documents WHERE tenant_id = ? AND id = ?
            "#,
        )
        .bind(tenant.as_str())
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| row_to_document(tenant, &r)).transpose()
    }

    async fn list_documents(&self, tenant: &TenantId) -> EngineResult<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, content, category, content_type, metadata_json, chunk_options_json,
                   created_at, updated_at
            FROM documents WHERE tenant_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(|r| row_to_document(tenant, r)).collect()
    }

    async fn list_chunks(&self, tenant: &TenantId, document_id: &str) -> EngineResult<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, position, content, embedding, metadata_json
            FROM chunks WHERE tenant_id = ? AND document_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(tenant.as_str())
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let metadata_json: String = row.get("metadata_json");
                Ok(Chunk {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    position: row.get("position"),
                    content: row.get("content"),
                    embedding: blob_to_vec(&blob),
                    metadata: serde_json::from_str(&metadata_json).map_err(json_err)?,
                })
            })
            .collect()
    }

    async fn vector_search(
        &self,
        tenant: &TenantId,
        query_vec: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<ChunkCandidate>> {
        let rows = sqlx::query("SELECT id, document_id, embedding FROM chunks WHERE tenant_id = ?")
            .bind(tenant.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (similarity > 0.0).then(|| ChunkCandidate {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
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
        let Some(expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ? AND tenant_id = ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(tenant.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: -rank,
                }
            })
            .collect();

        sort_candidates(&mut candidates);
        Ok(candidates)
    }

    async fn get_chunks(
        &self,
        tenant: &TenantId,
        chunk_ids: &[String],
    ) -> EngineResult<Vec<ChunkRecord>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; chunk_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT c.id, c.document_id, c.position, c.content, c.metadata_json,
                   d.title, d.category
            FROM chunks c
            JOIN documents d ON d.tenant_id = c.tenant_id AND d.id = c.document_id
            WHERE c.tenant_id = ? AND c.id IN ({})
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql).bind(tenant.as_str());
        for id in chunk_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let metadata_json: String = row.get("metadata_json");
                let metadata: ChunkMetadata =
                    serde_json::from_str(&metadata_json).map_err(json_err)?;
                Ok(ChunkRecord {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    position: row.get("position"),
                    content: row.get("content"),
                    metadata,
                    title: row.get("title"),
                    category: row.get("category"),
                })
            })
            .collect()
    }

    async fn parent_window(
        &self,
        tenant: &TenantId,
        chunk_id: &str,
    ) -> EngineResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT c.metadata_json, d.content
            FROM chunks c
            JOIN documents d ON d.tenant_id = c.tenant_id AND d.id = c.document_id
            WHERE c.tenant_id = ? AND c.id = ?
            "#,
        )
        .bind(tenant.as_str())
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let metadata_json: String = row.get("metadata_json");
        let metadata: ChunkMetadata = serde_json::from_str(&metadata_json).map_err(json_err)?;
        let content: String = row.get("content");
        Ok(metadata
            .parent
            .map(|span| slice_chars(&content, span.start_char, span.end_char)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowledge_harness_core::chunk::content_hash;
    use knowledge_harness_core::models::ParentSpan;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(tmp.path().join("kh.sqlite"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn doc(t: &TenantId, id: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            tenant_id: t.clone(),
            title: format!("Title {}", id),
            content: content.to_string(),
            category: Some("guides".to_string()),
            content_type: "text/plain".to_string(),
            metadata: Map::new(),
            chunk_options: None,
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000,
        }
    }

    fn chunk(doc_id: &str, id: &str, position: i64, text: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: doc_id.to_string(),
            position,
            content: text.to_string(),
            embedding,
            metadata: ChunkMetadata {
                start_char: 0,
                end_char: text.chars().count(),
                content_hash: content_hash(text),
                parent: None,
                extra: Map::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let (_tmp, store) = test_store().await;
        let t = tenant("acme");
        let d = doc(&t, "d1", "Rust ownership rules");
        store
            .insert_document(&t, &d, &[chunk("d1", "c1", 0, "Rust ownership rules", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(store.get_document(&t, "d1").await.unwrap(), Some(d));
        let chunks = store.list_chunks(&t, "d1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].embedding, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_chunk_options_round_trip() {
        let (_tmp, store) = test_store().await;
        let t = tenant("acme");
        let mut d = doc(&t, "d1", "Rust ownership rules");
        d.chunk_options = Some(ChunkOptions {
            chunk_size: 100,
            overlap_size: 0,
            preserve_sentences: false,
            parent_size: Some(400),
        });
        let c = chunk("d1", "c1", 0, "Rust ownership rules", vec![1.0, 0.0]);
        store.insert_document(&t, &d, &[c.clone()]).await.unwrap();
        assert_eq!(store.get_document(&t, "d1").await.unwrap(), Some(d.clone()));

        d.chunk_options = None;
        store.replace_document(&t, &d, &[c]).await.unwrap();
        let stored = store.get_document(&t, "d1").await.unwrap().unwrap();
        assert_eq!(stored.chunk_options, None);
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_nothing_behind() {
        let (_tmp, store) = test_store().await;
        let t = tenant("acme");
        let d = doc(&t, "d1", "alpha beta");
        let dup = vec![
            chunk("d1", "c1", 0, "alpha", vec![1.0]),
            chunk("d1", "c1", 1, "beta", vec![1.0]),
        ];

        let err = store.insert_document(&t, &d, &dup).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(store.get_document(&t, "d1").await.unwrap(), None);
        assert!(store.keyword_search(&t, "alpha", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let (_tmp, store) = test_store().await;
        let a = tenant("a");
        let b = tenant("b");
        store
            .insert_document(&a, &doc(&a, "d1", "secret"), &[chunk("d1", "c1", 0, "secret plans", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert!(store.get_document(&b, "d1").await.unwrap().is_none());
        assert!(store.keyword_search(&b, "secret", 10).await.unwrap().is_empty());
        assert!(store.vector_search(&b, &[1.0, 0.0], 10).await.unwrap().is_empty());
        assert!(store.get_chunks(&b, &["c1".to_string()]).await.unwrap().is_empty());
        assert!(!store.delete_document(&b, "d1").await.unwrap());
        assert!(store.get_document(&a, "d1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_and_sanitizes() {
        let (_tmp, store) = test_store().await;
        let t = tenant("acme");
        store
            .insert_document(
                &t,
                &doc(&t, "d1", "x"),
                &[
                    chunk("d1", "c1", 0, "tokio runtime tokio tasks", vec![1.0]),
                    chunk("d1", "c2", 1, "a note about tokio", vec![1.0]),
                    chunk("d1", "c3", 2, "unrelated gardening tips", vec![1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.keyword_search(&t, "tokio AND \"(", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"c1") && ids.contains(&"c2"));
        assert!(store.keyword_search(&t, "!!!", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_orders_and_drops_opposites() {
        let (_tmp, store) = test_store().await;
        let t = tenant("acme");
        store
            .insert_document(
                &t,
                &doc(&t, "d1", "x"),
                &[
                    chunk("d1", "near", 0, "a", vec![1.0, 0.1]),
                    chunk("d1", "far", 1, "b", vec![0.5, 1.0]),
                    chunk("d1", "opposite", 2, "c", vec![-1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.vector_search(&t, &[1.0, 0.0], 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let (_tmp, store) = test_store().await;
        let t = tenant("acme");
        let mut d = doc(&t, "d1", "old");
        store
            .insert_document(&t, &d, &[chunk("d1", "c1", 0, "old words", vec![1.0])])
            .await
            .unwrap();

        d.title = "New".to_string();
        d.updated_at += 10;
        store
            .replace_document(&t, &d, &[chunk("d1", "c2", 0, "new words", vec![1.0])])
            .await
            .unwrap();
        assert_eq!(store.get_document(&t, "d1").await.unwrap().unwrap().title, "New");
        assert!(store.keyword_search(&t, "old", 10).await.unwrap().is_empty());
        assert_eq!(store.keyword_search(&t, "new", 10).await.unwrap().len(), 1);

        let missing = doc(&t, "nope", "x");
        assert!(matches!(
            store.replace_document(&t, &missing, &[]).await,
            Err(EngineError::NotFound(_))
        ));

        assert!(store.delete_document(&t, "d1").await.unwrap());
        assert!(store.list_chunks(&t, "d1").await.unwrap().is_empty());
        assert!(!store.delete_document(&t, "d1").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_chunks_and_parent_window() {
        let (_tmp, store) = test_store().await;
        let t = tenant("acme");
        let content = "First sentence. Second sentence. Third sentence.";
        let mut c = chunk("d1", "c1", 0, "Second sentence.", vec![1.0]);
        c.metadata.parent = Some(ParentSpan {
            start_char: 0,
            end_char: 32,
        });
        store
            .insert_document(&t, &doc(&t, "d1", content), &[c])
            .await
            .unwrap();

        let records = store.get_chunks(&t, &["c1".to_string(), "ghost".to_string()]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Title d1");
        assert_eq!(records[0].category.as_deref(), Some("guides"));

        assert_eq!(
            store.parent_window(&t, "c1").await.unwrap().as_deref(),
            Some("First sentence. Second sentence.")
        );
        assert_eq!(store.parent_window(&t, "ghost").await.unwrap(), None);
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("Tokio OR runtime").as_deref(), Some("\"or\" OR \"runtime\" OR \"tokio\""));
        assert_eq!(fts_query("  ()* "), None);
    }
}
