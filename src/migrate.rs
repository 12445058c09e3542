use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema if it does not exist. Safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            category TEXT,
            content_type TEXT NOT NULL DEFAULT 'text/plain',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            chunk_options_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before chunk options were recorded lack the column.
    let has_chunk_options: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('documents') WHERE name = 'chunk_options_json'",
    )
    .fetch_one(pool)
    .await?;

    if !has_chunk_options {
        sqlx::query("ALTER TABLE documents ADD COLUMN chunk_options_json TEXT")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            tenant_id TEXT NOT NULL,
            id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (tenant_id, id),
            UNIQUE (tenant_id, document_id, position),
            FOREIGN KEY (tenant_id, document_id)
                REFERENCES documents(tenant_id, id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                tenant_id UNINDEXED,
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(tenant_id, document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_created_at ON documents(tenant_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
