//! CLI command implementations.
//!
//! Each command runs one engine operation for a single tenant and prints a
//! human-readable summary to stdout. Engine errors are surfaced as `anyhow`
//! errors so `main` can report them uniformly.

use std::path::Path;

use anyhow::{bail, Context, Result};

use knowledge_harness_core::executor::QueryRequest;
use knowledge_harness_core::ingest::IngestRequest;
use knowledge_harness_core::models::TenantId;

use crate::engine::Engine;

const EXCERPT_CHARS: usize = 240;

pub fn parse_tenant(raw: &str) -> Result<TenantId> {
    TenantId::new(raw).context("invalid --tenant")
}

/// Document body from `--file` or `--content`; exactly one must be given.
pub fn read_content(file: Option<&Path>, content: Option<String>) -> Result<String> {
    match (file, content) {
        (Some(path), None) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        (None, Some(text)) => Ok(text),
        (Some(_), Some(_)) => bail!("pass either --file or --content, not both"),
        (None, None) => bail!("one of --file or --content is required"),
    }
}

pub async fn run_ingest(engine: &Engine, tenant: &TenantId, request: IngestRequest) -> Result<()> {
    let ingested = engine.ingestor.ingest(tenant, request).await?;
    let report = ingested.report;

    println!("ingested {}", report.document_id);
    println!("  title: {}", report.title);
    println!("  chunks: {}", report.chunks_created);
    println!("  tokens: {}", report.total_tokens);
    println!("  estimated cost: ${:.6}", report.estimated_cost);
    println!("  time: {} ms", report.processing_time_ms);
    Ok(())
}

pub async fn run_query(
    engine: &Engine,
    tenant: &TenantId,
    request: &QueryRequest,
    json: bool,
) -> Result<()> {
    let response = engine.executor.execute(tenant, request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if response.chunks.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, chunk) in response.chunks.iter().enumerate() {
        println!(
            "{}. [{:.2} {}] {}",
            i + 1,
            chunk.score,
            chunk.tier.as_str(),
            chunk.title
        );
        if let Some(category) = &chunk.category {
            println!("    category: {}", category);
        }
        let excerpt: String = chunk.content.chars().take(EXCERPT_CHARS).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    document: {} (chunk {})", chunk.document_id, chunk.position);
        println!();
    }

    let d = &response.diagnostics;
    println!(
        "class: {}  candidates: {}  rerank: {:?}  expand: {:?}  time: {} ms",
        d.classification, d.candidates_considered, d.rerank, d.expand, response.processing_time_ms
    );
    if d.search_degraded {
        println!("warning: one search path failed; results may be incomplete");
    }
    Ok(())
}

pub async fn run_delete(engine: &Engine, tenant: &TenantId, id: &str) -> Result<()> {
    engine.ingestor.delete(tenant, id).await?;
    println!("deleted {}", id);
    Ok(())
}

pub async fn run_list(engine: &Engine, tenant: &TenantId) -> Result<()> {
    let docs = engine.store.list_documents(tenant).await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in docs {
        let date = chrono::DateTime::from_timestamp(doc.updated_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        println!("{}  {}  {}", doc.id, date, doc.title);
    }
    Ok(())
}
