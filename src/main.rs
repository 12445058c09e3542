//! # Knowledge Harness CLI (`kh`)
//!
//! The `kh` binary drives the retrieval engine from the command line and
//! starts the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! kh --config ./config/kh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kh init` | Create the SQLite database and run schema migrations |
//! | `kh ingest "<title>" --file <path>` | Chunk, embed, and store a document |
//! | `kh query "<question>"` | Retrieve ranked chunks and assembled context |
//! | `kh list` | List a tenant's documents |
//! | `kh delete <id>` | Delete a document and its chunks |
//! | `kh serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! kh init
//! kh ingest "Deploy guide" --file docs/deploy.md --tenant acme --content-type text/markdown
//! kh query "how do I roll back a deploy" --tenant acme --small-to-big
//! kh query "\"exit code 137\"" --tenant acme --json
//! kh serve
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use knowledge_harness::commands;
use knowledge_harness::config::{self, Config, LogFormat};
use knowledge_harness::engine::Engine;
use knowledge_harness::server;
use knowledge_harness_core::ingest::IngestRequest;

/// Knowledge Harness CLI: tenant-scoped hybrid retrieval for RAG.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kh",
    about = "Knowledge Harness: tenant-scoped hybrid retrieval for RAG",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it on an existing database is safe.
    Init,

    /// Ingest a document for a tenant.
    Ingest {
        /// Document title.
        title: String,

        /// Read the document body from this file.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Document body given inline.
        #[arg(long)]
        content: Option<String>,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        category: Option<String>,

        /// MIME type, e.g. `text/markdown`. Defaults to `text/plain`.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Query a tenant's knowledge base.
    Query {
        /// The question or search text.
        query: String,

        #[arg(long)]
        tenant: String,

        /// Number of results (defaults to `[retrieval].default_top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum normalized score (defaults to `[retrieval].default_min_score`).
        #[arg(long)]
        min_score: Option<f64>,

        /// Semantic search only.
        #[arg(long)]
        no_hybrid: bool,

        /// Substitute parent windows for matched chunks.
        #[arg(long)]
        small_to_big: bool,

        /// Force the rerank stage on.
        #[arg(long, conflicts_with = "no_rerank")]
        rerank: bool,

        /// Force the rerank stage off.
        #[arg(long)]
        no_rerank: bool,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List a tenant's documents.
    List {
        #[arg(long)]
        tenant: String,
    },

    /// Delete a document and its chunks.
    Delete {
        /// Document id.
        id: String,

        #[arg(long)]
        tenant: String,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg);

    let engine = Engine::open(&cfg).await?;

    match cli.command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            title,
            file,
            content,
            tenant,
            category,
            content_type,
        } => {
            let tenant = commands::parse_tenant(&tenant)?;
            let request = IngestRequest {
                title,
                content: commands::read_content(file.as_deref(), content)?,
                category,
                content_type,
                ..IngestRequest::default()
            };
            commands::run_ingest(&engine, &tenant, request).await?;
        }
        Commands::Query {
            query,
            tenant,
            top_k,
            min_score,
            no_hybrid,
            small_to_big,
            rerank,
            no_rerank,
            json,
        } => {
            let tenant = commands::parse_tenant(&tenant)?;
            let mut request = engine.query_request(query);
            if let Some(k) = top_k {
                request.top_k = k;
            }
            if let Some(score) = min_score {
                request.min_score = score;
            }
            request.use_hybrid_search = !no_hybrid;
            request.use_small_to_big = small_to_big;
            request.use_reranking = match (rerank, no_rerank) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            commands::run_query(&engine, &tenant, &request, json).await?;
        }
        Commands::List { tenant } => {
            let tenant = commands::parse_tenant(&tenant)?;
            commands::run_list(&engine, &tenant).await?;
        }
        Commands::Delete { id, tenant } => {
            let tenant = commands::parse_tenant(&tenant)?;
            commands::run_delete(&engine, &tenant, &id).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg, engine).await?;
        }
    }

    Ok(())
}
