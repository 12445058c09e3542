//! # Knowledge Harness
//!
//! Tenant-scoped knowledge retrieval for RAG: documents are chunked,
//! embedded, and stored per tenant; queries run semantic and lexical search
//! in parallel, fuse them with Reciprocal Rank Fusion, optionally rerank and
//! expand to parent windows, and return ranked chunks with an assembled
//! context block.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────────────────┐   ┌────────────┐
//! │ CLI (kh) │──▶│ knowledge-harness-core     │──▶│  SQLite    │
//! │ HTTP API │   │ ingest / retrieve / fuse / │   │ FTS5 + BLOB│
//! └──────────┘   │ rerank / expand / assemble │   └────────────┘
//!                └─────────────┬──────────────┘
//!                              ▼
//!                  embedding + rerank services
//! ```
//!
//! This crate supplies the native pieces: configuration, the SQLite store,
//! HTTP providers, the Axum server, and the CLI commands. The pipeline
//! itself lives in [`knowledge_harness_core`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | `ChunkStore` over SQLite |
//! | [`embedding`] | OpenAI / Ollama embedding providers |
//! | [`rerank`] | HTTP cross-encoder reranker |
//! | [`engine`] | Pipeline wiring from config |
//! | [`commands`] | CLI command implementations |
//! | [`server`] | HTTP API |

pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod migrate;
pub mod rerank;
pub mod server;
pub mod sqlite_store;
