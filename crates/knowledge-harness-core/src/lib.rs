//! # Knowledge Harness Core
//!
//! The tenant-scoped retrieval engine behind Knowledge Harness: chunking,
//! embedding gateway and cache, the store abstraction, hybrid retrieval with
//! Reciprocal Rank Fusion, the optional rerank and small-to-big stages, and
//! the query and ingestion orchestrators.
//!
//! This crate contains no sqlx, HTTP clients, or filesystem I/O. Native
//! backends (SQLite store, HTTP embedding and rerank providers) live in the
//! `knowledge-harness` application crate and plug in through the
//! [`store::ChunkStore`], [`embedding::EmbeddingProvider`] and
//! [`rerank::Reranker`] traits.

pub mod cache;
pub mod chunk;
pub mod classify;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod expand;
pub mod gateway;
pub mod ingest;
pub mod models;
pub mod rerank;
pub mod search;
pub mod store;
pub mod tenant;

pub use error::{EngineError, EngineResult, ValidationError};
