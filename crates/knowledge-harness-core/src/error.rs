//! Error taxonomy shared by every engine component.
//!
//! All fallible engine operations return [`EngineResult`]. The variants map
//! one-to-one onto the failure classes callers need to tell apart:
//!
//! | Variant | Meaning | Retried? |
//! |---------|---------|----------|
//! | [`Validation`](EngineError::Validation) | Bad caller input | Never |
//! | [`Configuration`](EngineError::Configuration) | Invalid engine or chunking parameters | Never |
//! | [`ExternalService`](EngineError::ExternalService) | Embedding / rerank upstream failure or timeout | Only via request coalescing |
//! | [`Persistence`](EngineError::Persistence) | Storage failure; transaction rolled back | No |
//! | [`InternalInvariant`](EngineError::InternalInvariant) | A bug, e.g. embedding count ≠ chunk count | Never, always fatal |
//! | [`Retrieval`](EngineError::Retrieval) | Both semantic and lexical search failed | No |
//! | [`NotFound`](EngineError::NotFound) | Document id unknown within the tenant | No |
//!
//! `EngineError` is `Clone` so a single in-flight embedding result (success
//! or failure) can be handed to every coalesced waiter.

use thiserror::Error;

/// Convenience alias used across the engine.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Reasons a caller-supplied request is rejected before any work happens.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("tenant id must not be empty")]
    EmptyTenant,
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("content must not be empty")]
    EmptyContent,
    #[error("content is {len} bytes, exceeding the {max} byte limit")]
    ContentTooLarge { len: usize, max: usize },
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("invalid chunk options: {0}")]
    InvalidChunkOptions(String),
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("top_k must be between 1 and {max}, got {got}")]
    InvalidTopK { got: usize, max: usize },
    #[error("min_score must be within [0, 1], got {0}")]
    InvalidMinScore(f64),
}

/// The engine-wide error type.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{service} service error: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("retrieval failed (semantic: {semantic}; lexical: {lexical})")]
    Retrieval { semantic: String, lexical: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn external(service: &'static str, message: impl std::fmt::Display) -> Self {
        EngineError::ExternalService {
            service,
            message: message.to_string(),
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        EngineError::Persistence(err.to_string())
    }

    /// Machine-readable error code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::Configuration(_) => "configuration_error",
            EngineError::ExternalService { .. } => "external_service_error",
            EngineError::Persistence(_) => "persistence_error",
            EngineError::InternalInvariant(_) => "internal_error",
            EngineError::Retrieval { .. } => "search_unavailable",
            EngineError::NotFound(_) => "not_found",
        }
    }

    /// Message safe to show to end users.
    ///
    /// Validation, configuration, and ingestion-side service failures are
    /// reported verbatim. Retrieval failures are reported generically; the
    /// full detail is logged by the component that produced it.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::Retrieval { .. } => "search temporarily unavailable".to_string(),
            EngineError::InternalInvariant(_) => "internal error".to_string(),
            EngineError::Persistence(_) => "storage temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }

    /// True when the failure was caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_) | EngineError::Configuration(_) | EngineError::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_converts_into_engine_error() {
        let err: EngineError = ValidationError::EmptyContent.into();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::EmptyContent)
        ));
        assert_eq!(err.code(), "validation_error");
        assert_eq!(err.public_message(), "content must not be empty");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_retrieval_message_is_generic() {
        let err = EngineError::Retrieval {
            semantic: "connection refused".to_string(),
            lexical: "database is locked".to_string(),
        };
        assert_eq!(err.public_message(), "search temporarily unavailable");
        assert!(err.to_string().contains("connection refused"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_external_service_display() {
        let err = EngineError::external("embedding", "timed out after 30s");
        assert_eq!(err.to_string(), "embedding service error: timed out after 30s");
        assert_eq!(err.code(), "external_service_error");
    }
}
