//! HTTP API.
//!
//! Every `/v1` route is scoped to the tenant named in the `x-tenant-id`
//! header; requests without one are rejected before reaching the engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/query` | Retrieve ranked chunks and assembled context |
//! | `POST` | `/v1/documents` | Ingest a document |
//! | `GET`  | `/v1/documents` | List the tenant's documents |
//! | `GET`  | `/v1/documents/{id}` | Fetch one document |
//! | `PUT`  | `/v1/documents/{id}` | Update a document (re-chunks and re-embeds) |
//! | `DELETE` | `/v1/documents/{id}` | Delete a document and its chunks |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "query must not be empty" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request`, `validation_error`, `configuration_error` | 400 |
//! | `not_found` | 404 |
//! | `external_service_error` | 502 |
//! | `search_unavailable` | 503 |
//! | `persistence_error`, `internal_error` | 500 |

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use knowledge_harness_core::executor::{QueryRequest, QueryResponse};
use knowledge_harness_core::ingest::{IngestReport, IngestRequest, UpdateRequest};
use knowledge_harness_core::models::{Document, TenantId};
use knowledge_harness_core::EngineError;

use crate::config::Config;
use crate::engine::Engine;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Build the application router over an engine.
pub fn router(engine: Engine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/query", post(handle_query))
        .route("/v1/documents", post(handle_ingest).get(handle_list))
        .route(
            "/v1/documents/{id}",
            get(handle_get).put(handle_update).delete(handle_delete),
        )
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(engine)
}

/// Bind `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config, engine: Engine) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Knowledge Harness listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"validation_error"`).
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) | EngineError::Configuration(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            EngineError::Retrieval { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Persistence(_) | EngineError::InternalInvariant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if !err.is_client_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.public_message(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

// ============ Extractors ============

/// The calling tenant, read from the `x-tenant-id` header.
pub struct Tenant(pub TenantId);

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .ok_or_else(|| bad_request(format!("missing {} header", TENANT_HEADER)))?
            .to_str()
            .map_err(|_| bad_request(format!("invalid {} header", TENANT_HEADER)))?;
        let tenant = TenantId::new(raw).map_err(|e| AppError::from(EngineError::from(e)))?;
        Ok(Tenant(tenant))
    }
}

// ============ Bodies ============

/// Query body. Omitted fields fall back to the configured defaults.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    min_score: Option<f64>,
    #[serde(default)]
    use_hybrid_search: Option<bool>,
    #[serde(default, rename = "useSmall2Big")]
    use_small_to_big: Option<bool>,
    #[serde(default)]
    use_reranking: Option<bool>,
}

impl QueryBody {
    fn into_request(self, engine: &Engine) -> QueryRequest {
        let base = engine.query_request(self.query);
        QueryRequest {
            top_k: self.top_k.unwrap_or(base.top_k),
            min_score: self.min_score.unwrap_or(base.min_score),
            use_hybrid_search: self.use_hybrid_search.unwrap_or(base.use_hybrid_search),
            use_small_to_big: self.use_small_to_big.unwrap_or(base.use_small_to_big),
            use_reranking: self.use_reranking,
            ..base
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentView {
    id: String,
    title: String,
    category: Option<String>,
    content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    metadata: Map<String, Value>,
    created_at: String,
    updated_at: String,
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

impl DocumentView {
    fn new(doc: Document, with_content: bool) -> Self {
        Self {
            id: doc.id,
            title: doc.title,
            category: doc.category,
            content_type: doc.content_type,
            content: with_content.then_some(doc.content),
            metadata: doc.metadata,
            created_at: format_ts_iso(doc.created_at),
            updated_at: format_ts_iso(doc.updated_at),
        }
    }
}

#[derive(Serialize)]
struct DocumentList {
    documents: Vec<DocumentView>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// ============ Handlers ============

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_query(
    State(engine): State<Engine>,
    Tenant(tenant): Tenant,
    payload: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(body) = payload?;
    let request = body.into_request(&engine);
    let response = engine.executor.execute(&tenant, &request).await?;
    Ok(Json(response))
}

async fn handle_ingest(
    State(engine): State<Engine>,
    Tenant(tenant): Tenant,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestReport>), AppError> {
    let Json(request) = payload?;
    let ingested = engine.ingestor.ingest(&tenant, request).await?;
    Ok((StatusCode::CREATED, Json(ingested.report)))
}

async fn handle_update(
    State(engine): State<Engine>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    payload: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<Json<IngestReport>, AppError> {
    let Json(request) = payload?;
    let ingested = engine.ingestor.update(&tenant, &id, request).await?;
    Ok(Json(ingested.report))
}

async fn handle_delete(
    State(engine): State<Engine>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    engine.ingestor.delete(&tenant, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_list(
    State(engine): State<Engine>,
    Tenant(tenant): Tenant,
) -> Result<Json<DocumentList>, AppError> {
    let documents = engine
        .store
        .list_documents(&tenant)
        .await?
        .into_iter()
        .map(|d| DocumentView::new(d, false))
        .collect();
    Ok(Json(DocumentList { documents }))
}

async fn handle_get(
    State(engine): State<Engine>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    let doc = engine
        .store
        .get_document(&tenant, &id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("document {}", id)))?;
    Ok(Json(DocumentView::new(doc, true)))
}
