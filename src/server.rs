//! HTTP server.
//!
//! Exposes kenny's search, document-retrieval, source-status, and
//! tool-execution surface as a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/search` | Hybrid search over indexed documents |
//! | `POST` | `/tools/get` | Retrieve a document by id |
//! | `GET`  | `/tools/sources` | List source configuration and health |
//! | `GET`  | `/tools/list` | List the tool catalog (name, schema, mutating) |
//! | `POST` | `/tools/call` | Invoke a tool through the dry-run/confirm protocol |
//! | `POST` | `/enhance` | Run query enhancement (intent, entities, time filter) |
//! | `POST` | `/reason` | Run the reasoning loop over a free-text prompt |
//! | `GET`  | `/audit` | List persisted audit records, filterable by correlation/plan id |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `confirmation_mismatch` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted, to support browser-based
//! and cross-origin tool-calling clients.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::Cache;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::enhance::{self, EnhancedQuery};
use crate::extractors::SourceExtractor;
use crate::get::{get_document, DocumentResponse, GetError};
use crate::models::{AuditRecord, DocumentType};
use crate::reasoning::{self, ReasoningOutcome};
use crate::search::{hybrid_search, SearchError, SearchType};
use crate::sources::{list_sources, SourceStatus};
use crate::store::DocumentStore;
use crate::tools::{CallContext, CallResult, ToolError, ToolRegistry, ToolSummary};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<DocumentStore>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<Cache>,
    extractors: Arc<HashMap<String, Box<dyn SourceExtractor>>>,
}

/// Starts the HTTP server. Binds to `config.server.bind` and runs until the
/// process is terminated.
pub async fn run_server(
    config: Arc<Config>,
    store: Arc<DocumentStore>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<Cache>,
    extractors: Arc<HashMap<String, Box<dyn SourceExtractor>>>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let state = AppState {
        config,
        store,
        provider,
        cache,
        extractors,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/search", post(handle_search))
        .route("/tools/get", post(handle_get))
        .route("/tools/sources", get(handle_sources))
        .route("/tools/list", get(handle_tools_list))
        .route("/tools/call", post(handle_tools_call))
        .route("/enhance", post(handle_enhance))
        .route("/reason", post(handle_reason))
        .route("/audit", get(handle_audit))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %bind_addr, "http server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
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
    code: String,
    message: String,
}

struct AppError {
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

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn confirmation_mismatch(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "confirmation_mismatch".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<GetError> for AppError {
    fn from(e: GetError) -> Self {
        match e {
            GetError::NotFound(id) => not_found(format!("no such document: {id}")),
            GetError::Storage(_) => internal_error(e.to_string()),
        }
    }
}

impl From<SearchError> for AppError {
    fn from(e: SearchError) -> Self {
        internal_error(e.to_string())
    }
}

impl From<ToolError> for AppError {
    fn from(e: ToolError) -> Self {
        match &e {
            ToolError::ToolNotFound(_) => not_found(e.to_string()),
            ToolError::ConfirmationMismatch => confirmation_mismatch(e.to_string()),
            ToolError::MissingParameter(_)
            | ToolError::InvalidParameterType { .. }
            | ToolError::UnknownParameter(_) => bad_request(e.to_string()),
            ToolError::ProcessFailed(..) | ToolError::InvalidOutput(..) | ToolError::Storage(_) => {
                internal_error(e.to_string())
            }
        }
    }
}

// ============ POST /tools/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: i64,
    #[serde(default)]
    types: Vec<DocumentType>,
}

fn default_search_limit() -> i64 {
    12
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<crate::models::SearchResult>,
    search_type: &'static str,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let response = hybrid_search(
        &state.store,
        &state.config,
        state.provider.as_ref(),
        &req.query,
        &req.types,
        req.limit,
    )
    .await?;

    Ok(Json(SearchResponse {
        results: response.results,
        search_type: match response.search_type {
            SearchType::Hybrid => "hybrid",
            SearchType::Bm25Only => "bm25_only",
        },
    }))
}

// ============ POST /tools/get ============

#[derive(Deserialize)]
struct GetRequest {
    id: String,
}

async fn handle_get(
    State(state): State<AppState>,
    Json(req): Json<GetRequest>,
) -> Result<Json<DocumentResponse>, AppError> {
    if req.id.trim().is_empty() {
        return Err(bad_request("id must not be empty"));
    }

    let doc = get_document(&state.store, &req.id).await?;
    Ok(Json(doc))
}

// ============ GET /tools/sources ============

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceStatus>,
}

async fn handle_sources(State(state): State<AppState>) -> Json<SourcesResponse> {
    Json(SourcesResponse {
        sources: list_sources(&state.config, &state.extractors),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolsListResponse {
    tools: Vec<ToolSummary>,
}

async fn handle_tools_list() -> Json<ToolsListResponse> {
    Json(ToolsListResponse {
        tools: crate::tools::catalog_summary(),
    })
}

// ============ POST /tools/call ============

#[derive(Deserialize)]
struct ToolCallRequest {
    tool_name: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    confirm: bool,
    #[serde(default)]
    operation_hash: Option<String>,
    #[serde(default = "new_correlation_id")]
    correlation_id: String,
    #[serde(default = "new_correlation_id")]
    plan_id: String,
    #[serde(default)]
    step_index: i64,
}

fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn handle_tools_call(
    State(state): State<AppState>,
    Json(req): Json<ToolCallRequest>,
) -> Result<Json<CallResult>, AppError> {
    let registry = ToolRegistry::new(&state.store, &state.config, state.provider.as_ref());
    let ctx = CallContext {
        correlation_id: req.correlation_id,
        plan_id: req.plan_id,
        step_index: req.step_index,
    };

    let result = registry
        .call(
            &req.tool_name,
            req.arguments,
            req.confirm,
            req.operation_hash.as_deref(),
            &ctx,
        )
        .await?;

    Ok(Json(result))
}

// ============ POST /enhance ============

#[derive(Deserialize)]
struct EnhanceRequest {
    query: String,
}

async fn handle_enhance(
    State(state): State<AppState>,
    Json(req): Json<EnhanceRequest>,
) -> Result<Json<EnhancedQuery>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let enhanced = enhance::enhance(&state.config, &state.cache, &req.query).await;
    Ok(Json(enhanced))
}

// ============ POST /reason ============

#[derive(Deserialize)]
struct ReasonRequest {
    query: String,
    #[serde(default = "new_correlation_id")]
    plan_id: String,
}

async fn handle_reason(
    State(state): State<AppState>,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<ReasoningOutcome>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let registry = ToolRegistry::new(&state.store, &state.config, state.provider.as_ref());
    let outcome = reasoning::run(&registry, &state.config, &req.query, &req.plan_id).await;
    Ok(Json(outcome))
}

// ============ GET /audit ============

#[derive(Deserialize)]
struct AuditQuery {
    correlation_id: Option<String>,
    plan_id: Option<String>,
}

#[derive(Serialize)]
struct AuditResponse {
    records: Vec<AuditRecord>,
}

async fn handle_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditResponse>, AppError> {
    let records = state
        .store
        .find_audit_records(query.correlation_id.as_deref(), query.plan_id.as_deref())
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(AuditResponse { records }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
