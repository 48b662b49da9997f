//! JSON HTTP API.
//!
//! A thin axum layer over the stores and the dispatcher. It resolves the
//! caller's tenant from request headers and maps every error kind to its own
//! status code; all semantics live in the modules it calls.
//!
//! # Tenant Headers
//!
//! | Header | Required | Meaning |
//! |--------|----------|---------|
//! | `x-tenant-id` | yes | tenant every operation is scoped to |
//! | `x-user-id` | no | actor recorded in modification metadata |
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check (returns version and backend) |
//! | `POST`/`GET` | `/contexts` | Create / list contexts |
//! | `GET`/`PUT`/`DELETE` | `/contexts/{id}` | Get / rename / delete a context |
//! | `POST` | `/contexts/{id}/documents` | Register a document |
//! | `POST` | `/contexts/{id}/urls` | Register a URL |
//! | `PUT`/`GET`/`DELETE` | `/contexts/{id}/vector-db` | Bind / get / unbind the vector store |
//! | `GET` | `/documents` | Find documents by criteria |
//! | `GET`/`DELETE` | `/documents/{id}` | Get / delete a document |
//! | `POST` | `/documents/{id}/status` | Advance a document's ingestion status |
//! | `GET` | `/urls` | Find URLs by criteria |
//! | `GET`/`DELETE` | `/urls/{id}` | Get / delete a URL |
//! | `POST` | `/urls/{id}/status` | Advance a URL's ingestion status |
//! | `POST` | `/ai/generate` | Forward a prompt to the LLM backend |
//! | `POST` | `/ai/chat` | Forward a message history to the LLM backend |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "context not found: 42" } }
//! ```
//!
//! Error codes: `missing_tenant` (400), `validation_error` (400),
//! `invalid_request` (400), `not_found` (404), `conflict` (409),
//! `query_error` (500), `internal` (500), `backend_unavailable` (502),
//! `backend_timeout` (504).

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{Config, PaginationConfig};
use crate::db;
use crate::dispatch::{ChatRequest, Dispatcher, GenerateRequest};
use crate::error::{DispatchError, StoreError};
use crate::llm::{create_backend, LlmBackend};
use crate::migrate;
use crate::models::{
    AiContext, IngestionStatus, KnowledgeDocument, KnowledgeFilter, KnowledgeUrl, Page,
    PageResult, Tenant, VectorBinding,
};
use crate::store::Stores;
use crate::vector_binding::BindingSpec;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    stores: Stores,
    dispatcher: Dispatcher,
    pagination: Arc<PaginationConfig>,
}

impl AppState {
    pub fn new(stores: Stores, backend: Arc<dyn LlmBackend>, pagination: PaginationConfig) -> Self {
        let dispatcher = Dispatcher::from_stores(backend, &stores);
        Self {
            stores,
            dispatcher,
            pagination: Arc::new(pagination),
        }
    }

    fn page(&self, number: Option<u32>, size: Option<u32>) -> Page {
        Page::new(
            number.unwrap_or(0),
            size.unwrap_or(self.pagination.default_page_size),
        )
    }
}

/// Starts the HTTP server with the backend named in `[llm]`.
///
/// Runs migrations first, then serves until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let backend = create_backend(&config.llm)?;
    run_server_with_backend(config, backend).await
}

/// Like [`run_server`], with a caller-supplied [`LlmBackend`].
pub async fn run_server_with_backend(
    config: &Config,
    backend: Arc<dyn LlmBackend>,
) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let state = AppState::new(
        Stores::new(pool.clone(), config),
        backend,
        config.pagination.clone(),
    );
    let backend_name = state.dispatcher.backend_name().to_string();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, backend = %backend_name, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.close().await;
    Ok(())
}

/// All routes, with CORS and request tracing.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/contexts", post(create_context).get(list_contexts))
        .route(
            "/contexts/{id}",
            get(get_context).put(rename_context).delete(delete_context),
        )
        .route("/contexts/{id}/documents", post(add_document))
        .route("/contexts/{id}/urls", post(add_url))
        .route(
            "/contexts/{id}/vector-db",
            get(get_binding).put(bind_vector_store).delete(unbind),
        )
        .route("/documents", get(find_documents))
        .route("/documents/{id}", get(get_document).delete(delete_document))
        .route("/documents/{id}/status", post(advance_document_status))
        .route("/urls", get(find_urls))
        .route("/urls/{id}", get(get_url).delete(delete_url))
        .route("/urls/{id}/status", post(advance_url_status))
        .route("/ai/generate", post(generate))
        .route("/ai/chat", post(chat))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"not_found"`, `"conflict"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::Query { .. } | StoreError::Database(_) => {
                tracing::error!(error = %err, "store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        // Store failures keep their own status.
        if let DispatchError::Store(inner) = err {
            return inner.into();
        }
        let status = match &err {
            DispatchError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            DispatchError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::InvalidRequest(_) | DispatchError::Store(_) => StatusCode::BAD_REQUEST,
        };
        AppError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

fn bad_request(code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code,
        message: message.into(),
    }
}

/// Unwrap a JSON body, reporting a malformed one with our error envelope.
fn json_body<T>(
    payload: Result<Json<T>, JsonRejection>,
    code: &'static str,
) -> Result<T, AppError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| bad_request(code, e.body_text()))
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    params
        .map(|Query(v)| v)
        .map_err(|e| bad_request("validation_error", e.body_text()))
}

// ============ Tenant extraction ============

/// The tenant resolved from `x-tenant-id` / `x-user-id`.
pub struct RequestTenant(pub Tenant);

impl<S> FromRequestParts<S> for RequestTenant
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                bad_request(
                    "missing_tenant",
                    format!("request must carry a non-empty {} header", TENANT_HEADER),
                )
            })?;

        let mut tenant = Tenant::new(tenant_id)?;
        if let Some(user) = parts.headers.get(USER_HEADER).and_then(|v| v.to_str().ok()) {
            tenant = tenant.with_user(user.trim());
        }
        Ok(RequestTenant(tenant))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    backend: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.dispatcher.backend_name().to_string(),
    })
}

// ============ Contexts ============

#[derive(Deserialize)]
struct ContextBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct PageParams {
    page: Option<u32>,
    size: Option<u32>,
}

async fn create_context(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    payload: Result<Json<ContextBody>, JsonRejection>,
) -> Result<(StatusCode, Json<AiContext>), AppError> {
    let body = json_body(payload, "validation_error")?;
    let ctx = state
        .stores
        .contexts
        .create_context_with_description(&tenant, &body.name, body.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(ctx)))
}

async fn list_contexts(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    params: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<PageResult<AiContext>>, AppError> {
    let params = query_params(params)?;
    let page = state.page(params.page, params.size);
    Ok(Json(state.stores.contexts.list_contexts(&tenant, page).await?))
}

async fn get_context(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
) -> Result<Json<AiContext>, AppError> {
    Ok(Json(state.stores.contexts.get_context(&tenant, &id).await?))
}

async fn rename_context(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
    payload: Result<Json<ContextBody>, JsonRejection>,
) -> Result<Json<AiContext>, AppError> {
    let body = json_body(payload, "validation_error")?;
    let ctx = state
        .stores
        .contexts
        .rename_context(&tenant, &id, &body.name, body.description.as_deref())
        .await?;
    Ok(Json(ctx))
}

async fn delete_context(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.stores.contexts.delete_context(&tenant, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Knowledge sources ============

#[derive(Deserialize)]
struct DocumentBody {
    name: String,
    document_ref_id: String,
}

#[derive(Deserialize)]
struct UrlBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
    url: String,
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Deserialize)]
struct CriteriaParams {
    context_id: Option<String>,
    status: Option<String>,
    name_prefix: Option<String>,
    page: Option<u32>,
    size: Option<u32>,
}

impl CriteriaParams {
    fn filter(&self) -> Result<KnowledgeFilter, AppError> {
        let status = match self.status.as_deref() {
            Some(s) if !s.trim().is_empty() => Some(s.parse::<IngestionStatus>()?),
            _ => None,
        };
        Ok(KnowledgeFilter {
            context_id: self.context_id.clone(),
            status,
            name_prefix: self.name_prefix.clone(),
        })
    }
}

async fn add_document(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(context_id): Path<String>,
    payload: Result<Json<DocumentBody>, JsonRejection>,
) -> Result<(StatusCode, Json<KnowledgeDocument>), AppError> {
    let body = json_body(payload, "validation_error")?;
    let doc = state
        .stores
        .knowledge
        .add_document(&tenant, &context_id, &body.name, &body.document_ref_id)
        .await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn add_url(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(context_id): Path<String>,
    payload: Result<Json<UrlBody>, JsonRejection>,
) -> Result<(StatusCode, Json<KnowledgeUrl>), AppError> {
    let body = json_body(payload, "validation_error")?;
    let url = state
        .stores
        .knowledge
        .add_url(
            &tenant,
            &context_id,
            &body.name,
            body.description.as_deref(),
            &body.url,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(url)))
}

async fn find_documents(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    params: Result<Query<CriteriaParams>, QueryRejection>,
) -> Result<Json<PageResult<KnowledgeDocument>>, AppError> {
    let params = query_params(params)?;
    let filter = params.filter()?;
    let page = state.page(params.page, params.size);
    let result = state
        .stores
        .knowledge
        .find_documents(&tenant, &filter, page)
        .await?;
    Ok(Json(result))
}

async fn get_document(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeDocument>, AppError> {
    Ok(Json(state.stores.knowledge.get_document(&tenant, &id).await?))
}

async fn delete_document(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.stores.knowledge.delete_document(&tenant, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn advance_document_status(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
    payload: Result<Json<StatusBody>, JsonRejection>,
) -> Result<Json<KnowledgeDocument>, AppError> {
    let status: IngestionStatus = json_body(payload, "validation_error")?.status.parse()?;
    let doc = state
        .stores
        .knowledge
        .advance_document_status(&tenant, &id, status)
        .await?;
    Ok(Json(doc))
}

async fn find_urls(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    params: Result<Query<CriteriaParams>, QueryRejection>,
) -> Result<Json<PageResult<KnowledgeUrl>>, AppError> {
    let params = query_params(params)?;
    let filter = params.filter()?;
    let page = state.page(params.page, params.size);
    let result = state.stores.knowledge.find_urls(&tenant, &filter, page).await?;
    Ok(Json(result))
}

async fn get_url(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeUrl>, AppError> {
    Ok(Json(state.stores.knowledge.get_url(&tenant, &id).await?))
}

async fn delete_url(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.stores.knowledge.delete_url(&tenant, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn advance_url_status(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(id): Path<String>,
    payload: Result<Json<StatusBody>, JsonRejection>,
) -> Result<Json<KnowledgeUrl>, AppError> {
    let status: IngestionStatus = json_body(payload, "validation_error")?.status.parse()?;
    let url = state
        .stores
        .knowledge
        .advance_url_status(&tenant, &id, status)
        .await?;
    Ok(Json(url))
}

// ============ Vector binding ============

#[derive(Deserialize)]
struct BindingBody {
    vdb: String,
    vdb_collection: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn bind_vector_store(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(context_id): Path<String>,
    payload: Result<Json<BindingBody>, JsonRejection>,
) -> Result<Json<VectorBinding>, AppError> {
    let body = json_body(payload, "validation_error")?;
    let spec = BindingSpec {
        vdb: &body.vdb,
        vdb_collection: &body.vdb_collection,
        name: body.name.as_deref(),
        description: body.description.as_deref(),
    };
    let binding = state
        .stores
        .bindings
        .bind_vector_store(&tenant, &context_id, spec)
        .await?;
    Ok(Json(binding))
}

/// `200` with the binding, or `200` with `null` when none is configured.
async fn get_binding(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(context_id): Path<String>,
) -> Result<Json<Option<VectorBinding>>, AppError> {
    state.stores.contexts.get_context(&tenant, &context_id).await?;
    Ok(Json(
        state.stores.bindings.get_binding(&tenant, &context_id).await?,
    ))
}

async fn unbind(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    Path(context_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.stores.bindings.unbind(&tenant, &context_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Generation ============

/// Handler for `POST /ai/generate`.
///
/// Responds with `{ "result": { content, model, finish_reason, usage } }`.
async fn generate(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = json_body(payload, "invalid_request")?;
    let result = state.dispatcher.generate(&tenant, request).await?;
    Ok(Json(serde_json::json!({ "result": result })))
}

/// Handler for `POST /ai/chat`.
async fn chat(
    State(state): State<AppState>,
    RequestTenant(tenant): RequestTenant,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = json_body(payload, "invalid_request")?;
    let result = state.dispatcher.chat(&tenant, request).await?;
    Ok(Json(serde_json::json!({ "result": result })))
}
