use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gutensearch_core::persist::{load_snapshot, load_text, IndexPaths};
use gutensearch_core::{
    DocId, EngineConfig, EngineError, MatchMode, QueryPool, QueryService, RankingStrategy, SearchRequest,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

const DEFAULT_TOP_N: usize = 5;

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub ranking: String,
    #[serde(default)]
    pub mode: String,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct RegexParams {
    #[serde(default)]
    pub regex: String,
    #[serde(default)]
    pub ranking: String,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct SuggestParams {
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

#[derive(Deserialize)]
pub struct TopN {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_top_n() -> usize { DEFAULT_TOP_N }

#[derive(Clone)]
pub struct AppState {
    pub pool: QueryPool,
    pub paths: Arc<IndexPaths>,
}

/// Failure of one request; engine errors keep their own status.
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    NotFound(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self { ApiError::Engine(e) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", what),
            ApiError::Engine(e) => {
                let status = match &e {
                    EngineError::MalformedQuery { .. }
                    | EngineError::InvalidParameter { .. }
                    | EngineError::InvalidPattern { .. } => StatusCode::BAD_REQUEST,
                    EngineError::PatternTimeout { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    EngineError::ServiceBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.kind(), e.to_string())
            }
        };
        if status.is_server_error() {
            tracing::warn!(%status, kind, %message, "request failed");
        }
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Loads the snapshot under `index_dir` and wires the query pool into a router.
pub fn build_app<P: Into<PathBuf>>(index_dir: P, mut config: EngineConfig) -> Result<Router> {
    let paths = IndexPaths::new(index_dir.into());
    let snap = load_snapshot(&paths)?;
    // queries are tokenized the way the corpus was
    config.tokenizer = snap.meta.tokenizer.clone();
    let service = QueryService::new(Arc::new(snap.index), Arc::new(snap.graph), &config)?;
    let pool = QueryPool::new(Arc::new(service), &config.pool)?;
    tracing::info!(workers = config.pool.workers, capacity = pool.capacity(), "query pool ready");
    Ok(router(AppState { pool, paths: Arc::new(paths) }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/search", get(search_handler))
        .route("/advanced-search", get(advanced_search_handler))
        .route("/suggestions", get(suggestions_handler))
        .route("/suggest/:doc_id", get(suggest_handler))
        .route("/book/:doc_id", get(book_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// CORS_ALLOW_ORIGIN is a comma-separated origin list; unset or unparsable allows any.
fn cors_layer() -> CorsLayer {
    let origins: Vec<_> = std::env::var("CORS_ALLOW_ORIGIN")
        .map(|val| val.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default();
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

fn strategy(raw: &str) -> Result<RankingStrategy, EngineError> { raw.parse() }

/// Liveness plus the size of the loaded snapshot. Answered without a pool slot.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let svc = state.pool.service();
    Json(json!({
        "status": "ok",
        "books_count": svc.index().num_docs(),
        "vocabulary_size": svc.index().num_terms(),
        "graph_nodes": svc.graph().node_count(),
        "graph_edges": svc.graph().edge_count(),
    }))
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<gutensearch_core::SearchResponse> {
    let mut request = SearchRequest::keyword(params.query)
        .with_strategy(strategy(&params.ranking)?)
        .with_mode(params.mode.parse::<MatchMode>()?);
    request.limit = params.limit;
    Ok(Json(state.pool.search(request).await?))
}

pub async fn advanced_search_handler(
    State(state): State<AppState>,
    Query(params): Query<RegexParams>,
) -> ApiResult<gutensearch_core::SearchResponse> {
    let mut request = SearchRequest::pattern(params.regex).with_strategy(strategy(&params.ranking)?);
    request.limit = params.limit;
    Ok(Json(state.pool.search(request).await?))
}

pub async fn suggestions_handler(
    State(state): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> ApiResult<gutensearch_core::SuggestionResponse> {
    let SuggestParams { query, top_n } = params;
    let resp = state.pool.run(move |svc, _| svc.suggest_for_query(&query, top_n)).await?;
    Ok(Json(resp))
}

pub async fn suggest_handler(
    State(state): State<AppState>,
    Path(doc_id): Path<DocId>,
    Query(params): Query<TopN>,
) -> ApiResult<serde_json::Value> {
    let top_n = params.top_n;
    let similar = state.pool.run(move |svc, _| Ok(svc.similar(doc_id, top_n))).await?;
    let similar = similar.ok_or_else(|| ApiError::NotFound(format!("document {doc_id}")))?;
    Ok(Json(json!({ "doc_id": doc_id, "suggestions": similar })))
}

pub async fn book_handler(State(state): State<AppState>, Path(doc_id): Path<DocId>) -> ApiResult<serde_json::Value> {
    let paths = Arc::clone(&state.paths);
    let found = state
        .pool
        .run(move |svc, _| {
            let Some(info) = svc.document_info(doc_id) else { return Ok(None) };
            // a missing or unreadable copy only drops the text field
            let text = load_text(&paths, doc_id).unwrap_or_else(|e| {
                tracing::warn!(doc_id, error = %e, "book text unavailable");
                None
            });
            Ok(Some((info, text)))
        })
        .await?;
    let (info, text) = found.ok_or_else(|| ApiError::NotFound(format!("document {doc_id}")))?;
    let mut obj = json!(info);
    if let Some(text) = text {
        obj["text"] = serde_json::Value::String(text);
    }
    Ok(Json(obj))
}

pub async fn stats_handler(State(state): State<AppState>) -> ApiResult<gutensearch_core::Stats> {
    Ok(Json(state.pool.run(|svc, _| Ok(svc.stats())).await?))
}
