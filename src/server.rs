//! HTTP API for the knowledge base.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/query` | Answer a question, optionally within a session |
//! | `DELETE` | `/sessions/{id}` | Forget a conversation |
//! | `POST`   | `/search` | Ranked document search |
//! | `GET`    | `/documents/{id}` | One document with its chunks |
//! | `GET`    | `/sources` | Configured directories and index state |
//! | `POST`   | `/index/update` | Refresh the index from every source |
//! | `GET`    | `/models` | Models a question may select |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unknown_model` (400),
//! `embeddings_disabled` (400), `not_found` (404),
//! `update_in_progress` (409), `llm_error` (502), `internal` (500).
//!
//! Sessions live in memory and are lost on restart. At most
//! `server.max_sessions` are kept; idle ones expire after
//! `server.session_idle_secs` and the least recently used is dropped when
//! the map is full. Queries on the same session run one at a time, so each
//! sees the previous exchange in its history.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};

use knowbase_core::conversation::ChatHistory;
use knowbase_core::embedding::EmbeddingProvider;
use knowbase_core::search::{parse_since, SearchMode};
use knowbase_core::store::{DocumentResponse, Store};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::ingest::{self, SyncOptions, SyncReport};
use crate::llm::LlmError;
use crate::migrate;
use crate::progress::NoProgress;
use crate::query::{self, QueryAnswer, QueryRequest};
use crate::search::{self, SearchOptions, SearchResultItem};
use crate::sources::{self, SourceStatus};
use crate::sqlite_store::SqliteStore;

struct Session {
    history: Arc<tokio::sync::Mutex<ChatHistory>>,
    last_used: Instant,
}

pub struct AppState {
    config: Config,
    store: SqliteStore,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    sessions: Mutex<HashMap<String, Session>>,
    update_lock: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: SqliteStore,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            sessions: Mutex::new(HashMap::new()),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// History handle for `id`, created on first use.
    ///
    /// Expired sessions are dropped first; a new session on a full map
    /// evicts the least recently used one.
    fn session(&self, id: &str) -> Arc<tokio::sync::Mutex<ChatHistory>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let idle = Duration::from_secs(self.config.server.session_idle_secs);
        sessions.retain(|_, s| now.duration_since(s.last_used) < idle);

        if !sessions.contains_key(id) && sessions.len() >= self.config.server.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                tracing::debug!("evicting session {}", key);
                sessions.remove(&key);
            }
        }

        let session = sessions.entry(id.to_string()).or_insert_with(|| Session {
            history: Arc::default(),
            last_used: now,
        });
        session.last_used = now;
        session.history.clone()
    }

    fn forget_session(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    #[cfg(test)]
    fn session_len(&self, id: &str) -> Option<usize> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(id)
            .and_then(|s| s.history.try_lock().ok().map(|h| h.len()))
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/query", post(handle_query))
        .route("/sessions/{id}", delete(handle_clear_session))
        .route("/search", post(handle_search))
        .route("/documents/{id}", get(handle_get_document))
        .route("/sources", get(handle_sources))
        .route("/index/update", post(handle_update))
        .route("/models", get(handle_models))
        .layer(cors)
        .with_state(state)
}

/// `kb serve`: open the index and serve until the process is stopped.
pub async fn run_server(config: &Config, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| config.server.bind.clone());

    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let embedder: Option<Arc<dyn EmbeddingProvider>> = if config.embedding.is_enabled() {
        Some(Arc::from(embedding::create_provider(&config.embedding)?))
    } else {
        None
    };

    let state = Arc::new(AppState::new(config.clone(), SqliteStore::new(pool), embedder));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on http://{}", bind_addr);
    println!("knowbase server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Errors ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{} {}: {}", self.status.as_u16(), self.code, self.message);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<LlmError>() {
            Some(LlmError::UnknownModel { .. }) => {
                Self::new(StatusCode::BAD_REQUEST, "unknown_model", err.to_string())
            }
            Some(LlmError::MissingApiKey(_)) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
            Some(_) => Self::new(StatusCode::BAD_GATEWAY, "llm_error", err.to_string()),
            None => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                format!("{:#}", err),
            ),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryBody {
    question: String,
    #[serde(default)]
    model: Option<String>,
    /// Keeps history across requests under this id.
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Serialize)]
struct QueryResponse {
    #[serde(flatten)]
    answer: QueryAnswer,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryBody>,
) -> Result<Json<QueryResponse>, AppError> {
    let question = body.question.trim();
    if question.is_empty() {
        return Err(AppError::bad_request("question must not be empty"));
    }

    // Held until the exchange is recorded, so a session's queries run in turn.
    let session = body.session_id.as_deref().map(|id| state.session(id));
    let mut history = match &session {
        Some(h) => Some(h.lock().await),
        None => None,
    };

    let req = QueryRequest {
        question: question.to_string(),
        model: body.model,
        history: history
            .as_ref()
            .map(|h| h.recent(state.config.chat.history_turns))
            .unwrap_or_default(),
        source: body.source,
        mode: None,
    };
    tracing::debug!(
        "query ({} history turns, session {:?})",
        req.history.len(),
        body.session_id
    );
    let answer =
        query::answer_query(&state.config, &state.store, state.embedder.as_deref(), &req).await?;

    if let Some(h) = history.as_mut() {
        h.push_user(question);
        h.push_assistant(&answer.answer);
    }

    Ok(Json(QueryResponse {
        answer,
        session_id: body.session_id,
    }))
}

// ============ DELETE /sessions/{id} ============

async fn handle_clear_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.forget_session(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("no session with id: {}", id)))
    }
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    explain: bool,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResultItem>,
}

async fn handle_search(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    if body.query.trim().is_empty() {
        return Err(AppError::bad_request("query must not be empty"));
    }
    let mode = body
        .mode
        .as_deref()
        .map(SearchMode::from_str)
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    if let Some(m) = mode {
        search::check_mode(&state.config, m).map_err(|e| {
            AppError::new(StatusCode::BAD_REQUEST, "embeddings_disabled", e.to_string())
        })?;
    }
    if let Some(since) = body.since.as_deref() {
        parse_since(since).map_err(|e| AppError::bad_request(e.to_string()))?;
    }
    if matches!(body.limit, Some(l) if l < 1) {
        return Err(AppError::bad_request("limit must be at least 1"));
    }

    let opts = SearchOptions {
        query: body.query,
        mode,
        source: body.source,
        since: body.since,
        limit: body.limit,
        explain: body.explain,
    };
    let results =
        search::search_documents(&state.config, &state.store, state.embedder.as_deref(), &opts)
            .await?;

    Ok(Json(SearchResponse { results }))
}

// ============ GET /documents/{id} ============

async fn handle_get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    match state.store.get_document(&id).await? {
        Some(doc) => Ok(Json(doc)),
        None => Err(AppError::not_found(format!("document not found: {}", id))),
    }
}

// ============ GET /sources ============

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceStatus>,
}

async fn handle_sources(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SourcesResponse>, AppError> {
    let sources = sources::get_sources(&state.config, state.store.pool()).await?;
    Ok(Json(SourcesResponse { sources }))
}

// ============ POST /index/update ============

#[derive(Deserialize, Default)]
struct UpdateBody {
    #[serde(default)]
    full: bool,
}

async fn handle_update(
    State(state): State<Arc<AppState>>,
    body: Option<Json<UpdateBody>>,
) -> Result<Json<SyncReport>, AppError> {
    let Ok(_guard) = state.update_lock.try_lock() else {
        return Err(AppError::new(
            StatusCode::CONFLICT,
            "update_in_progress",
            "an index update is already running",
        ));
    };

    let opts = SyncOptions {
        full: body.map(|Json(b)| b.full).unwrap_or_default(),
        ..Default::default()
    };
    tracing::info!("index update requested (full: {})", opts.full);
    let report = ingest::sync_all(&state.config, &state.store, "all", opts, &NoProgress).await?;

    Ok(Json(report))
}

// ============ GET /models ============

#[derive(Serialize)]
struct ModelsResponse {
    default: String,
    models: Vec<String>,
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        default: state.config.llm.default_model().to_string(),
        models: state.config.llm.available_models(),
    })
}
