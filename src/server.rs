//! Public read API.
//!
//! Serves the archive and the search index over HTTP. The server never
//! talks to the upstream source or to object storage; everything it
//! returns comes from the local archive (the system of record) and the
//! derived search index.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Welcome message and route list |
//! | `GET`  | `/works/` | Paginated list of published works |
//! | `GET`  | `/works/{id}/` | One published work |
//! | `GET`  | `/search/` | Full-text search |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! List and search responses use the same envelope:
//!
//! ```json
//! { "count": 123, "next": "...?page=3", "previous": "...?page=1", "results": [] }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; this is a public
//! read-only API consumed by browsers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::archive::ArchiveStore;
use crate::config::Config;
use crate::error::IndexError;
use crate::index::{SearchIndex, SearchQuery};
use crate::models::{ListPage, Work};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    archive: Arc<ArchiveStore>,
    index: Arc<dyn SearchIndex>,
}

impl AppState {
    pub fn new(config: Arc<Config>, archive: Arc<ArchiveStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            config,
            archive,
            index,
        }
    }
}

/// Builds the router with all routes and the CORS layer. Exposed so
/// integration tests can serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/works/", get(handle_list_works))
        .route("/works/{id}/", get(handle_get_work))
        .route("/search/", get(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the read API server on `[server].bind`. Runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let archive = Arc::new(ArchiveStore::new(&config.archive.root)?);
    let index: Arc<dyn SearchIndex> =
        Arc::new(crate::index::FtsIndex::open(&config.search.db_path).await?);
    let state = AppState::new(Arc::new(config.clone()), archive, index);

    let app = router(state);

    println!("Read API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

fn service_unavailable(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: message.into(),
    }
}

/// Maps an index failure to the right status: a rejected field filter is
/// the client's problem, anything else means the index is not serving.
fn classify_index_error(err: IndexError) -> ApiError {
    match err {
        IndexError::UnknownField { .. } => bad_request(err.to_string()),
        other => service_unavailable(format!("Search is temporarily unavailable: {}", other)),
    }
}

// ============ GET / ============

/// Handler for `GET /`. A welcome message and the route list, for humans
/// poking at the API root.
async fn handle_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Welcome to the collection API.",
        "api": ["/works/", "/works/{id}/", "/search/?query=<terms>"],
    }))
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

// ============ GET /works/ ============

#[derive(Deserialize)]
struct ListParams {
    page: Option<u32>,
}

/// Handler for `GET /works/?page=N`.
///
/// Pages through published works in ascending id order. Tombstoned works
/// are never listed.
async fn handle_list_works(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListPage<Work>>, ApiError> {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = state.config.search.page_size as usize;

    let works = state
        .archive
        .list_published()
        .map_err(|e| internal(e.to_string()))?;
    let count = works.len() as u64;

    let start = (page as usize - 1) * page_size;
    let results: Vec<Work> = works.into_iter().skip(start).take(page_size).collect();

    let base = state.config.server.base_url.trim_end_matches('/');
    let last_page = (count as usize).div_ceil(page_size).max(1) as u32;
    let next = (page < last_page).then(|| format!("{}/works/?page={}", base, page + 1));
    let previous = (page > 1 && page <= last_page).then(|| format!("{}/works/?page={}", base, page - 1));

    Ok(Json(ListPage {
        count,
        next,
        previous,
        results,
    }))
}

// ============ GET /works/{id}/ ============

/// Handler for `GET /works/{id}/`.
///
/// A tombstoned work returns the same 404 as one that never existed.
async fn handle_get_work(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Work>, ApiError> {
    let work = state
        .archive
        .read(id)
        .map_err(|e| internal(e.to_string()))?
        .filter(|w| !w.unpublished)
        .ok_or_else(|| not_found(format!("Work ID {} doesn't exist, sorry.", id)))?;
    Ok(Json(work))
}

// ============ GET /search/ ============

#[derive(Deserialize)]
struct SearchParams {
    query: Option<String>,
    field: Option<String>,
    page: Option<u32>,
    size: Option<u32>,
}

/// Handler for `GET /search/?query=<terms>&field=<col>&page=N&size=M`.
///
/// `size` is capped at the configured maximum rather than rejected.
async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<ListPage<Work>>, ApiError> {
    let query = params
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| {
            bad_request("Please include a 'query' parameter, e.g. /search/?query=mad+max")
        })?;

    let page = params.page.unwrap_or(1).max(1);
    let size = params
        .size
        .unwrap_or(state.config.search.page_size)
        .clamp(1, state.config.search.max_page_size);

    let results = state
        .index
        .search(&SearchQuery {
            query: query.to_string(),
            field: params.field.clone(),
            page,
            page_size: size,
        })
        .await
        .map_err(classify_index_error)?;

    let base = state.config.server.base_url.trim_end_matches('/');
    let encoded = urlencode(query);
    let field_param = params
        .field
        .as_deref()
        .map(|f| format!("&field={}", urlencode(f)))
        .unwrap_or_default();
    let link = |p: u32| {
        format!(
            "{}/search/?query={}{}&page={}&size={}",
            base, encoded, field_param, p, size
        )
    };

    let last_page = (results.count as usize).div_ceil(size as usize).max(1) as u32;
    let next = (page < last_page).then(|| link(page + 1));
    let previous = (page > 1 && page <= last_page).then(|| link(page - 1));

    Ok(Json(ListPage {
        count: results.count,
        next,
        previous,
        results: results.results,
    }))
}

/// Minimal percent-encoding for query-string values.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
