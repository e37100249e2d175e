//! HTTP adapter.
//!
//! A thin Axum surface over the pipeline. Komorebi's real interface is the
//! library; these routes exist so editors, dashboards, and scripts can
//! capture and observe without linking Rust.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/capture` | Accept a chunk; returns it at `inbox` |
//! | `GET`  | `/events` | SSE stream of pipeline events |
//! | `GET`  | `/chunks` | List/search chunks |
//! | `GET`  | `/chunks/{id}` | Fetch one chunk |
//! | `GET`  | `/chunks/{id}/related` | TF-IDF related chunks |
//! | `POST` | `/bulk` | Apply a bulk action |
//! | `POST` | `/bulk/{id}/undo` | Undo a bulk action |
//! | `GET`  | `/mcp/tools` | Flattened tool catalogue |
//! | `POST` | `/mcp/call` | Invoke a tool, optionally capturing |
//! | `GET`  | `/health` | Liveness and version |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "queue_full", "message": "task queue is full" } }
//! ```
//!
//! `queue_full` maps to 429 (retryable), `validation` to 400, `not_found`
//! to 404, `server_not_ready` and `unavailable` to 503.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::app::App;
use crate::error::Error;
use crate::models::{BulkActionType, ChunkDraft};
use crate::similarity;
use crate::store::{ChunkFilter, ChunkSearch, Page};

#[derive(Clone)]
struct AppState {
    app: Arc<App>,
}

/// Serve the HTTP API until the process is terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let state = AppState { app };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/capture", post(handle_capture))
        .route("/events", get(handle_events))
        .route("/chunks", get(handle_chunks))
        .route("/chunks/{id}", get(handle_chunk))
        .route("/chunks/{id}/related", get(handle_related))
        .route("/bulk", post(handle_bulk))
        .route("/bulk/{id}/undo", post(handle_bulk_undo))
        .route("/mcp/tools", get(handle_mcp_tools))
        .route("/mcp/call", post(handle_mcp_call))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "http server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Error::QueueFull => (StatusCode::TOO_MANY_REQUESTS, "queue_full"),
            Error::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            Error::ServerNotReady(_) => (StatusCode::SERVICE_UNAVAILABLE, "server_not_ready"),
            Error::Timeout { .. } | Error::ToolTimeout(_) => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout")
            }
            Error::TransportLost(_) => (StatusCode::BAD_GATEWAY, "transport_lost"),
            Error::InvalidResponse(_) => (StatusCode::BAD_GATEWAY, "invalid_response"),
            Error::StorageUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_unavailable")
            }
            Error::UndoWindowExpired(_) => (StatusCode::GONE, "undo_window_expired"),
        };
        let body = serde_json::json!({
            "error": { "code": code, "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

async fn handle_capture(
    State(state): State<AppState>,
    Json(draft): Json<ChunkDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let chunk = state.app.capture.capture(draft).await?;
    Ok((StatusCode::CREATED, Json(chunk)))
}

async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let keepalive_secs = state.app.config.events.keepalive_secs;
    let subscription = state.app.bus.subscribe();

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await;
        let sse = SseEvent::default()
            .event(event.kind.as_str())
            .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string()));
        Some((Ok(sse), subscription))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(keepalive_secs))
            .text("keep-alive"),
    )
}

#[derive(Deserialize)]
struct ChunksQuery {
    q: Option<String>,
    status: Option<String>,
    project_id: Option<Uuid>,
    entity_type: Option<String>,
    entity_value: Option<String>,
    tag: Option<String>,
    created_after: Option<chrono::DateTime<chrono::Utc>>,
    created_before: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn handle_chunks(
    State(state): State<AppState>,
    Query(query): Query<ChunksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            crate::models::ChunkStatus::parse(s)
                .ok_or_else(|| Error::Validation(format!("unknown status: {s}")))
        })
        .transpose()?;
    let entity_type = query
        .entity_type
        .as_deref()
        .map(|t| {
            crate::models::EntityType::parse(t)
                .ok_or_else(|| Error::Validation(format!("unknown entity type: {t}")))
        })
        .transpose()?;
    let page = Page {
        limit: query.limit,
        offset: query.offset,
    };

    let wants_search = query.q.is_some()
        || entity_type.is_some()
        || query.entity_value.is_some()
        || query.created_after.is_some()
        || query.created_before.is_some();
    let (items, total) = if wants_search {
        state
            .app
            .store
            .search_chunks(
                &ChunkSearch {
                    query: query.q,
                    status,
                    project_id: query.project_id,
                    entity_type,
                    entity_value: query.entity_value,
                    created_after: query.created_after,
                    created_before: query.created_before,
                },
                page,
            )
            .await?
    } else {
        state
            .app
            .store
            .list_chunks(
                &ChunkFilter {
                    status,
                    project_id: query.project_id,
                    tag: query.tag,
                    ..Default::default()
                },
                page,
            )
            .await?
    };

    Ok(Json(serde_json::json!({ "items": items, "total": total })))
}

async fn handle_chunk(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let chunk = state.app.store.get_chunk(id).await?;
    Ok(Json(chunk))
}

#[derive(Deserialize)]
struct RelatedQuery {
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    5
}

async fn handle_related(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<RelatedQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let related = similarity::find_related(state.app.store.as_ref(), id, query.top_k).await?;
    Ok(Json(related))
}

#[derive(Deserialize)]
struct BulkRequest {
    action: String,
    #[serde(default)]
    filter: ChunkFilter,
    #[serde(default)]
    tags: Vec<String>,
}

async fn handle_bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let action_type = BulkActionType::parse(&request.action)
        .ok_or_else(|| Error::Validation(format!("unknown bulk action: {}", request.action)))?;
    let tags = if request.tags.is_empty() {
        None
    } else {
        Some(request.tags.as_slice())
    };
    let action = state.app.bulk.apply(action_type, &request.filter, tags).await?;
    Ok(Json(action))
}

async fn handle_bulk_undo(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let restored = state.app.bulk.undo(id).await?;
    Ok(Json(serde_json::json!({ "restored": restored })))
}

async fn handle_mcp_tools(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mcp = state
        .app
        .mcp
        .as_ref()
        .ok_or(Error::Unavailable("mcp"))?;
    let tools: Vec<serde_json::Value> = mcp
        .list_tools()
        .await
        .into_iter()
        .map(|(server, tool)| {
            serde_json::json!({
                "server": server,
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect();
    Ok(Json(tools))
}

#[derive(Deserialize)]
struct McpCallRequest {
    server: String,
    tool: String,
    #[serde(default)]
    arguments: serde_json::Value,
    #[serde(default)]
    capture: bool,
    #[serde(default)]
    project_id: Option<Uuid>,
}

async fn handle_mcp_call(
    State(state): State<AppState>,
    Json(request): Json<McpCallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mcp = state
        .app
        .mcp
        .as_ref()
        .ok_or(Error::Unavailable("mcp"))?;
    let outcome = mcp
        .call_tool(
            &request.server,
            &request.tool,
            request.arguments,
            request.capture,
            request.project_id,
        )
        .await?;
    Ok(Json(serde_json::json!({
        "result": outcome.result,
        "captured_chunk_id": outcome.captured_chunk_id,
    })))
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
