//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config_store::Source;
use crate::error::{Error, Result};
use crate::event_store::{EventFilter, ReconcileReport, ReconciliationEntry};
use crate::models::{ApiResponse, Event, EventStatus};
use crate::snapshot_store;
use crate::state::AppState;
use crate::stream_registry::SystemStats;
use crate::stream_worker::{StreamStats, WorkerExit};

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Sources
        .route("/api/sources", get(list_sources))
        // Streams
        .route("/api/streams", get(list_streams))
        .route("/api/streams/:id", get(stream_status))
        .route("/api/streams/:id/start", post(start_stream))
        .route("/api/streams/:id/stop", post(stop_stream))
        // Events
        .route("/api/events", get(list_events))
        .route("/api/events/reconciliation", get(reconciliation_needed))
        .route("/api/events/reconciliation/retry", post(retry_reconciliation))
        .route("/api/events/:id", get(get_event).delete(delete_event))
        .route("/api/events/:id/status", put(set_event_status))
        .route("/api/events/:id/snapshot", get(get_event_snapshot))
        // System
        .route("/api/system/stats", get(system_stats))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Sources & Streams
// ========================================

async fn list_sources(State(state): State<AppState>) -> Json<ApiResponse<Vec<Source>>> {
    Json(ApiResponse::success(state.config_store.list().await))
}

async fn list_streams(State(state): State<AppState>) -> Json<ApiResponse<Vec<StreamStats>>> {
    Json(ApiResponse::success(state.registry.list().await))
}

async fn stream_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StreamStats>>> {
    Ok(Json(ApiResponse::success(state.registry.status(&id).await?)))
}

async fn start_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StreamStats>>> {
    let stats = state.registry.start(&id).await?;
    Ok(Json(ApiResponse::success(stats)))
}

#[derive(Debug, Serialize)]
struct StopResponse {
    source_id: String,
    exit: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

async fn stop_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StopResponse>>> {
    let exit = state.registry.stop(&id).await?;
    let (exit, last_error) = match exit {
        WorkerExit::Stopped => ("stopped", None),
        WorkerExit::SourceEnded => ("source_ended", None),
        WorkerExit::Errored { last_error, .. } => ("errored", Some(last_error)),
    };
    Ok(Json(ApiResponse::success(StopResponse {
        source_id: id,
        exit,
        last_error,
    })))
}

async fn system_stats(State(state): State<AppState>) -> Result<Json<ApiResponse<SystemStats>>> {
    Ok(Json(ApiResponse::success(state.registry.system_stats().await?)))
}

// ========================================
// Events
// ========================================

#[derive(Debug, Deserialize)]
struct EventQuery {
    source_id: Option<String>,
    status: Option<EventStatus>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<Json<ApiResponse<Vec<Event>>>> {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(Error::Validation("`from` must not be after `to`".into()));
        }
    }

    let filter = EventFilter {
        source_id: query.source_id,
        status: query.status,
        from: query.from,
        to: query.to,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);

    let events = state.events.list_limited(filter, limit).await?;
    Ok(Json(ApiResponse::success(events)))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<ApiResponse<Event>>> {
    Ok(Json(ApiResponse::success(state.events.get(id).await?)))
}

#[derive(Debug, Deserialize)]
struct SetStatusRequest {
    status: EventStatus,
}

async fn set_event_status(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<ApiResponse<Event>>> {
    let event = state.events.set_status(id, req.status).await?;
    Ok(Json(ApiResponse::success(event)))
}

async fn delete_event(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Json<ApiResponse<uuid::Uuid>>> {
    state.events.delete(id).await?;
    Ok(Json(ApiResponse::success(id)))
}

async fn reconciliation_needed(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ReconciliationEntry>>> {
    Json(ApiResponse::success(state.events.reconciliation_needed().await))
}

async fn retry_reconciliation(State(state): State<AppState>) -> Json<ApiResponse<ReconcileReport>> {
    Json(ApiResponse::success(state.events.reconcile().await))
}

/// Best frame of an event as an image
async fn get_event_snapshot(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Response> {
    let event = state.events.get(id).await?;
    let path = event
        .snapshot_path
        .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;
    let data = state.snapshots.load(&path).await?;
    Ok((
        [(header::CONTENT_TYPE, snapshot_store::content_type(&path))],
        data,
    )
        .into_response())
}

// ========================================
// WebSocket Handler
// ========================================

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let peer = uuid::Uuid::new_v4().to_string();
    let (conn_id, mut rx) = state.realtime.register(peer).await;

    // Forward hub messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // Incoming messages are ignored apart from close
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.realtime.unregister(&conn_id).await;
}
