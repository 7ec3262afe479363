//! WebSocket + REST endpoints for the approval gate.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GateError;
use crate::gate::{ApprovalGate, GateDecision, GateEvent};
use crate::item::Stage;
use crate::store::PipelineStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<ApprovalGate>,
    pub store: Arc<dyn PipelineStore>,
}

/// Build the Axum router with gate WebSocket and REST routes.
pub fn gate_routes(gate: Arc<ApprovalGate>, store: Arc<dyn PipelineStore>) -> Router {
    let state = AppState { gate, store };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/items", get(list_items))
        .route("/api/items/{id}", get(get_item))
        .route("/api/items/{id}/approve", post(approve_item))
        .route("/api/items/{id}/reject", post(reject_item))
        .route("/api/items/{id}/defer", post(defer_item))
        .route("/api/items/{id}/resubmit", post(resubmit_item))
        .route("/api/items/{id}/retry", post(retry_item))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health & stats ──────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ops-assist-gate"
    }))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.counts_by_stage().await {
        Ok(counts) => {
            let mut body = serde_json::Map::new();
            for (stage, count) in counts {
                body.insert(stage.to_string(), serde_json::json!(count));
            }
            Json(serde_json::Value::Object(body)).into_response()
        }
        Err(e) => {
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ── Items ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    /// Stage filter; defaults to pending_approval.
    stage: Option<String>,
}

async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let stage: Stage = match query
        .stage
        .as_deref()
        .unwrap_or("pending_approval")
        .parse()
    {
        Ok(stage) => stage,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    match state.store.items_in_stage(stage, 500).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_item(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let item = match state.store.get_item(id).await {
        Ok(Some(item)) => item,
        Ok(None) => return (StatusCode::NOT_FOUND, "item not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let audit = state.store.audit_for_item(id).await.unwrap_or_default();

    Json(serde_json::json!({
        "item": item,
        "audit": audit,
    }))
    .into_response()
}

// ── Decisions ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DecisionBody {
    /// Who is deciding; defaults to "anonymous".
    user: Option<String>,
    /// Rejection feedback.
    feedback: Option<String>,
}

fn user_of(body: &Option<Json<DecisionBody>>) -> String {
    body.as_ref()
        .and_then(|b| b.user.clone())
        .unwrap_or_else(|| "anonymous".into())
}

fn gate_error_response(e: GateError) -> axum::response::Response {
    match e {
        GateError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        GateError::StaleDecision { .. } | GateError::NotPending { .. } => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        GateError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn approve_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionBody>>,
) -> impl IntoResponse {
    let user = user_of(&body);
    match state.gate.decide(id, GateDecision::Approve, &user).await {
        Ok(stage) => Json(serde_json::json!({"id": id, "stage": stage})).into_response(),
        Err(e) => gate_error_response(e),
    }
}

async fn reject_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionBody>>,
) -> impl IntoResponse {
    let user = user_of(&body);
    let feedback = body
        .as_ref()
        .and_then(|b| b.feedback.clone())
        .unwrap_or_default();
    match state
        .gate
        .decide(id, GateDecision::Reject { feedback }, &user)
        .await
    {
        Ok(stage) => Json(serde_json::json!({"id": id, "stage": stage})).into_response(),
        Err(e) => gate_error_response(e),
    }
}

async fn defer_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionBody>>,
) -> impl IntoResponse {
    let user = user_of(&body);
    match state.gate.decide(id, GateDecision::Defer, &user).await {
        Ok(stage) => Json(serde_json::json!({"id": id, "stage": stage})).into_response(),
        Err(e) => gate_error_response(e),
    }
}

async fn resubmit_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionBody>>,
) -> impl IntoResponse {
    let user = user_of(&body);
    match state.gate.resubmit(id, &user).await {
        Ok(()) => Json(serde_json::json!({"id": id, "stage": Stage::Planned})).into_response(),
        Err(e) => gate_error_response(e),
    }
}

async fn retry_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionBody>>,
) -> impl IntoResponse {
    let user = user_of(&body);
    match state.gate.retry_failed(id, &user).await {
        Ok(()) => Json(serde_json::json!({"id": id, "stage": Stage::Approved})).into_response(),
        Err(e) => gate_error_response(e),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

/// Actions a WS client can send.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WsAction {
    Approve {
        item_id: Uuid,
        #[serde(default)]
        user: Option<String>,
    },
    Reject {
        item_id: Uuid,
        feedback: String,
        #[serde(default)]
        user: Option<String>,
    },
    Defer {
        item_id: Uuid,
        #[serde(default)]
        user: Option<String>,
    },
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Gate WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("Gate WebSocket client connected");

    // Send all pending items on connect.
    let pending = state.gate.pending().await.unwrap_or_default();
    let sync = GateEvent::PendingSync { items: pending };
    if let Ok(json) = serde_json::to_string(&sync)
        && socket.send(Message::Text(json.into())).await.is_err()
    {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    let mut rx = state.gate.subscribe();

    loop {
        tokio::select! {
            // Forward broadcast events to this client.
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event)
                            && socket.send(Message::Text(json.into())).await.is_err()
                        {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        let pending = state.gate.pending().await.unwrap_or_default();
                        let sync = GateEvent::PendingSync { items: pending };
                        if let Ok(json) = serde_json::to_string(&sync)
                            && socket.send(Message::Text(json.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            // Receive decisions from the client.
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_action(&text, &state).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Gate WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_client_action(text: &str, state: &AppState) {
    let action: WsAction = match serde_json::from_str(text) {
        Ok(action) => action,
        Err(e) => {
            warn!(error = %e, "Invalid WS action");
            return;
        }
    };

    let result = match action {
        WsAction::Approve { item_id, user } => {
            state
                .gate
                .decide(
                    item_id,
                    GateDecision::Approve,
                    user.as_deref().unwrap_or("anonymous"),
                )
                .await
        }
        WsAction::Reject {
            item_id,
            feedback,
            user,
        } => {
            state
                .gate
                .decide(
                    item_id,
                    GateDecision::Reject { feedback },
                    user.as_deref().unwrap_or("anonymous"),
                )
                .await
        }
        WsAction::Defer { item_id, user } => {
            state
                .gate
                .decide(
                    item_id,
                    GateDecision::Defer,
                    user.as_deref().unwrap_or("anonymous"),
                )
                .await
        }
    };

    if let Err(e) = result {
        warn!(error = %e, "WS decision failed");
    }
}
