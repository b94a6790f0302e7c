//! WebSocket event stream.
//!
//! Clients authenticate like any other caller (bearer api-key or trusted
//! headers; an `api_key` query parameter is accepted for browsers). Each
//! client only receives events for executions it may view; `refresh`
//! recomputes that set on demand.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;
use std::collections::HashSet;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use super::auth::{identity_from_api_key, identity_from_headers};
use super::state::AppState;
use crate::domain::models::{CallerIdentity, ExecutionStatus, Role};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub api_key: Option<String>,
}

pub async fn events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let identity = match &params.api_key {
        Some(key) => identity_from_api_key(key, &state.api_keys),
        None => identity_from_headers(&headers, &state.api_keys),
    };
    match identity {
        Ok(identity) => {
            ws.on_upgrade(move |socket| handle_events(socket, state, identity)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// Executions this identity may watch. `None` means unrestricted.
async fn accessible_executions(
    state: &AppState,
    identity: &CallerIdentity,
) -> Option<HashSet<Uuid>> {
    if identity.role != Role::Viewer {
        return None;
    }
    let mut accessible = HashSet::new();
    let statuses = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Paused,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];
    match state.executions.list_by_status(&statuses).await {
        Ok(executions) => {
            for execution in executions {
                if execution.owner_user == identity.user_id
                    || execution.owner_team == identity.team
                {
                    accessible.insert(execution.id);
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to compute accessible executions"),
    }
    Some(accessible)
}

/// Lazily admit executions created after the set was computed.
async fn may_view(
    state: &AppState,
    identity: &CallerIdentity,
    accessible: &mut Option<HashSet<Uuid>>,
    execution_id: Uuid,
) -> bool {
    let Some(set) = accessible else {
        return true;
    };
    if set.contains(&execution_id) {
        return true;
    }
    match state.executions.get(execution_id).await {
        Ok(Some(execution))
            if execution.owner_user == identity.user_id
                || execution.owner_team == identity.team =>
        {
            set.insert(execution_id);
            true
        }
        _ => false,
    }
}

async fn handle_events(mut socket: WebSocket, state: AppState, identity: CallerIdentity) {
    let mut receiver = state.bus.subscribe();
    let mut accessible = accessible_executions(&state, &identity).await;

    let connected = serde_json::json!({ "type": "connected", "user": identity.user_id });
    if socket.send(Message::Text(connected.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = receiver.recv() => {
                match event {
                    Ok(envelope) => {
                        if !may_view(&state, &identity, &mut accessible, envelope.execution_id).await {
                            continue;
                        }
                        let json = serde_json::to_string(&envelope).unwrap_or_default();
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => {
                        let notice = format!("{{\"type\":\"lagged\",\"missed_events\":{n}}}");
                        if socket.send(Message::Text(notice.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match text.as_str().trim() {
                            "ping" | "{\"type\":\"ping\"}" => {
                                let pong = "{\"type\":\"pong\"}".to_string();
                                if socket.send(Message::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                            "refresh" | "{\"type\":\"refresh\"}" => {
                                accessible = accessible_executions(&state, &identity).await;
                                let ack = "{\"type\":\"refreshed\"}".to_string();
                                if socket.send(Message::Text(ack.into())).await.is_err() {
                                    break;
                                }
                            }
                            other => debug!(message = other, "ignoring unknown ws command"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
}
