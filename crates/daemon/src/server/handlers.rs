//! HTTP and WebSocket handlers.

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{Message, Notice};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::ApiError;
use super::AppState;
use crate::inventory::Target;
use crate::session::{Connection, Session, SessionDescriptor, SessionOptions, SessionRegistry};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub sessions: usize,
    pub capacity: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContainerList {
    pub containers: Vec<Target>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionDescriptor>,
    pub total: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "ShellPort terminal service is running".to_string(),
        sessions: state.registry.len(),
        capacity: state.registry.max_sessions(),
    })
}

pub async fn list_containers(
    State(state): State<AppState>,
) -> Result<Json<ContainerList>, ApiError> {
    let containers = state.inventory.list()?;
    Ok(Json(ContainerList {
        total: containers.len(),
        containers,
    }))
}

pub async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Target>, ApiError> {
    state
        .inventory
        .get(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("container {id} not found")))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionList> {
    let sessions = state.registry.list_active();
    Json(SessionList {
        total: sessions.len(),
        sessions,
    })
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDescriptor>, ApiError> {
    state
        .registry
        .descriptor(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {id} not found")))
}

/// Force-closes a session.
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.close_and_remove(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("session {id} not found")))
    }
}

/// Terminal route hit without a container id.
pub async fn missing_target() -> ApiError {
    ApiError::BadRequest("container id is required".to_string())
}

/// Opens a terminal on the container named in the path.
///
/// The target is validated before the upgrade, so a bad id gets a plain
/// HTTP error whether or not the client asked for a WebSocket.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let target = validate_target(&state, &id)?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(target_id = %target.id, "Terminal request without WebSocket upgrade");
            return Ok(rejection.into_response());
        }
    };

    let descriptor = state.registry.create_session(&target.id)?;
    info!(
        session_id = %descriptor.id,
        target_id = %target.id,
        "Accepted terminal connection"
    );

    let registry = Arc::clone(&state.registry);
    let failed_registry = Arc::clone(&state.registry);
    let failed_id = descriptor.id.clone();
    let options = state.options.clone();

    Ok(ws
        .on_failed_upgrade(move |e| {
            warn!(session_id = %failed_id, error = %e, "WebSocket upgrade failed");
            failed_registry.remove(&failed_id);
        })
        .on_upgrade(move |socket| run_terminal(socket, registry, descriptor, options)))
}

fn validate_target(state: &AppState, id: &str) -> Result<Target, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("container id is required".to_string()));
    }

    let target = state
        .inventory
        .get(id)?
        .ok_or_else(|| ApiError::NotFound(format!("container {id} not found")))?;

    if !target.status.is_online() {
        return Err(ApiError::TargetUnreachable(target.id));
    }
    Ok(target)
}

/// Bridges one upgraded socket to a new session until the session ends.
async fn run_terminal(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    descriptor: SessionDescriptor,
    options: SessionOptions,
) {
    let id = descriptor.id.clone();
    let mut connection = Connection::from_websocket(socket);

    let greeting = Notice::new(format!("Connected to container {}", descriptor.target_id))
        .with_session(id.clone());
    if let Err(e) = connection.send(Message::System(greeting)).await {
        debug!(session_id = %id, error = %e, "Client left before greeting");
        registry.remove(&id);
        return;
    }

    let started = Session::start(connection, id.clone(), descriptor.target_id, &options).await;
    let session = match started {
        Ok(session) => session,
        Err(e) => {
            error!(session_id = %id, error = %e, "Failed to start terminal session");
            registry.remove(&id);
            return;
        }
    };

    if let Err(e) = registry.attach(&id, Arc::clone(&session)) {
        warn!(session_id = %id, error = %e, "Session closed while starting");
        session.close().await;
        return;
    }

    session.closed().await;
    registry.remove(&id);
    info!(session_id = %id, "Terminal connection finished");
}
