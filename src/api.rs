use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::registry::SessionRegistry;
use crate::rendezvous::Rendezvous;
use crate::session::{short_fp, Session};

/// Everything the handlers need: the rendezvous service, the registry (for
/// session completion), and the advertised data-plane port.
#[derive(Clone)]
pub struct ApiState {
    pub rendezvous: Arc<Rendezvous>,
    pub registry: Arc<SessionRegistry>,
    pub socket_port: u16,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/relay/serve", post(serve))
        .route("/api/relay/listen", post(listen))
        .route("/api/relay/session/:session_id", delete(complete_session))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

// Request fields are all optional so that missing ones produce our own 400
// with a message naming the field, not a deserializer rejection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServeRequest {
    pub sender_fp: Option<String>,
    pub receiver_fp: Option<String>,
    pub filename: Option<String>,
    pub file_size: Option<i64>,
    pub signature: Option<String>,
    pub file_hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServeResponse {
    pub status: String,
    pub session_id: Option<String>,
    pub socket_port: u16,
    pub message: String,
    pub expires_in: u64,
}

impl ServeResponse {
    fn error(status: &str, message: impl Into<String>) -> Self {
        ServeResponse {
            status: status.to_string(),
            session_id: None,
            socket_port: 0,
            message: message.into(),
            expires_in: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenRequest {
    pub receiver_fp: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenResponse {
    pub status: String,
    pub session_id: Option<String>,
    pub sender_fp: Option<String>,
    pub filename: Option<String>,
    pub file_size: u64,
    pub signature: Option<String>,
    pub file_hash: Option<String>,
    pub socket_port: u16,
    pub message: String,
}

impl ListenResponse {
    fn error(status: &str, message: impl Into<String>) -> Self {
        ListenResponse {
            status: status.to_string(),
            session_id: None,
            sender_fp: None,
            filename: None,
            file_size: 0,
            signature: None,
            file_hash: None,
            socket_port: 0,
            message: message.into(),
        }
    }

    fn matched(session: &Session, socket_port: u16) -> Self {
        ListenResponse {
            status: "matched".to_string(),
            session_id: Some(session.session_id.clone()),
            sender_fp: Some(session.sender_fp.clone()),
            filename: Some(session.filename.clone()),
            file_size: session.file_size,
            signature: Some(session.signature.clone()),
            file_hash: Some(session.file_hash.clone()),
            socket_port,
            message: format!("Incoming transfer from {}", short_fp(&session.sender_fp)),
        }
    }
}

/// Sender entry point. Blocks until the receiver shows up or the rendezvous
/// timeout fires.
async fn serve(
    State(state): State<ApiState>,
    Json(req): Json<ServeRequest>,
) -> (StatusCode, Json<ServeResponse>) {
    if let Some(fp) = req.sender_fp.as_deref() {
        info!("Serve request from sender {}", short_fp(fp));
    }

    let file_size = req.file_size.unwrap_or(0);
    if file_size < 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(ServeResponse::error("error", "Invalid file size")),
        );
    }

    let result = state
        .rendezvous
        .initiate(
            req.sender_fp.as_deref().unwrap_or(""),
            req.receiver_fp.as_deref().unwrap_or(""),
            req.filename.as_deref().unwrap_or(""),
            file_size as u64,
            req.signature.as_deref().unwrap_or(""),
            req.file_hash.as_deref().unwrap_or(""),
        )
        .await;

    match result {
        Ok(session) => (
            StatusCode::OK,
            Json(ServeResponse {
                status: "matched".to_string(),
                session_id: Some(session.session_id.clone()),
                socket_port: state.socket_port,
                message: "Receiver accepted, proceeding to socket transfer.".to_string(),
                expires_in: session.expires_in_ms(),
            }),
        ),
        Err(RelayError::InvalidArgument(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(ServeResponse::error("error", msg)),
        ),
        Err(err @ RelayError::Timeout(_)) => (
            StatusCode::REQUEST_TIMEOUT,
            Json(ServeResponse::error("timeout", err.to_string())),
        ),
        Err(err) => {
            error!("Serve failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ServeResponse::error("error", err.to_string())),
            )
        }
    }
}

/// Receiver entry point. Blocks until a sender initiates a transfer for this
/// fingerprint or the rendezvous timeout fires.
async fn listen(
    State(state): State<ApiState>,
    Json(req): Json<ListenRequest>,
) -> (StatusCode, Json<ListenResponse>) {
    if let Some(fp) = req.receiver_fp.as_deref() {
        info!("Listen request from receiver {}", short_fp(fp));
    }

    let result = state
        .rendezvous
        .listen(req.receiver_fp.as_deref().unwrap_or(""))
        .await;

    match result {
        Ok(session) => (
            StatusCode::OK,
            Json(ListenResponse::matched(&session, state.socket_port)),
        ),
        Err(RelayError::InvalidArgument(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(ListenResponse::error("error", msg)),
        ),
        Err(err @ RelayError::Timeout(_)) => (
            StatusCode::REQUEST_TIMEOUT,
            Json(ListenResponse::error("timeout", err.to_string())),
        ),
        Err(err @ RelayError::ReceiverBusy) => (
            StatusCode::CONFLICT,
            Json(ListenResponse::error("error", err.to_string())),
        ),
        Err(err) => {
            error!("Listen failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ListenResponse::error("error", err.to_string())),
            )
        }
    }
}

/// Cleanup hook for clients that finished their transfer.
async fn complete_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> (StatusCode, &'static str) {
    state.registry.complete_session(&session_id);
    info!("Session marked complete: {}", short_fp(&session_id));
    (StatusCode::OK, "Session completed")
}
