// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket log streaming.
//!
//! `GET /api/v1/stream/{id}` upgrades to a WebSocket and forwards the job's
//! log frames as JSON text messages, in production order, until the frame
//! with `final = true` has been delivered; the socket then closes with a
//! normal (1000) status. Each job's channel supports a single subscriber.

use crate::{ApiError, AppState};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path as AxPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use cordon_core::LogFrame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Upgrade handler for `GET /api/v1/stream/{id}`.
pub async fn stream_logs(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // Browser clients present an Origin header; it must name an allowed
    // controller. Non-browser clients (no Origin) pass.
    if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        let allowed = state
            .config
            .allowed_controllers
            .iter()
            .any(|c| c == origin);
        if !allowed {
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                format!("origin {origin:?} not allowed"),
            ));
        }
    }

    let receiver = state.jobs.take_log_receiver(&id).await.map_err(|error| {
        use crate::job::JobTableError;
        match error {
            JobTableError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("job {id:?} not found"))
            }
            JobTableError::StreamTaken(_) => ApiError::new(
                StatusCode::CONFLICT,
                format!("log stream for job {id:?} already attached"),
            ),
            other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    })?;

    Ok(upgrade.on_upgrade(move |socket| forward_frames(socket, id, receiver)))
}

/// Forward frames until the final one, then close cleanly.
async fn forward_frames(mut socket: WebSocket, job_id: String, mut rx: mpsc::Receiver<LogFrame>) {
    while let Some(frame) = rx.recv().await {
        let is_final = frame.is_final;
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(error) => {
                warn!(job_id, %error, "log frame serialization failed");
                break;
            }
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            debug!(job_id, "log subscriber went away");
            return;
        }
        if is_final {
            break;
        }
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "stream complete".into(),
        })))
        .await;
}
