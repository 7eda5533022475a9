// Copyright 2025 EvalForge (https://github.com/evalforge)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Live metrics over WebSocket
//!
//! One snapshot per aggregator tick, in emission order. Clients keep the
//! connection alive with pings; a client that stays silent past the idle
//! timeout is dropped, and a client that stops reading is evicted by the
//! hub's keep-latest policy long before it can back up the writer.

use crate::api::{projects::owned_project, ApiError};
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    Extension,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Deserialize)]
pub struct StreamParams {
    pub project: Option<i64>,
}

/// GET /stream/metrics?project=...
pub async fn stream_metrics(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<StreamParams>,
) -> Result<Response, ApiError> {
    if let Some(project_id) = params.project {
        owned_project(&state, &auth, project_id).await?;
    }
    let idle_timeout = Duration::from_secs(state.config.metrics.idle_timeout_s.max(1));
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, params.project, idle_timeout)))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    project_filter: Option<i64>,
    idle_timeout: Duration,
) {
    let subscriber = state.hub.clone().subscribe(project_filter);
    debug!(subscriber = subscriber.id(), ?project_filter, "metrics stream opened");

    let (mut sink, mut source) = socket.split();
    let mut last_heard = Instant::now();

    loop {
        let idle_deadline = last_heard + idle_timeout;
        tokio::select! {
            snapshot = subscriber.recv() => {
                let Some(snapshot) = snapshot else {
                    // Evicted as a slow consumer; close with a reason.
                    let _ = sink
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code: 1013,
                            reason: "too slow, snapshots dropped".into(),
                        })))
                        .await;
                    break;
                };
                let payload = match serde_json::to_string(&*snapshot) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        last_heard = Instant::now();
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Text(_))) => {
                        last_heard = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Binary(_))) => {}
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                debug!(subscriber = subscriber.id(), "idle timeout, dropping stream");
                let _ = sink
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: 1001,
                        reason: "idle timeout".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    debug!(subscriber = subscriber.id(), "metrics stream closed");
    // Dropping the subscriber handle unsubscribes from the hub.
}
