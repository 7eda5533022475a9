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

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub metadata_store: bool,
    pub event_store: bool,
    pub cache: bool,
    pub queue_depth: usize,
    pub subscribers: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let metadata_store = state.metadata.ping().await.is_ok();
    let event_store = state.events.ping().await.is_ok();
    let cache = state.cache.ping().await.is_ok();
    let status = if metadata_store && event_store && cache {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        metadata_store,
        event_store,
        cache,
        queue_depth: state.pipeline.queue_depth(),
        subscribers: state.hub.subscriber_count(),
    })
}
