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

//! Ingest endpoint
//!
//! API-key authenticated; 202 acknowledges durable *enqueue*. Partial
//! success is the normal shape: invalid events come back as
//! `{index, reason}` pairs while the valid remainder commits.

use crate::api::ApiError;
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, Extension, Json};
use chrono::{DateTime, Utc};
use evalforge_core::TraceEvent;
use evalforge_ingest::RejectedEvent;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct IngestRequest {
    pub events: Vec<TraceEvent>,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: Vec<RejectedEvent>,
    pub ingested_at: DateTime<Utc>,
}

/// POST /api/v1/ingest
#[tracing::instrument(skip(state, auth, request), fields(batch = request.events.len()))]
pub async fn ingest_events(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let project_id = auth.api_project_id()?;
    let report = state.pipeline.ingest(project_id, request.events).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted: report.accepted,
            rejected: report.rejected,
            ingested_at: report.ingested_at,
        }),
    ))
}
