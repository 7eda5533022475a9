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

//! Analytics queries
//!
//! Aggregations answered from the event store and cached in the KV tier
//! for 60 seconds — dashboards poll these hard and the aggregates only
//! move as fast as the rollups anyway.

use crate::api::{projects::owned_project, ApiError};
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use evalforge_storage::TimeRange;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct AnalyticsParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl AnalyticsParams {
    fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }

    fn cache_suffix(&self) -> String {
        format!(
            "{}:{}",
            self.start.map(|t| t.timestamp()).unwrap_or(0),
            self.end.map(|t| t.timestamp()).unwrap_or(0)
        )
    }
}

/// Read-through cache for one analytics payload.
async fn cached<T, F, Fut>(
    state: &AppState,
    key: &str,
    compute: F,
) -> Result<T, ApiError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = evalforge_core::Result<T>>,
{
    if let Ok(Some(raw)) = state.cache.get(key).await {
        if let Ok(value) = serde_json::from_str::<T>(&raw) {
            debug!(key, "analytics cache hit");
            return Ok(value);
        }
    }
    let value = compute().await?;
    if let Ok(raw) = serde_json::to_string(&value) {
        // Best effort; a cache write failure only costs the next caller
        // a recompute.
        let _ = state.cache.set_with_ttl(key, &raw, CACHE_TTL).await;
    }
    Ok(value)
}

/// GET /api/v1/projects/:project_id/analytics/summary
pub async fn summary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<evalforge_storage::AnalyticsSummary>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let key = format!("analytics:summary:{project_id}:{}", params.cache_suffix());
    let value = cached(&state, &key, || async {
        state.events.analytics_summary(project_id, params.range()).await
    })
    .await?;
    Ok(Json(value))
}

/// GET /api/v1/projects/:project_id/analytics/costs
pub async fn costs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<Vec<evalforge_storage::ModelCost>>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let key = format!("analytics:costs:{project_id}:{}", params.cache_suffix());
    let value = cached(&state, &key, || async {
        state.events.cost_by_model(project_id, params.range()).await
    })
    .await?;
    Ok(Json(value))
}

/// GET /api/v1/projects/:project_id/analytics/latency
pub async fn latency(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<evalforge_storage::LatencyStats>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let key = format!("analytics:latency:{project_id}:{}", params.cache_suffix());
    let value = cached(&state, &key, || async {
        state
            .events
            .latency_percentiles(project_id, params.range())
            .await
    })
    .await?;
    Ok(Json(value))
}

/// GET /api/v1/projects/:project_id/analytics/errors
pub async fn errors(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<Vec<evalforge_storage::ErrorSlice>>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let key = format!("analytics:errors:{project_id}:{}", params.cache_suffix());
    let value = cached(&state, &key, || async {
        state.events.error_breakdown(project_id, params.range()).await
    })
    .await?;
    Ok(Json(value))
}
