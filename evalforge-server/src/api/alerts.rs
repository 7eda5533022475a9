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

//! Alert thresholds and notification targets, per project.

use crate::api::{projects::owned_project, ApiError};
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use evalforge_core::{
    AlertMetric, AlertOperator, AlertThreshold, Error, NotificationChannel, NotificationConfig,
};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct UpsertThresholdRequest {
    pub metric: String,
    pub operator: String,
    pub value: f64,
    #[serde(default = "default_window")]
    pub window_minutes: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_window() -> u32 {
    5
}
fn default_cooldown() -> u32 {
    15
}
fn default_enabled() -> bool {
    true
}

/// PUT /api/v1/projects/:project_id/alerts
pub async fn upsert_threshold(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Json(request): Json<UpsertThresholdRequest>,
) -> Result<Json<AlertThreshold>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let metric = AlertMetric::parse(&request.metric)
        .ok_or_else(|| Error::Validation(format!("unknown metric '{}'", request.metric)))?;
    let operator = AlertOperator::parse(&request.operator)
        .ok_or_else(|| Error::Validation(format!("unknown operator '{}'", request.operator)))?;
    if request.window_minutes == 0 {
        return Err(Error::Validation("window_minutes must be positive".into()).into());
    }

    let threshold = state
        .metadata
        .upsert_threshold(
            project_id,
            metric,
            operator,
            request.value,
            request.window_minutes,
            request.cooldown_minutes,
            request.enabled,
        )
        .await?;
    Ok(Json(threshold))
}

/// GET /api/v1/projects/:project_id/alerts
pub async fn list_thresholds(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<AlertThreshold>>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    Ok(Json(state.metadata.list_thresholds(project_id).await?))
}

/// DELETE /api/v1/projects/:project_id/alerts/:threshold_id
pub async fn delete_threshold(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((project_id, threshold_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    state
        .metadata
        .delete_threshold(threshold_id, project_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct CreateNotificationRequest {
    pub channel: String,
    pub target: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// POST /api/v1/projects/:project_id/notifications
pub async fn create_notification_config(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Json(request): Json<CreateNotificationRequest>,
) -> Result<(StatusCode, Json<NotificationConfig>), ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let channel = NotificationChannel::parse(&request.channel)
        .ok_or_else(|| Error::Validation(format!("unknown channel '{}'", request.channel)))?;
    if request.target.trim().is_empty() {
        return Err(Error::Validation("target cannot be empty".into()).into());
    }
    let config = state
        .metadata
        .insert_notification_config(project_id, channel, request.target.trim(), request.enabled)
        .await?;
    Ok((StatusCode::CREATED, Json(config)))
}

/// GET /api/v1/projects/:project_id/notifications
pub async fn list_notification_configs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<NotificationConfig>>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    Ok(Json(
        state.metadata.list_notification_configs(project_id).await?,
    ))
}

/// DELETE /api/v1/projects/:project_id/notifications/:config_id
pub async fn delete_notification_config(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((project_id, config_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    state
        .metadata
        .delete_notification_config(config_id, project_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
