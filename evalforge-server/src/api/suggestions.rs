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

//! Optimization suggestion endpoints. Status moves are user decisions:
//! accept, reject, or mark applied.

use crate::api::{projects::owned_project, ApiError};
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use evalforge_core::{Error, OptimizationSuggestion, SuggestionStatus};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// GET /api/v1/projects/:project_id/suggestions
pub async fn list_suggestions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<OptimizationSuggestion>>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    Ok(Json(
        state
            .metadata
            .list_project_suggestions(project_id, params.limit.unwrap_or(50).clamp(1, 500))
            .await?,
    ))
}

/// GET /api/v1/evaluations/:evaluation_id/suggestions
pub async fn list_evaluation_suggestions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(evaluation_id): Path<Uuid>,
) -> Result<Json<Vec<OptimizationSuggestion>>, ApiError> {
    let evaluation = state.metadata.get_evaluation(evaluation_id).await?;
    owned_project(&state, &auth, evaluation.project_id).await?;
    Ok(Json(state.metadata.list_suggestions(evaluation_id).await?))
}

/// POST /api/v1/projects/:project_id/suggestions/:suggestion_id/:action
///
/// `action` ∈ {accept, reject, apply}.
pub async fn act_on_suggestion(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((project_id, suggestion_id, action)): Path<(i64, Uuid, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let status = match action.as_str() {
        "accept" => SuggestionStatus::Accepted,
        "reject" => SuggestionStatus::Rejected,
        "apply" => SuggestionStatus::Applied,
        other => {
            return Err(Error::Validation(format!(
                "unknown action '{other}', expected accept, reject or apply"
            ))
            .into())
        }
    };
    let updated = state
        .metadata
        .update_suggestion_status(suggestion_id, project_id, status)
        .await?;
    if !updated {
        return Err(Error::NotFound(format!("suggestion {suggestion_id}")).into());
    }
    Ok(Json(
        serde_json::json!({ "id": suggestion_id, "status": status.as_str() }),
    ))
}
