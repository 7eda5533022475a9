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

//! Evaluation endpoints
//!
//! Most evaluations are created by the scanner; these routes add manual
//! creation, run/cancel triggers, and artifact reads. Ownership is
//! resolved through the evaluation's project on every route.

use crate::api::{projects::owned_project, ApiError};
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use evalforge_core::{
    Error, Evaluation, EvaluationMetrics, NormalizerConfig, PromptAnalysis, PromptFingerprint,
    TestCase,
};
use serde::Deserialize;
use uuid::Uuid;

async fn owned_evaluation(
    state: &AppState,
    auth: &AuthContext,
    evaluation_id: Uuid,
) -> Result<Evaluation, ApiError> {
    let evaluation = state.metadata.get_evaluation(evaluation_id).await?;
    owned_project(state, auth, evaluation.project_id).await?;
    Ok(evaluation)
}

#[derive(Deserialize)]
pub struct CreateEvaluationRequest {
    pub name: String,
    pub prompt_text: String,
    #[serde(default)]
    pub operation_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// POST /api/v1/projects/:project_id/evaluations
pub async fn create_evaluation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Json(request): Json<CreateEvaluationRequest>,
) -> Result<(StatusCode, Json<Evaluation>), ApiError> {
    owned_project(&state, &auth, project_id).await?;
    if request.prompt_text.trim().is_empty() {
        return Err(Error::Validation("prompt_text cannot be empty".into()).into());
    }

    let fingerprint = PromptFingerprint::compute(
        project_id,
        request.operation_type.as_deref().unwrap_or("manual"),
        request.model.as_deref().unwrap_or(""),
        &request.prompt_text,
        &NormalizerConfig::default(),
    );
    let evaluation = Evaluation::new(
        project_id,
        fingerprint.0,
        request.name,
        request.prompt_text,
    );
    state.metadata.insert_evaluation(&evaluation).await?;
    Ok((StatusCode::CREATED, Json(evaluation)))
}

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// GET /api/v1/projects/:project_id/evaluations
pub async fn list_evaluations(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Evaluation>>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    Ok(Json(
        state
            .metadata
            .list_evaluations(project_id, params.limit.unwrap_or(50).clamp(1, 500))
            .await?,
    ))
}

/// GET /api/v1/evaluations/:evaluation_id
pub async fn get_evaluation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(evaluation_id): Path<Uuid>,
) -> Result<Json<Evaluation>, ApiError> {
    Ok(Json(owned_evaluation(&state, &auth, evaluation_id).await?))
}

/// POST /api/v1/evaluations/:evaluation_id/run
///
/// Nudges the dispatcher; the evaluation must be pending.
pub async fn run_evaluation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(evaluation_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let evaluation = owned_evaluation(&state, &auth, evaluation_id).await?;
    if evaluation.status != evalforge_core::EvaluationStatus::Pending {
        return Err(Error::Conflict(format!(
            "evaluation is {}, only pending evaluations can be started",
            evaluation.status.as_str()
        ))
        .into());
    }
    state.orchestrator.clone().dispatch_pending().await;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/v1/evaluations/:evaluation_id/cancel
pub async fn cancel_evaluation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(evaluation_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    owned_evaluation(&state, &auth, evaluation_id).await?;
    let cancelled = state.orchestrator.request_cancel(evaluation_id).await?;
    if cancelled {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(Error::Conflict("evaluation already terminal".into()).into())
    }
}

/// GET /api/v1/evaluations/:evaluation_id/metrics
pub async fn get_metrics(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(evaluation_id): Path<Uuid>,
) -> Result<Json<EvaluationMetrics>, ApiError> {
    owned_evaluation(&state, &auth, evaluation_id).await?;
    let metrics = state
        .metadata
        .get_metrics(evaluation_id)
        .await?
        .ok_or_else(|| Error::NotFound("metrics not yet computed".to_string()))?;
    Ok(Json(metrics))
}

/// GET /api/v1/evaluations/:evaluation_id/analysis
pub async fn get_analysis(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(evaluation_id): Path<Uuid>,
) -> Result<Json<PromptAnalysis>, ApiError> {
    owned_evaluation(&state, &auth, evaluation_id).await?;
    let analysis = state
        .metadata
        .get_analysis(evaluation_id)
        .await?
        .ok_or_else(|| Error::NotFound("analysis not yet available".to_string()))?;
    Ok(Json(analysis))
}

/// GET /api/v1/evaluations/:evaluation_id/cases
pub async fn list_test_cases(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(evaluation_id): Path<Uuid>,
) -> Result<Json<Vec<TestCase>>, ApiError> {
    owned_evaluation(&state, &auth, evaluation_id).await?;
    Ok(Json(state.metadata.list_test_cases(evaluation_id).await?))
}
