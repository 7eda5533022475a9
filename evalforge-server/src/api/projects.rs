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

//! Project CRUD and API key issuance
//!
//! Deleting a project cascades through the metadata schema and is
//! followed by an event-store purge; ownership is checked on every
//! project-scoped route.

use crate::api::ApiError;
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use evalforge_core::{Error, Project};
use serde::{Deserialize, Serialize};

/// Ownership gate used by every project-scoped handler.
pub async fn owned_project(
    state: &AppState,
    auth: &AuthContext,
    project_id: i64,
) -> evalforge_core::Result<Project> {
    let project = state.metadata.get_project(project_id).await?;
    let user_id = auth.user_id()?;
    if project.owner_id != user_id {
        return Err(Error::Forbidden(format!("project {project_id} is not yours")));
    }
    Ok(project)
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// POST /api/v1/projects
pub async fn create_project(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(Error::Validation("project name cannot be empty".into()).into());
    }
    let user_id = auth.user_id()?;
    let project = state
        .metadata
        .create_project(user_id, request.name.trim(), &request.description)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/v1/projects
pub async fn list_projects(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Project>>, ApiError> {
    let user_id = auth.user_id()?;
    Ok(Json(state.metadata.list_projects(user_id).await?))
}

/// GET /api/v1/projects/:project_id
pub async fn get_project(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(owned_project(&state, &auth, project_id).await?))
}

/// DELETE /api/v1/projects/:project_id
pub async fn delete_project(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let user_id = auth.user_id()?;
    owned_project(&state, &auth, project_id).await?;
    state.metadata.delete_project(project_id, user_id).await?;
    state.events.delete_project_events(project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct CreatedApiKey {
    pub id: i64,
    /// Shown exactly once; only a digest is stored.
    pub key: String,
}

/// POST /api/v1/projects/:project_id/keys
pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
) -> Result<(StatusCode, Json<CreatedApiKey>), ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let (plaintext, lookup_prefix, digest) = state.auth.generate_api_key();
    let stored = state
        .metadata
        .insert_api_key(project_id, &lookup_prefix, &digest)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedApiKey {
            id: stored.id,
            key: plaintext,
        }),
    ))
}

/// DELETE /api/v1/projects/:project_id/keys/:key_id
pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((project_id, key_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    state.metadata.revoke_api_key(key_id, project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
