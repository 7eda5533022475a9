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

//! Registration and login, issuing session tokens.

use crate::api::ApiError;
use crate::state::AppState;
use axum::{extract::State, Json};
use evalforge_core::Error;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user_id: i64,
}

/// POST /api/v1/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if request.email.is_empty() || !request.email.contains('@') {
        return Err(Error::Validation("invalid email".into()).into());
    }
    if request.password.len() < 8 {
        return Err(Error::Validation("password must be at least 8 characters".into()).into());
    }

    let password_hash = state.auth.hash_password(&request.password);
    let user = state
        .metadata
        .create_user(&request.email, &password_hash)
        .await?;
    let token = state.auth.issue_session(user.id)?;
    Ok(Json(SessionResponse {
        token,
        user_id: user.id,
    }))
}

/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let user = state
        .metadata
        .user_by_email(&request.email)
        .await?
        .ok_or_else(|| Error::Auth("unknown email or wrong password".to_string()))?;
    if !state
        .auth
        .verify_password(&request.password, &user.password_hash)
    {
        return Err(Error::Auth("unknown email or wrong password".into()).into());
    }
    let token = state.auth.issue_session(user.id)?;
    Ok(Json(SessionResponse {
        token,
        user_id: user.id,
    }))
}
