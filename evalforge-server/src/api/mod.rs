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

//! HTTP surface
//!
//! Handlers return `Result<_, ApiError>`; the error-kind → status-code
//! mapping lives here and nowhere else. Internal invariants surface as
//! an opaque 500 with the detail kept in the logs.

pub mod alerts;
pub mod analytics;
pub mod auth_routes;
pub mod evaluations;
pub mod events;
pub mod export;
pub mod health;
pub mod ingest;
pub mod projects;
pub mod stream;
pub mod suggestions;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use evalforge_core::{Error, ErrorKind};
use serde::Serialize;

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let kind = error.kind();
        let (status, retry_after_secs, message) = match (&error, kind) {
            (Error::RateLimited { retry_after }, _) => (
                StatusCode::TOO_MANY_REQUESTS,
                Some(retry_after.as_secs().max(1)),
                error.to_string(),
            ),
            (_, ErrorKind::Backpressure) => (
                StatusCode::TOO_MANY_REQUESTS,
                Some(1),
                error.to_string(),
            ),
            (_, ErrorKind::Validation) => (StatusCode::BAD_REQUEST, None, error.to_string()),
            (_, ErrorKind::Auth) => (StatusCode::UNAUTHORIZED, None, error.to_string()),
            (_, ErrorKind::Forbidden) => (StatusCode::FORBIDDEN, None, error.to_string()),
            (_, ErrorKind::NotFound) => (StatusCode::NOT_FOUND, None, error.to_string()),
            (_, ErrorKind::Conflict) => (StatusCode::CONFLICT, None, error.to_string()),
            (_, ErrorKind::Unavailable | ErrorKind::Timeout) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(5),
                error.to_string(),
            ),
            (_, ErrorKind::Internal | ErrorKind::RateLimited) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                // Never leak invariant details to callers.
                "internal error".to_string(),
            ),
        };

        let kind_label = match kind {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "downstream_unavailable",
            ErrorKind::Timeout => "downstream_timeout",
            ErrorKind::Internal => "internal",
        };

        let mut response = (
            status,
            Json(ErrorBody {
                error: message,
                kind: kind_label,
                retry_after_secs,
            }),
        )
            .into_response();
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::Auth("x".into()), StatusCode::UNAUTHORIZED),
            (Error::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (
                Error::Backpressure { queue_depth: 9 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::RateLimited {
                    retry_after: Duration::from_secs(30),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (Error::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Timeout("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Internal("secret".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = ApiError(Error::RateLimited {
            retry_after: Duration::from_secs(42),
        })
        .into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }
}
