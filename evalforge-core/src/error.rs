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

//! Error taxonomy shared across the workspace
//!
//! Components return structured errors carrying a kind; only the HTTP
//! boundary maps kinds to status codes. Duplicate-key conflicts are
//! surfaced as [`Error::Conflict`] so callers can treat idempotent retries
//! as success.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Workspace-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-bounds input. Never retried by the server.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or invalid credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Authenticated but not allowed to touch the resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A rate-limit bucket is exhausted.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Internal queues are full; the caller should back off and retry.
    #[error("backpressure: ingest queue at depth {queue_depth}")]
    Backpressure { queue_depth: usize },

    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotent duplicate. Treated as success at the boundary.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A downstream dependency refused or dropped the connection.
    #[error("downstream unavailable: {0}")]
    Unavailable(String),

    /// A downstream dependency did not answer within its deadline.
    #[error("downstream timeout: {0}")]
    Timeout(String),

    /// Broken invariant. Logged with context, surfaced opaquely.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classification, used for retry decisions and transport
/// mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    RateLimited,
    Backpressure,
    NotFound,
    Conflict,
    Unavailable,
    Timeout,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Backpressure { .. } => ErrorKind::Backpressure,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same request may succeed if re-issued later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited
                | ErrorKind::Backpressure
                | ErrorKind::Unavailable
                | ErrorKind::Timeout
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(error = %msg, "internal invariant violated");
        Error::Internal(msg)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::Backpressure { queue_depth: 1 }.is_retryable());
        assert!(Error::Unavailable("db".into()).is_retryable());
        assert!(Error::Timeout("db".into()).is_retryable());
        assert!(Error::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .is_retryable());

        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::Auth("bad".into()).is_retryable());
        assert!(!Error::Conflict("dup".into()).is_retryable());
        assert!(!Error::Internal("bug".into()).is_retryable());
    }
}
