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

//! Driver-error classification into the shared taxonomy.

use evalforge_core::Error;

pub(crate) fn from_sqlx(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::RowNotFound => Error::NotFound("row not found".into()),
        sqlx::Error::PoolTimedOut => Error::Timeout("postgres pool exhausted".into()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(db.message().to_string())
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            Error::Validation(db.message().to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
            Error::Unavailable(format!("postgres: {e}"))
        }
        _ => Error::Internal(format!("postgres: {e}")),
    }
}

pub(crate) fn from_clickhouse(e: clickhouse::error::Error) -> Error {
    use clickhouse::error::Error as Ch;
    match &e {
        Ch::Network(_) => Error::Unavailable(format!("clickhouse: {e}")),
        Ch::TimedOut => Error::Timeout("clickhouse request timed out".into()),
        Ch::RowNotFound => Error::NotFound("row not found".into()),
        _ => Error::Internal(format!("clickhouse: {e}")),
    }
}

pub(crate) fn from_redis(e: redis::RedisError) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("redis: {e}"))
    } else if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
        Error::Unavailable(format!("redis: {e}"))
    } else {
        Error::Internal(format!("redis: {e}"))
    }
}
