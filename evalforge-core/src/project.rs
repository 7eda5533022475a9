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

//! Tenancy: users, projects and API keys
//!
//! A project is exclusively owned by one user; events, evaluations,
//! suggestions and alert configs are exclusively owned by their project.
//! Deletes cascade top-down, enforced in the metadata schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Password digest; never the plaintext.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Fingerprints whose sampled prompt text contains one of these
    /// substrings are never auto-evaluated.
    #[serde(default)]
    pub eval_opt_out: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Recognizable prefix carried by every issued key.
pub const API_KEY_PREFIX: &str = "ef_";

/// Length of the plaintext prefix stored alongside the digest so lookups
/// don't have to hash-scan the whole table.
pub const API_KEY_LOOKUP_LEN: usize = 8;

/// A project API key. Only the SHA-256 digest and a short lookup prefix
/// are persisted; the opaque secret is shown to the caller exactly once at
/// creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub project_id: i64,
    /// First [`API_KEY_LOOKUP_LEN`] characters of the issued key.
    pub lookup_prefix: String,
    /// Hex-encoded SHA-256 of the full key.
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_not_serialized() {
        let key = ApiKey {
            id: 1,
            project_id: 7,
            lookup_prefix: "ef_abc12".into(),
            key_hash: "deadbeef".into(),
            created_at: Utc::now(),
            revoked: false,
        };
        let json = serde_json::to_string(&key).unwrap();
        assert!(!json.contains("deadbeef"));
        assert!(json.contains("ef_abc12"));
    }
}
