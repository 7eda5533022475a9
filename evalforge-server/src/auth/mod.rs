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

//! Authentication
//!
//! Two principal kinds: user sessions (HMAC-signed JWT carrying the user
//! id and expiry) and project API keys (`ef_`-prefixed opaque strings;
//! only a SHA-256 digest plus a short lookup prefix is stored, and the
//! digest comparison is constant-time). The middleware resolves the
//! principal, applies the route-class rate limit, and attaches an
//! [`AuthContext`] to the request.

pub mod rate_limit;

use crate::state::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use evalforge_core::{Error, Result};
use evalforge_storage::MetadataStore;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use rate_limit::route_tier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

pub use evalforge_core::project::{API_KEY_LOOKUP_LEN, API_KEY_PREFIX};

/// Who is calling.
#[derive(Debug, Clone)]
pub enum Principal {
    User { user_id: i64 },
    ApiKey { project_id: i64 },
}

/// Attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: Principal,
    pub client_ip: String,
}

impl AuthContext {
    pub fn user_id(&self) -> Result<i64> {
        match self.principal {
            Principal::User { user_id } => Ok(user_id),
            Principal::ApiKey { .. } => Err(Error::Forbidden(
                "this endpoint requires a user session".into(),
            )),
        }
    }

    pub fn api_project_id(&self) -> Result<i64> {
        match self.principal {
            Principal::ApiKey { project_id } => Ok(project_id),
            Principal::User { .. } => Err(Error::Forbidden(
                "this endpoint requires a project API key".into(),
            )),
        }
    }

    /// Stable identity string for rate-limit bucketing.
    pub fn rate_key(&self) -> String {
        match self.principal {
            Principal::User { user_id } => format!("user:{user_id}"),
            Principal::ApiKey { project_id } => format!("key:{project_id}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    /// User id.
    sub: i64,
    exp: i64,
    iat: i64,
}

pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    session_ttl: chrono::Duration,
    metadata: Arc<MetadataStore>,
}

impl AuthService {
    pub fn new(jwt_secret: &str, session_ttl_days: u32, metadata: Arc<MetadataStore>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            session_ttl: chrono::Duration::days(session_ttl_days as i64),
            metadata,
        }
    }

    pub fn issue_session(&self, user_id: i64) -> Result<String> {
        let now = chrono::Utc::now();
        let claims = SessionClaims {
            sub: user_id,
            iat: now.timestamp(),
            exp: (now + self.session_ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| Error::internal(format!("token encoding: {e}")))
    }

    pub fn verify_session(&self, token: &str) -> Result<i64> {
        let data = decode::<SessionClaims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| Error::Auth(format!("invalid session token: {e}")))?;
        Ok(data.claims.sub)
    }

    /// Mint a new key. Returns `(plaintext, lookup_prefix, digest_hex)`;
    /// the plaintext is shown to the caller exactly once.
    pub fn generate_api_key(&self) -> (String, String, String) {
        let mut rng = rand::thread_rng();
        let secret: String = (0..40)
            .map(|_| {
                let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
                chars[rng.gen_range(0..chars.len())] as char
            })
            .collect();
        let plaintext = format!("{API_KEY_PREFIX}{secret}");
        let lookup_prefix = plaintext[..API_KEY_LOOKUP_LEN].to_string();
        let digest = hex::encode(Sha256::digest(plaintext.as_bytes()));
        (plaintext, lookup_prefix, digest)
    }

    /// Resolve an API key to its project. Candidate rows are narrowed by
    /// the lookup prefix; the digest match itself is constant-time.
    pub async fn resolve_api_key(&self, key: &str) -> Result<i64> {
        if !key.starts_with(API_KEY_PREFIX) || key.len() < API_KEY_LOOKUP_LEN {
            return Err(Error::Auth("malformed API key".into()));
        }
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        let candidates = self
            .metadata
            .api_keys_by_prefix(&key[..API_KEY_LOOKUP_LEN])
            .await?;
        for candidate in candidates {
            if constant_time_eq(candidate.key_hash.as_bytes(), digest.as_bytes()) {
                return Ok(candidate.project_id);
            }
        }
        Err(Error::Auth("unknown API key".into()))
    }

    pub fn hash_password(&self, password: &str) -> String {
        let salt: [u8; 16] = rand::thread_rng().gen();
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        format!("{}${}", hex::encode(salt), hex::encode(hasher.finalize()))
    }

    pub fn verify_password(&self, password: &str, stored: &str) -> bool {
        let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
            return false;
        };
        let Ok(salt) = hex::decode(salt_hex) else {
            return false;
        };
        let mut hasher = Sha256::new();
        hasher.update(&salt);
        hasher.update(password.as_bytes());
        constant_time_eq(hex::encode(hasher.finalize()).as_bytes(), digest_hex.as_bytes())
    }
}

/// Length-leaking but content-constant-time comparison; lengths here are
/// fixed-size digests.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Best-effort client address from proxy headers.
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_string();
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.trim().to_string();
    }
    "unknown".to_string()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn api_key_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// Paths served without a principal (rate-limited by client IP only).
fn is_public(path: &str) -> bool {
    path == "/health" || path.starts_with("/api/v1/auth/")
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let client_ip = extract_client_ip(request.headers());
    let tier = route_tier(&path);

    // The IP-scoped global bucket applies to everything.
    if let Err(e) = state
        .rate_limiter
        .check(rate_limit::Tier::Global, &client_ip)
        .await
    {
        return crate::api::ApiError::from(e).into_response();
    }

    if is_public(&path) {
        if let Err(e) = state.rate_limiter.check(tier, &client_ip).await {
            return crate::api::ApiError::from(e).into_response();
        }
        return next.run(request).await;
    }

    let headers = request.headers();
    let token = api_key_header(headers).or_else(|| bearer_token(headers));
    let Some(token) = token else {
        return crate::api::ApiError::from(Error::Auth("missing credentials".into()))
            .into_response();
    };

    let principal = if token.starts_with(API_KEY_PREFIX) {
        match state.auth.resolve_api_key(token).await {
            Ok(project_id) => Principal::ApiKey { project_id },
            Err(e) => return crate::api::ApiError::from(e).into_response(),
        }
    } else {
        match state.auth.verify_session(token) {
            Ok(user_id) => Principal::User { user_id },
            Err(e) => return crate::api::ApiError::from(e).into_response(),
        }
    };

    let context = AuthContext {
        principal,
        client_ip,
    };
    if let Err(e) = state.rate_limiter.check(tier, &context.rate_key()).await {
        return crate::api::ApiError::from(e).into_response();
    }

    debug!(path = %path, principal = ?context.principal, "request authenticated");
    request.extensions_mut().insert(context);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_behaves() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn client_ip_extraction_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 172.16.0.1".parse().unwrap());
        headers.insert("x-real-ip", "192.168.1.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers), "10.0.0.1");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "192.168.1.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers), "192.168.1.1");

        assert_eq!(extract_client_ip(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn public_paths() {
        assert!(is_public("/health"));
        assert!(is_public("/api/v1/auth/login"));
        assert!(!is_public("/api/v1/projects"));
        assert!(!is_public("/api/v1/ingest"));
    }
}
