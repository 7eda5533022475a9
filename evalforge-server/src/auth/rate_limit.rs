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

//! Tiered rate limiting
//!
//! Named tiers, each a counter bucket in the cache tier: one atomic
//! increment whose TTL equals the window, allowance = rate + burst per
//! window. Buckets are keyed on the tier plus a principal attribute (API
//! key project, user id, or client IP), so tenants never share a bucket.

use evalforge_core::{Error, Result};
use evalforge_storage::CacheStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    SdkIngest,
    EventsQuery,
    Analytics,
    Auth,
    Global,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::SdkIngest => "sdk_ingest",
            Tier::EventsQuery => "events_query",
            Tier::Analytics => "analytics",
            Tier::Auth => "auth",
            Tier::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TierLimit {
    pub rate: u32,
    pub window_secs: u64,
    pub burst: u32,
}

impl TierLimit {
    fn allowance(&self) -> i64 {
        self.rate as i64 + self.burst as i64
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

fn default_limits() -> HashMap<Tier, TierLimit> {
    HashMap::from([
        (
            Tier::SdkIngest,
            TierLimit {
                rate: 10_000,
                window_secs: 60,
                burst: 1000,
            },
        ),
        (
            Tier::EventsQuery,
            TierLimit {
                rate: 5000,
                window_secs: 60,
                burst: 500,
            },
        ),
        (
            Tier::Analytics,
            TierLimit {
                rate: 500,
                window_secs: 60,
                burst: 50,
            },
        ),
        (
            Tier::Auth,
            TierLimit {
                rate: 20,
                window_secs: 60,
                burst: 5,
            },
        ),
        (
            Tier::Global,
            TierLimit {
                rate: 1000,
                window_secs: 3600,
                burst: 100,
            },
        ),
    ])
}

/// Route class → tier. The ingest path gets its own generous bucket,
/// analytics and export are the expensive class, auth endpoints the
/// stingy one.
pub fn route_tier(path: &str) -> Tier {
    if path == "/ingest" || path == "/api/v1/ingest" {
        Tier::SdkIngest
    } else if path.starts_with("/api/v1/auth/") {
        Tier::Auth
    } else if path.contains("/analytics") || path.starts_with("/api/v1/export") {
        Tier::Analytics
    } else {
        Tier::EventsQuery
    }
}

pub struct TieredRateLimiter {
    cache: Arc<dyn CacheStore>,
    limits: HashMap<Tier, TierLimit>,
    enabled: bool,
}

impl TieredRateLimiter {
    pub fn new(cache: Arc<dyn CacheStore>, overrides: Option<&serde_json::Value>) -> Self {
        let mut limits = default_limits();
        if let Some(overrides) = overrides {
            apply_overrides(&mut limits, overrides);
        }
        Self {
            cache,
            limits,
            enabled: true,
        }
    }

    pub fn disabled(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            limits: default_limits(),
            enabled: false,
        }
    }

    /// One consumed token for `key` in `tier`'s current window.
    pub async fn check(&self, tier: Tier, key: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let limit = self.limits[&tier];
        let bucket = format!("rl:{}:{key}", tier.as_str());
        let count = self.cache.incr_with_ttl(&bucket, limit.window()).await?;
        if count > limit.allowance() {
            return Err(Error::RateLimited {
                retry_after: limit.window(),
            });
        }
        Ok(())
    }
}

fn apply_overrides(limits: &mut HashMap<Tier, TierLimit>, overrides: &serde_json::Value) {
    let Some(map) = overrides.as_object() else {
        warn!("rate limit overrides are not a JSON object, ignored");
        return;
    };
    for (name, value) in map {
        let tier = match name.as_str() {
            "sdk_ingest" => Tier::SdkIngest,
            "events_query" => Tier::EventsQuery,
            "analytics" => Tier::Analytics,
            "auth" => Tier::Auth,
            "global" => Tier::Global,
            other => {
                warn!(tier = other, "unknown rate limit tier in overrides");
                continue;
            }
        };
        match serde_json::from_value::<TierLimit>(value.clone()) {
            Ok(limit) => {
                limits.insert(tier, limit);
            }
            Err(e) => warn!(tier = name.as_str(), error = %e, "bad tier override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalforge_storage::MemoryCache;

    fn limiter_with(tier: Tier, limit: TierLimit) -> TieredRateLimiter {
        let mut limiter = TieredRateLimiter::new(Arc::new(MemoryCache::new()), None);
        limiter.limits.insert(tier, limit);
        limiter
    }

    #[tokio::test]
    async fn allowance_is_rate_plus_burst() {
        let limiter = limiter_with(
            Tier::Auth,
            TierLimit {
                rate: 3,
                window_secs: 60,
                burst: 2,
            },
        );

        for _ in 0..5 {
            limiter.check(Tier::Auth, "1.2.3.4").await.unwrap();
        }
        let err = limiter.check(Tier::Auth, "1.2.3.4").await.unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));

        // Another principal has its own bucket.
        limiter.check(Tier::Auth, "5.6.7.8").await.unwrap();
    }

    #[tokio::test]
    async fn window_expiry_resets_bucket() {
        let limiter = limiter_with(
            Tier::Auth,
            TierLimit {
                rate: 1,
                window_secs: 1,
                burst: 0,
            },
        );
        limiter.check(Tier::Auth, "ip").await.unwrap();
        assert!(limiter.check(Tier::Auth, "ip").await.is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        limiter.check(Tier::Auth, "ip").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = TieredRateLimiter::disabled(Arc::new(MemoryCache::new()));
        for _ in 0..10_000 {
            limiter.check(Tier::Auth, "ip").await.unwrap();
        }
    }

    #[test]
    fn route_classes() {
        assert_eq!(route_tier("/ingest"), Tier::SdkIngest);
        assert_eq!(route_tier("/api/v1/ingest"), Tier::SdkIngest);
        assert_eq!(route_tier("/api/v1/auth/login"), Tier::Auth);
        assert_eq!(
            route_tier("/api/v1/projects/3/analytics/summary"),
            Tier::Analytics
        );
        assert_eq!(route_tier("/api/v1/export"), Tier::Analytics);
        assert_eq!(route_tier("/api/v1/projects"), Tier::EventsQuery);
        assert_eq!(route_tier("/stream/metrics"), Tier::EventsQuery);
    }

    #[test]
    fn overrides_apply() {
        let overrides = serde_json::json!({
            "auth": {"rate": 99, "window_secs": 30, "burst": 1},
            "bogus": {"rate": 1, "window_secs": 1, "burst": 0}
        });
        let limiter = TieredRateLimiter::new(Arc::new(MemoryCache::new()), Some(&overrides));
        let auth = limiter.limits[&Tier::Auth];
        assert_eq!(auth.rate, 99);
        assert_eq!(auth.window_secs, 30);
        // Untouched tiers keep their defaults.
        assert_eq!(limiter.limits[&Tier::SdkIngest].rate, 10_000);
    }
}
