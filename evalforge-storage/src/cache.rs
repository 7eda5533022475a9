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

//! Ephemeral key-value tier
//!
//! Backs rate-limit counters (`incr_with_ttl` is the token-bucket
//! primitive), short-lived analytics caches and the ingestion dead-letter
//! list. Redis in production; [`MemoryCache`] when no cache URL is
//! configured and in tests — same observable semantics, per-process scope.

use crate::error::from_redis;
use async_trait::async_trait;
use dashmap::DashMap;
use evalforge_core::Result;
use redis::AsyncCommands;
use std::time::{Duration, Instant};

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomically increment `key`, setting `ttl` when the key is created.
    /// Returns the post-increment value. The TTL is *not* refreshed on
    /// subsequent increments, so the counter expires one window after the
    /// first hit.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Append a permanently-failed payload to the dead-letter list.
    async fn push_dead_letter(&self, payload: &str) -> Result<()>;

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

const DEAD_LETTER_KEY: &str = "evalforge:dead_letter";
const DEAD_LETTER_CAP: isize = 10_000;

/// Redis-backed implementation over a multiplexed connection manager.
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(from_redis)?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(from_redis)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(from_redis)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(from_redis)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        // INCR + NX EXPIRE in one round trip; EXPIRE NX only applies on
        // first touch so the window is anchored at the first hit.
        let mut conn = self.conn.clone();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(from_redis)?;
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(key).await.map_err(from_redis)
    }

    async fn push_dead_letter(&self, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .lpush(DEAD_LETTER_KEY, payload)
            .ignore()
            .ltrim(DEAD_LETTER_KEY, 0, DEAD_LETTER_CAP - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(from_redis)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(DEAD_LETTER_KEY, 0, limit as isize - 1)
            .await
            .map_err(from_redis)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(from_redis)?;
        Ok(())
    }
}

/// In-process fallback with lazy TTL eviction.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Option<Instant>)>,
    counters: DashMap<String, (i64, Instant)>,
    dead_letters: parking_lot::Mutex<Vec<String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn expired(deadline: &Option<Instant>) -> bool {
        deadline.map_or(false, |d| Instant::now() >= d)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entries.get(key) {
            Some(entry) if !Self::expired(&entry.1) => Ok(Some(entry.0.clone())),
            Some(_) => {
                drop(self.entries.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| (0, Instant::now() + ttl));
        if Instant::now() >= entry.1 {
            *entry = (0, Instant::now() + ttl);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        self.counters.remove(key);
        Ok(())
    }

    async fn push_dead_letter(&self, payload: &str) -> Result<()> {
        let mut letters = self.dead_letters.lock();
        letters.insert(0, payload.to_string());
        letters.truncate(DEAD_LETTER_CAP as usize);
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .dead_letters
            .lock()
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_get_set_ttl() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_incr_anchors_window_at_first_hit() {
        let cache = MemoryCache::new();
        assert_eq!(
            cache
                .incr_with_ttl("c", Duration::from_millis(50))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            cache
                .incr_with_ttl("c", Duration::from_millis(50))
                .await
                .unwrap(),
            2
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Window elapsed: counter restarts.
        assert_eq!(
            cache
                .incr_with_ttl("c", Duration::from_millis(50))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn memory_dead_letter_is_lifo_and_bounded() {
        let cache = MemoryCache::new();
        cache.push_dead_letter("first").await.unwrap();
        cache.push_dead_letter("second").await.unwrap();

        let letters = cache.dead_letters(10).await.unwrap();
        assert_eq!(letters, vec!["second".to_string(), "first".to_string()]);

        let one = cache.dead_letters(1).await.unwrap();
        assert_eq!(one, vec!["second".to_string()]);
    }

    #[tokio::test]
    async fn memory_delete_clears_both_tables() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        cache.incr_with_ttl("k", Duration::from_secs(10)).await.unwrap();
        cache.delete("k").await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(
            cache.incr_with_ttl("k", Duration::from_secs(10)).await.unwrap(),
            1
        );
    }
}
