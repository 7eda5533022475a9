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

//! Batch writer
//!
//! Workers drain the ingest queue in chunks of `batch_size` or
//! `flush_interval`, whichever comes first, and land each chunk in the
//! event store with one bulk insert. Retryable failures back off
//! exponentially; a chunk that exhausts its attempts goes to the
//! dead-letter list in the cache tier, with a reason, and is counted. A
//! flush in progress always runs to completion — shutdown is honored
//! between chunks.

use crate::queue::QueueReceiver;
use evalforge_core::TraceEvent;
use evalforge_storage::{CacheStore, EventStore};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub workers: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            workers: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStats {
    pub events_written: u64,
    pub batches_written: u64,
    pub retries: u64,
    pub events_dead_lettered: u64,
}

#[derive(Default)]
struct WriterStatsInternal {
    events_written: AtomicU64,
    batches_written: AtomicU64,
    retries: AtomicU64,
    events_dead_lettered: AtomicU64,
}

impl WriterStatsInternal {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            events_written: self.events_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            events_dead_lettered: self.events_dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
struct DeadLetter<'a> {
    reason: String,
    event: &'a TraceEvent,
}

pub struct BatchWriter {
    config: BatcherConfig,
    store: Arc<dyn EventStore>,
    cache: Arc<dyn CacheStore>,
    stats: Arc<WriterStatsInternal>,
}

impl BatchWriter {
    pub fn new(
        config: BatcherConfig,
        store: Arc<dyn EventStore>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            stats: Arc::new(WriterStatsInternal::default()),
        }
    }

    pub fn stats(&self) -> WriterStats {
        self.stats.snapshot()
    }

    /// Spawn the worker pool. Workers exit when the queue closes or
    /// shutdown is requested.
    pub fn spawn(&self, receiver: QueueReceiver, shutdown: CancellationToken) {
        for worker_id in 0..self.config.workers.max(1) {
            let config = self.config.clone();
            let store = self.store.clone();
            let cache = self.cache.clone();
            let stats = self.stats.clone();
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                run_worker(worker_id, config, store, cache, stats, receiver, shutdown).await;
            });
        }
    }
}

async fn run_worker(
    worker_id: usize,
    config: BatcherConfig,
    store: Arc<dyn EventStore>,
    cache: Arc<dyn CacheStore>,
    stats: Arc<WriterStatsInternal>,
    receiver: QueueReceiver,
    shutdown: CancellationToken,
) {
    info!(
        worker = worker_id,
        batch_size = config.batch_size,
        flush_ms = config.flush_interval.as_millis() as u64,
        "batch writer started"
    );

    loop {
        if shutdown.is_cancelled() {
            // Drain whatever is immediately available, then stop.
            if let Some(chunk) = receiver.next_chunk(config.batch_size, Duration::ZERO).await {
                if !chunk.is_empty() {
                    flush_chunk(&config, &store, &cache, &stats, chunk).await;
                    continue;
                }
            }
            debug!(worker = worker_id, "batch writer shutting down");
            break;
        }

        match receiver
            .next_chunk(config.batch_size, config.flush_interval)
            .await
        {
            Some(chunk) if chunk.is_empty() => continue,
            Some(chunk) => flush_chunk(&config, &store, &cache, &stats, chunk).await,
            None => {
                info!(worker = worker_id, "ingest queue closed, writer exiting");
                break;
            }
        }
    }
}

/// Write one chunk, retrying on retryable failures. Not cancellable: the
/// chunk either lands in the store or in the dead-letter list.
async fn flush_chunk(
    config: &BatcherConfig,
    store: &Arc<dyn EventStore>,
    cache: &Arc<dyn CacheStore>,
    stats: &Arc<WriterStatsInternal>,
    chunk: Vec<TraceEvent>,
) {
    let mut backoff = config.initial_backoff;
    let mut last_error = String::new();

    for attempt in 1..=config.max_attempts {
        match store.insert_batch(&chunk).await {
            Ok(_) => {
                stats
                    .events_written
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                stats.batches_written.fetch_add(1, Ordering::Relaxed);
                debug!(events = chunk.len(), attempt, "chunk flushed");
                return;
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "event store write failed, backing off"
                );
                stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
                last_error = e.to_string();
            }
            Err(e) => {
                last_error = e.to_string();
                break;
            }
        }
    }

    error!(
        events = chunk.len(),
        error = %last_error,
        "chunk permanently failed, dead-lettering"
    );
    stats
        .events_dead_lettered
        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    for event in &chunk {
        let letter = DeadLetter {
            reason: last_error.clone(),
            event,
        };
        match serde_json::to_string(&letter) {
            Ok(payload) => {
                if let Err(e) = cache.push_dead_letter(&payload).await {
                    error!(error = %e, "dead-letter write failed, event lost");
                }
            }
            Err(e) => error!(error = %e, "dead-letter serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use chrono::Utc;
    use evalforge_core::EventStatus;
    use evalforge_storage::{MemoryCache, MemoryEventStore};

    fn event(id: &str) -> TraceEvent {
        TraceEvent {
            event_id: id.into(),
            project_id: 1,
            trace_id: "t".into(),
            span_id: id.into(),
            parent_span_id: None,
            operation_type: "chat".into(),
            status: EventStatus::Success,
            start_time: Utc::now(),
            end_time: Utc::now(),
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            cost: 0.0,
            provider: String::new(),
            model: String::new(),
            error_message: None,
        }
    }

    fn writer(
        store: Arc<MemoryEventStore>,
        cache: Arc<MemoryCache>,
        max_attempts: u32,
    ) -> BatchWriter {
        BatchWriter::new(
            BatcherConfig {
                batch_size: 10,
                flush_interval: Duration::from_millis(20),
                max_attempts,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                workers: 1,
            },
            store,
            cache,
        )
    }

    #[tokio::test]
    async fn drains_queue_into_store() {
        let store = Arc::new(MemoryEventStore::new());
        let cache = Arc::new(MemoryCache::new());
        let (queue, receiver) = queue::bounded(100);
        let shutdown = CancellationToken::new();

        let w = writer(store.clone(), cache, 3);
        w.spawn(receiver, shutdown.clone());

        for i in 0..25 {
            queue.try_push(event(&format!("e{i}"))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(store.count_events(1).await.unwrap(), 25);
        let stats = w.stats();
        assert_eq!(stats.events_written, 25);
        assert!(stats.batches_written >= 3);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let store = Arc::new(MemoryEventStore::new());
        store.fail_next_inserts.store(2, Ordering::Relaxed);
        let cache = Arc::new(MemoryCache::new());
        let (queue, receiver) = queue::bounded(100);
        let shutdown = CancellationToken::new();

        let w = writer(store.clone(), cache.clone(), 5);
        w.spawn(receiver, shutdown.clone());

        queue.try_push(event("e1")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.count_events(1).await.unwrap(), 1);
        let stats = w.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.events_dead_lettered, 0);
        assert!(cache.dead_letters(10).await.unwrap().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let store = Arc::new(MemoryEventStore::new());
        store.fail_next_inserts.store(100, Ordering::Relaxed);
        let cache = Arc::new(MemoryCache::new());
        let (queue, receiver) = queue::bounded(100);
        let shutdown = CancellationToken::new();

        let w = writer(store.clone(), cache.clone(), 2);
        w.spawn(receiver, shutdown.clone());

        queue.try_push(event("doomed")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(w.stats().events_dead_lettered, 1);
        let letters = cache.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].contains("doomed"));
        assert!(letters[0].contains("reason"));
        shutdown.cancel();
    }
}
