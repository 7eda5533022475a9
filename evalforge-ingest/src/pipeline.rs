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

//! Ingest front door
//!
//! `ingest()` is the whole hot path: fail-fast admission on queue depth,
//! per-event validation with partial acceptance, non-blocking enqueue,
//! and a best-effort publish to the metrics aggregator. The only await
//! that can touch storage is the project-ownership check, and that is
//! cached after the first resolve.

use crate::queue::EventQueue;
use crate::validation::{validate_batch_size, validate_event, RejectedEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evalforge_core::{Error, Result, TraceEvent};
use evalforge_metrics::{MetricsEvent, MetricsHandle};
use evalforge_storage::MetadataStore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Resolves whether a project exists; the pipeline caches positives.
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    async fn project_exists(&self, project_id: i64) -> Result<bool>;
}

#[async_trait]
impl ProjectResolver for MetadataStore {
    async fn project_exists(&self, project_id: i64) -> Result<bool> {
        MetadataStore::project_exists(self, project_id).await
    }
}

/// Fixed project set, for tests and single-tenant deployments.
pub struct StaticProjects(pub HashSet<i64>);

#[async_trait]
impl ProjectResolver for StaticProjects {
    async fn project_exists(&self, project_id: i64) -> Result<bool> {
        Ok(self.0.contains(&project_id))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// TTL of the positive project-ownership cache.
    pub ownership_cache_ttl: Duration,
    pub ownership_cache_size: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ownership_cache_ttl: Duration::from_secs(60),
            ownership_cache_size: 10_000,
        }
    }
}

/// The acknowledgment: durable *enqueue*, not durable storage.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: Vec<RejectedEvent>,
    pub ingested_at: DateTime<Utc>,
}

pub struct IngestPipeline {
    queue: EventQueue,
    projects: Arc<dyn ProjectResolver>,
    ownership_cache: moka::future::Cache<i64, ()>,
    metrics: Option<MetricsHandle>,
    accepted_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl IngestPipeline {
    pub fn new(
        config: PipelineConfig,
        queue: EventQueue,
        projects: Arc<dyn ProjectResolver>,
        metrics: Option<MetricsHandle>,
    ) -> Self {
        let ownership_cache = moka::future::Cache::builder()
            .max_capacity(config.ownership_cache_size)
            .time_to_live(config.ownership_cache_ttl)
            .build();
        Self {
            queue,
            projects,
            ownership_cache,
            metrics,
            accepted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.accepted_total.load(Ordering::Relaxed),
            self.rejected_total.load(Ordering::Relaxed),
        )
    }

    /// Only positive resolutions are cached; a deleted project falls out
    /// after the TTL.
    async fn project_exists_cached(&self, project_id: i64) -> Result<bool> {
        if self.ownership_cache.get(&project_id).await.is_some() {
            return Ok(true);
        }
        let exists = self.projects.project_exists(project_id).await?;
        if exists {
            self.ownership_cache.insert(project_id, ()).await;
        }
        Ok(exists)
    }

    #[tracing::instrument(skip(self, events), fields(batch = events.len()))]
    pub async fn ingest(&self, project_id: i64, events: Vec<TraceEvent>) -> Result<IngestReport> {
        validate_batch_size(events.len())?;

        if self.queue.is_saturated() {
            return Err(Error::Backpressure {
                queue_depth: self.queue.depth(),
            });
        }

        if !self.project_exists_cached(project_id).await? {
            return Err(Error::Forbidden(format!(
                "project {project_id} does not exist or is not yours"
            )));
        }

        let mut accepted = 0usize;
        let mut rejected = Vec::new();
        let mut saturated = false;

        for (index, event) in events.into_iter().enumerate() {
            if let Err(reason) = validate_event(&event, project_id) {
                rejected.push(RejectedEvent {
                    index,
                    reason: reason.to_string(),
                });
                continue;
            }

            if saturated {
                rejected.push(RejectedEvent {
                    index,
                    reason: "backpressure".into(),
                });
                continue;
            }

            let sample = MetricsEvent::Trace {
                project_id: event.project_id,
                operation_type: event.operation_type.clone(),
                status: event.status,
                duration_ms: event.duration_ms(),
                cost: event.cost,
            };

            match self.queue.try_push(event) {
                Ok(()) => {
                    accepted += 1;
                    // Best-effort: a full aggregator inbox drops the
                    // sample, never the event.
                    if let Some(metrics) = &self.metrics {
                        metrics.try_record(sample);
                    }
                }
                Err(Error::Backpressure { .. }) => {
                    // Events already enqueued stand; the rest of the
                    // batch is the caller's to retry.
                    saturated = true;
                    rejected.push(RejectedEvent {
                        index,
                        reason: "backpressure".into(),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        if accepted == 0 && saturated {
            return Err(Error::Backpressure {
                queue_depth: self.queue.depth(),
            });
        }

        self.accepted_total
            .fetch_add(accepted as u64, Ordering::Relaxed);
        self.rejected_total
            .fetch_add(rejected.len() as u64, Ordering::Relaxed);
        debug!(accepted, rejected = rejected.len(), "batch admitted");

        Ok(IngestReport {
            accepted,
            rejected,
            ingested_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatchWriter, BatcherConfig};
    use crate::queue;
    use evalforge_core::EventStatus;
    use evalforge_storage::{EventStore, MemoryCache, MemoryEventStore};
    use tokio_util::sync::CancellationToken;

    fn event(project_id: i64, id: &str) -> TraceEvent {
        TraceEvent {
            event_id: id.into(),
            project_id,
            trace_id: "t".into(),
            span_id: id.into(),
            parent_span_id: None,
            operation_type: "chat".into(),
            status: EventStatus::Success,
            start_time: Utc::now() - chrono::Duration::seconds(2),
            end_time: Utc::now() - chrono::Duration::seconds(1),
            input: serde_json::json!({"prompt": "hello"}),
            output: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            prompt_tokens: 5,
            completion_tokens: 5,
            total_tokens: 10,
            cost: 0.001,
            provider: "openai".into(),
            model: "gpt-4o".into(),
            error_message: None,
        }
    }

    fn pipeline(capacity: usize) -> (IngestPipeline, crate::queue::QueueReceiver) {
        let (q, receiver) = queue::bounded(capacity);
        let projects = Arc::new(StaticProjects(HashSet::from([1])));
        (
            IngestPipeline::new(PipelineConfig::default(), q, projects, None),
            receiver,
        )
    }

    #[tokio::test]
    async fn partial_batch_accepts_valid_subset() {
        let (pipeline, _receiver) = pipeline(100);

        let good = event(1, "e0");
        let mut bad = event(1, "e1");
        bad.end_time = bad.start_time - chrono::Duration::seconds(1);

        let report = pipeline.ingest(1, vec![good, bad]).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 1);
        assert_eq!(report.rejected[0].reason, "end_before_start");
    }

    #[tokio::test]
    async fn unknown_project_is_forbidden() {
        let (pipeline, _receiver) = pipeline(100);
        let err = pipeline.ingest(99, vec![event(99, "e0")]).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn saturated_queue_rejects_fast() {
        let (pipeline, receiver) = pipeline(2);

        pipeline
            .ingest(1, vec![event(1, "a"), event(1, "b")])
            .await
            .unwrap();

        let err = pipeline.ingest(1, vec![event(1, "c")]).await.unwrap_err();
        assert!(matches!(err, Error::Backpressure { .. }));

        // Draining a chunk opens admission again.
        receiver
            .next_chunk(2, Duration::from_millis(50))
            .await
            .unwrap();
        pipeline.ingest(1, vec![event(1, "c")]).await.unwrap();
    }

    #[tokio::test]
    async fn mid_batch_saturation_keeps_enqueued_events() {
        let (pipeline, _receiver) = pipeline(2);

        let report = pipeline
            .ingest(1, vec![event(1, "a"), event(1, "b"), event(1, "c")])
            .await
            .unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].reason, "backpressure");
    }

    #[tokio::test]
    async fn idempotent_resubmission_is_single_row() {
        let (q, receiver) = queue::bounded(100);
        let projects = Arc::new(StaticProjects(HashSet::from([1])));
        let pipeline = IngestPipeline::new(PipelineConfig::default(), q, projects, None);

        let store = Arc::new(MemoryEventStore::new());
        let cache = Arc::new(MemoryCache::new());
        let writer = BatchWriter::new(
            BatcherConfig {
                batch_size: 10,
                flush_interval: Duration::from_millis(10),
                workers: 1,
                ..Default::default()
            },
            store.clone(),
            cache,
        );
        let shutdown = CancellationToken::new();
        writer.spawn(receiver, shutdown.clone());

        let first = pipeline.ingest(1, vec![event(1, "e1")]).await.unwrap();
        let second = pipeline.ingest(1, vec![event(1, "e1")]).await.unwrap();
        assert_eq!(first.accepted, 1);
        assert_eq!(second.accepted, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.count_events(1).await.unwrap(), 1);
        shutdown.cancel();
    }
}
