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

//! Single-writer rolling-window aggregator
//!
//! Exactly one task owns the window state; everyone else either feeds it
//! through a bounded channel (`try_send`, dropped when full — metrics are
//! best-effort and must never slow ingest) or reads the last published
//! snapshot behind an atomically swapped `Arc`.

use crate::hub::SubscriptionHub;
use crate::snapshot::{MetricsSnapshot, ProjectFigures};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use evalforge_core::EventStatus;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub snapshot_interval: Duration,
    /// Rolling window width.
    pub window: Duration,
    /// Inbox capacity; overflow drops samples.
    pub inbox_capacity: usize,
    pub reservoir_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(5),
            window: Duration::from_secs(300),
            inbox_capacity: 8192,
            reservoir_capacity: 1024,
        }
    }
}

/// One sample fed into the aggregator.
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    Trace {
        project_id: i64,
        operation_type: String,
        status: EventStatus,
        duration_ms: i64,
        cost: f64,
    },
    EvaluationStarted {
        project_id: i64,
    },
}

/// Cheap clone-able handle: producers record, readers take the latest
/// snapshot pointer.
#[derive(Clone)]
pub struct MetricsHandle {
    sender: mpsc::Sender<MetricsEvent>,
    latest: Arc<parking_lot::RwLock<Arc<MetricsSnapshot>>>,
    dropped: Arc<AtomicU64>,
}

impl MetricsHandle {
    /// Non-blocking publish. A full inbox drops the sample and bumps a
    /// counter; ingest latency is never paid here.
    pub fn try_record(&self, event: MetricsEvent) {
        if self.sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn latest(&self) -> Arc<MetricsSnapshot> {
        self.latest.read().clone()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Per-second accumulation bucket.
#[derive(Debug, Default)]
struct SecondBucket {
    epoch_sec: i64,
    events: u64,
    eval_starts: u64,
    duration_sum_ms: i64,
    per_operation: HashMap<String, u64>,
    per_status: HashMap<String, u64>,
    per_project: HashMap<i64, ProjectAccum>,
}

#[derive(Debug, Default, Clone)]
struct ProjectAccum {
    events: u64,
    errors: u64,
    duration_sum_ms: i64,
    cost_sum: f64,
}

/// Algorithm-R reservoir over observed latencies.
struct Reservoir {
    samples: Vec<f64>,
    capacity: usize,
    observed: u64,
}

impl Reservoir {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            observed: 0,
        }
    }

    fn offer(&mut self, value: f64) {
        self.observed += 1;
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            let slot = rand::thread_rng().gen_range(0..self.observed);
            if (slot as usize) < self.capacity {
                self.samples[slot as usize] = value;
            }
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
        sorted[idx]
    }
}

pub struct MetricsAggregator {
    config: AggregatorConfig,
}

impl MetricsAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    /// Spawn the writer task. Returns the shared handle.
    pub fn spawn(self, hub: Arc<SubscriptionHub>, shutdown: CancellationToken) -> MetricsHandle {
        let (sender, receiver) = mpsc::channel(self.config.inbox_capacity);
        let latest = Arc::new(parking_lot::RwLock::new(Arc::new(MetricsSnapshot::default())));
        let dropped = Arc::new(AtomicU64::new(0));

        let handle = MetricsHandle {
            sender,
            latest: latest.clone(),
            dropped,
        };

        tokio::spawn(async move {
            run_writer(self.config, receiver, latest, hub, shutdown).await;
        });

        handle
    }
}

async fn run_writer(
    config: AggregatorConfig,
    mut receiver: mpsc::Receiver<MetricsEvent>,
    latest: Arc<parking_lot::RwLock<Arc<MetricsSnapshot>>>,
    hub: Arc<SubscriptionHub>,
    shutdown: CancellationToken,
) {
    info!(
        interval_ms = config.snapshot_interval.as_millis() as u64,
        window_s = config.window.as_secs(),
        "metrics aggregator started"
    );

    let mut buckets: VecDeque<SecondBucket> = VecDeque::new();
    let mut reservoir = Reservoir::new(config.reservoir_capacity);
    let mut total_events: u64 = 0;
    let mut last_emitted: Option<DateTime<Utc>> = None;

    let mut ticker = tokio::time::interval(config.snapshot_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_event = receiver.recv() => {
                match maybe_event {
                    Some(event) => {
                        apply_event(&mut buckets, &mut reservoir, &mut total_events, event);
                    }
                    None => {
                        info!("metrics inbox closed, aggregator stopping");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                let snapshot = build_snapshot(
                    &mut buckets,
                    &reservoir,
                    total_events,
                    config.window,
                    &mut last_emitted,
                );
                let snapshot = Arc::new(snapshot);
                *latest.write() = snapshot.clone();
                hub.broadcast(snapshot);
            }
            _ = shutdown.cancelled() => {
                debug!("metrics aggregator shutting down");
                break;
            }
        }
    }
}

fn apply_event(
    buckets: &mut VecDeque<SecondBucket>,
    reservoir: &mut Reservoir,
    total_events: &mut u64,
    event: MetricsEvent,
) {
    let now_sec = Utc::now().timestamp();
    if buckets.back().map_or(true, |b| b.epoch_sec != now_sec) {
        buckets.push_back(SecondBucket {
            epoch_sec: now_sec,
            ..Default::default()
        });
    }
    let bucket = buckets.back_mut().unwrap();

    match event {
        MetricsEvent::Trace {
            project_id,
            operation_type,
            status,
            duration_ms,
            cost,
        } => {
            *total_events += 1;
            bucket.events += 1;
            bucket.duration_sum_ms += duration_ms;
            *bucket.per_operation.entry(operation_type).or_default() += 1;
            *bucket
                .per_status
                .entry(status.as_str().to_string())
                .or_default() += 1;
            let proj = bucket.per_project.entry(project_id).or_default();
            proj.events += 1;
            proj.duration_sum_ms += duration_ms;
            proj.cost_sum += cost;
            if status.is_error() {
                proj.errors += 1;
            }
            reservoir.offer(duration_ms as f64);
        }
        MetricsEvent::EvaluationStarted { project_id } => {
            bucket.eval_starts += 1;
            bucket.per_project.entry(project_id).or_default();
        }
    }
}

fn build_snapshot(
    buckets: &mut VecDeque<SecondBucket>,
    reservoir: &Reservoir,
    total_events: u64,
    window: Duration,
    last_emitted: &mut Option<DateTime<Utc>>,
) -> MetricsSnapshot {
    let now = Utc::now();
    // Snapshots are totally ordered by timestamp even when ticks land in
    // the same millisecond.
    let timestamp = match last_emitted {
        Some(prev) if now <= *prev => *prev + ChronoDuration::milliseconds(1),
        _ => now,
    };
    *last_emitted = Some(timestamp);

    let horizon = now.timestamp() - window.as_secs() as i64;
    while buckets.front().map_or(false, |b| b.epoch_sec < horizon) {
        buckets.pop_front();
    }

    let mut operation_counts: HashMap<String, u64> = HashMap::new();
    let mut status_counts: HashMap<String, u64> = HashMap::new();
    let mut per_project_accum: HashMap<i64, ProjectAccum> = HashMap::new();
    let mut window_events: u64 = 0;
    let mut window_errors: u64 = 0;
    let mut window_duration_sum: i64 = 0;
    let mut eval_starts: u64 = 0;

    for bucket in buckets.iter() {
        window_events += bucket.events;
        window_duration_sum += bucket.duration_sum_ms;
        eval_starts += bucket.eval_starts;
        for (op, n) in &bucket.per_operation {
            *operation_counts.entry(op.clone()).or_default() += n;
        }
        for (status, n) in &bucket.per_status {
            if status != "success" {
                window_errors += n;
            }
            *status_counts.entry(status.clone()).or_default() += n;
        }
        for (project, accum) in &bucket.per_project {
            let entry = per_project_accum.entry(*project).or_default();
            entry.events += accum.events;
            entry.errors += accum.errors;
            entry.duration_sum_ms += accum.duration_sum_ms;
            entry.cost_sum += accum.cost_sum;
        }
    }

    let window_minutes = (window.as_secs_f64() / 60.0).max(f64::EPSILON);
    let per_project = per_project_accum
        .into_iter()
        .map(|(project, a)| {
            (
                project,
                ProjectFigures {
                    events: a.events,
                    errors: a.errors,
                    events_per_minute: a.events as f64 / window_minutes,
                    error_rate: if a.events > 0 {
                        a.errors as f64 / a.events as f64
                    } else {
                        0.0
                    },
                    avg_latency_ms: if a.events > 0 {
                        a.duration_sum_ms as f64 / a.events as f64
                    } else {
                        0.0
                    },
                    cost_per_hour: a.cost_sum * 3600.0 / window.as_secs_f64(),
                },
            )
        })
        .collect::<HashMap<_, _>>();

    MetricsSnapshot {
        timestamp,
        total_events,
        events_per_minute: window_events as f64 / window_minutes,
        avg_latency_ms: if window_events > 0 {
            window_duration_sum as f64 / window_events as f64
        } else {
            0.0
        },
        p95_latency_ms: reservoir.percentile(0.95),
        error_rate: if window_events > 0 {
            window_errors as f64 / window_events as f64
        } else {
            0.0
        },
        active_projects: per_project.len() as u64,
        recent_evaluations: eval_starts,
        operation_counts,
        status_counts,
        per_project,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubConfig, SubscriptionHub};

    fn trace(project_id: i64, status: EventStatus, duration_ms: i64) -> MetricsEvent {
        MetricsEvent::Trace {
            project_id,
            operation_type: "chat".into(),
            status,
            duration_ms,
            cost: 0.01,
        }
    }

    #[tokio::test]
    async fn snapshots_reflect_recorded_events() {
        let hub = Arc::new(SubscriptionHub::new(HubConfig::default()));
        let shutdown = CancellationToken::new();
        let aggregator = MetricsAggregator::new(AggregatorConfig {
            snapshot_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let handle = aggregator.spawn(hub, shutdown.clone());

        handle.try_record(trace(1, EventStatus::Success, 100));
        handle.try_record(trace(1, EventStatus::Success, 200));
        handle.try_record(trace(1, EventStatus::Error, 300));

        tokio::time::sleep(Duration::from_millis(80)).await;

        let snap = handle.latest();
        assert_eq!(snap.total_events, 3);
        assert_eq!(snap.operation_counts.get("chat"), Some(&3));
        assert_eq!(snap.status_counts.get("error"), Some(&1));
        assert!((snap.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((snap.avg_latency_ms - 200.0).abs() < 1e-9);
        assert_eq!(snap.active_projects, 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn totals_are_monotone_and_timestamps_strictly_increase() {
        let hub = Arc::new(SubscriptionHub::new(HubConfig::default()));
        let shutdown = CancellationToken::new();
        let aggregator = MetricsAggregator::new(AggregatorConfig {
            snapshot_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let handle = aggregator.spawn(hub, shutdown.clone());

        let mut prev_total = 0;
        let mut prev_ts = None;
        for i in 0..5 {
            handle.try_record(trace(1, EventStatus::Success, i * 10));
            tokio::time::sleep(Duration::from_millis(25)).await;
            let snap = handle.latest();
            assert!(snap.total_events >= prev_total);
            prev_total = snap.total_events;
            if let Some(prev) = prev_ts {
                assert!(snap.timestamp > prev, "snapshot timestamps must increase");
            }
            prev_ts = Some(snap.timestamp);
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn evaluation_marks_count_in_window() {
        let hub = Arc::new(SubscriptionHub::new(HubConfig::default()));
        let shutdown = CancellationToken::new();
        let aggregator = MetricsAggregator::new(AggregatorConfig {
            snapshot_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let handle = aggregator.spawn(hub, shutdown.clone());

        handle.try_record(MetricsEvent::EvaluationStarted { project_id: 7 });
        handle.try_record(MetricsEvent::EvaluationStarted { project_id: 7 });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let snap = handle.latest();
        assert_eq!(snap.recent_evaluations, 2);

        shutdown.cancel();
    }

    #[test]
    fn reservoir_is_bounded_and_orders_percentiles() {
        let mut r = Reservoir::new(64);
        for i in 0..10_000 {
            r.offer((i % 1000) as f64);
        }
        assert_eq!(r.samples.len(), 64);
        assert!(r.percentile(0.95) >= r.percentile(0.5));
    }
}
