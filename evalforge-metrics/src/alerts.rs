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

//! Alert evaluation loop
//!
//! Periodically joins the latest metrics snapshot against enabled
//! per-project thresholds. A fired threshold updates `last_triggered` and
//! emits an [`AlertIntent`] to the notification sink; delivery transport
//! is an external collaborator behind the trait.

use crate::aggregator::MetricsHandle;
use crate::snapshot::{MetricsSnapshot, ProjectFigures};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evalforge_core::{AlertIntent, AlertMetric, AlertThreshold};
use evalforge_storage::MetadataStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Hands fired intents to whatever delivers them (Slack, email, webhook
/// fan-out). Implementations must not block the evaluator for long.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, intent: AlertIntent);
}

/// Sink that only logs; the default until a delivery collaborator is
/// wired in.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, intent: AlertIntent) {
        info!(
            project = intent.project_id,
            metric = intent.metric.as_str(),
            observed = intent.observed,
            threshold = intent.threshold,
            "alert fired"
        );
    }
}

fn observed_value(figures: &ProjectFigures, metric: AlertMetric) -> f64 {
    match metric {
        AlertMetric::ErrorRate => figures.error_rate,
        AlertMetric::AvgLatencyMs => figures.avg_latency_ms,
        AlertMetric::EventsPerMinute => figures.events_per_minute,
        AlertMetric::CostPerHour => figures.cost_per_hour,
    }
}

/// Pure comparison pass: which thresholds fire against this snapshot at
/// `now`. Disabled rows and rows inside their cooldown never fire.
pub fn evaluate_thresholds(
    thresholds: &[AlertThreshold],
    snapshot: &MetricsSnapshot,
    now: DateTime<Utc>,
) -> Vec<AlertIntent> {
    let idle = ProjectFigures::default();
    thresholds
        .iter()
        .filter_map(|threshold| {
            let figures = snapshot
                .per_project
                .get(&threshold.project_id)
                .unwrap_or(&idle);
            let observed = observed_value(figures, threshold.metric);
            threshold.should_fire(observed, now).then(|| AlertIntent {
                project_id: threshold.project_id,
                metric: threshold.metric,
                observed,
                threshold: threshold.value,
                operator: threshold.operator,
                timestamp: now,
            })
        })
        .collect()
}

pub struct AlertEvaluator {
    metadata: Arc<MetadataStore>,
    metrics: MetricsHandle,
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
}

impl AlertEvaluator {
    pub fn new(
        metadata: Arc<MetadataStore>,
        metrics: MetricsHandle,
        sink: Arc<dyn NotificationSink>,
        interval: Duration,
    ) -> Self {
        Self {
            metadata,
            metrics,
            sink,
            interval,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            self.run(shutdown).await;
        });
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(interval_s = self.interval.as_secs(), "alert evaluator started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.evaluate_once().await {
                        error!(error = %e, "alert evaluation pass failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("alert evaluator shutting down");
                    break;
                }
            }
        }
    }

    async fn evaluate_once(&self) -> evalforge_core::Result<()> {
        let thresholds = self.metadata.list_enabled_thresholds().await?;
        if thresholds.is_empty() {
            return Ok(());
        }
        let snapshot = self.metrics.latest();
        let now = Utc::now();
        let intents = evaluate_thresholds(&thresholds, &snapshot, now);

        for intent in intents {
            // Persist the fire time first so a sink failure cannot cause
            // a re-fire inside the cooldown.
            if let Some(threshold) = thresholds
                .iter()
                .find(|t| t.project_id == intent.project_id && t.metric == intent.metric)
            {
                self.metadata.set_last_triggered(threshold.id, now).await?;
            }
            self.sink.deliver(intent).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use evalforge_core::AlertOperator;

    fn threshold(metric: AlertMetric, operator: AlertOperator, value: f64) -> AlertThreshold {
        AlertThreshold {
            id: 1,
            project_id: 10,
            metric,
            operator,
            value,
            window_minutes: 5,
            cooldown_minutes: 15,
            last_triggered: None,
            enabled: true,
        }
    }

    fn snapshot_with(project_id: i64, figures: ProjectFigures) -> MetricsSnapshot {
        let mut s = MetricsSnapshot {
            timestamp: Utc::now(),
            ..Default::default()
        };
        s.per_project.insert(project_id, figures);
        s
    }

    #[test]
    fn fires_on_matching_comparison() {
        let snapshot = snapshot_with(
            10,
            ProjectFigures {
                error_rate: 0.25,
                ..Default::default()
            },
        );
        let thresholds = vec![threshold(AlertMetric::ErrorRate, AlertOperator::Gte, 0.2)];
        let intents = evaluate_thresholds(&thresholds, &snapshot, Utc::now());
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].project_id, 10);
        assert!((intents[0].observed - 0.25).abs() < 1e-9);
    }

    #[test]
    fn strict_greater_at_equality_does_not_fire() {
        let snapshot = snapshot_with(
            10,
            ProjectFigures {
                avg_latency_ms: 500.0,
                ..Default::default()
            },
        );
        let gt = vec![threshold(AlertMetric::AvgLatencyMs, AlertOperator::Gt, 500.0)];
        assert!(evaluate_thresholds(&gt, &snapshot, Utc::now()).is_empty());

        let gte = vec![threshold(AlertMetric::AvgLatencyMs, AlertOperator::Gte, 500.0)];
        assert_eq!(evaluate_thresholds(&gte, &snapshot, Utc::now()).len(), 1);
    }

    #[test]
    fn cooldown_suppresses_refire() {
        let now = Utc::now();
        let snapshot = snapshot_with(
            10,
            ProjectFigures {
                error_rate: 1.0,
                ..Default::default()
            },
        );
        let mut t = threshold(AlertMetric::ErrorRate, AlertOperator::Gte, 0.5);
        t.last_triggered = Some(now - ChronoDuration::minutes(5));
        assert!(evaluate_thresholds(&[t.clone()], &snapshot, now).is_empty());

        t.last_triggered = Some(now - ChronoDuration::minutes(16));
        assert_eq!(evaluate_thresholds(&[t], &snapshot, now).len(), 1);
    }

    #[test]
    fn idle_project_is_observed_as_zero() {
        let snapshot = MetricsSnapshot::default();
        let thresholds = vec![threshold(
            AlertMetric::EventsPerMinute,
            AlertOperator::Lt,
            1.0,
        )];
        // No traffic at all still satisfies "events per minute < 1".
        assert_eq!(
            evaluate_thresholds(&thresholds, &snapshot, Utc::now()).len(),
            1
        );
    }
}
