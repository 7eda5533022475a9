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

//! The immutable rolling view handed to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-project figures inside one snapshot; also the input the alert
/// evaluator compares against thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectFigures {
    pub events: u64,
    pub errors: u64,
    pub events_per_minute: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub cost_per_hour: f64,
}

/// Snapshot of the last rolling window, produced by the single writer at
/// each tick. `total_events` is monotone and `timestamp` strictly
/// increases across snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Lifetime accepted events, monotone non-decreasing.
    pub total_events: u64,
    pub events_per_minute: f64,
    pub avg_latency_ms: f64,
    /// From the reservoir sampler, so it survives bursts without keeping
    /// every observation.
    pub p95_latency_ms: f64,
    pub error_rate: f64,
    pub active_projects: u64,
    /// Evaluations that entered Running within the window.
    pub recent_evaluations: u64,
    /// Window counts keyed by operation type.
    pub operation_counts: HashMap<String, u64>,
    /// Window counts keyed by event status.
    pub status_counts: HashMap<String, u64>,
    pub per_project: HashMap<i64, ProjectFigures>,
}

impl MetricsSnapshot {
    /// Whether the snapshot is relevant to a subscriber filtered on one
    /// project.
    pub fn mentions_project(&self, project_id: i64) -> bool {
        self.per_project.contains_key(&project_id)
    }
}
