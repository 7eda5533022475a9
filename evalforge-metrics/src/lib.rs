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

//! Real-time metrics fan-out
//!
//! A single-writer aggregator consumes accepted-event samples, keeps a
//! five-minute rolling window, and publishes an immutable snapshot at a
//! fixed cadence. The subscription hub relays snapshots to live
//! dashboard clients, dropping the slowest rather than ever blocking the
//! writer. The alert evaluator joins snapshots against per-project
//! thresholds.

pub mod aggregator;
pub mod alerts;
pub mod hub;
pub mod snapshot;

pub use aggregator::{AggregatorConfig, MetricsAggregator, MetricsEvent, MetricsHandle};
pub use alerts::{evaluate_thresholds, AlertEvaluator, NotificationSink};
pub use hub::{HubConfig, SubscriberHandle, SubscriptionHub};
pub use snapshot::{MetricsSnapshot, ProjectFigures};
