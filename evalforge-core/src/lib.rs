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

//! Core domain types for EvalForge
//!
//! Shared between the storage adapters, the ingestion pipeline, the
//! real-time metrics fan-out and the auto-evaluation loop. This crate is
//! deliberately free of I/O: entities, the error taxonomy, prompt
//! fingerprinting and runtime configuration only.

pub mod alert;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod event;
pub mod fingerprint;
pub mod project;
pub mod suggestion;

pub use alert::{
    AlertIntent, AlertMetric, AlertOperator, AlertThreshold, NotificationChannel,
    NotificationConfig,
};
pub use config::EvalForgeConfig;
pub use error::{Error, ErrorKind, Result};
pub use evaluation::{
    EvalPhase, Evaluation, EvaluationMetrics, EvaluationStatus, PromptAnalysis, TaskType,
    TestCase, TestCaseStatus, TestCategory,
};
pub use event::{input_text_of, EventStatus, TraceEvent};
pub use fingerprint::{NormalizerConfig, PromptFingerprint};
pub use project::{ApiKey, Project, User};
pub use suggestion::{
    OptimizationSuggestion, SuggestionCategory, SuggestionPriority, SuggestionStatus,
};
