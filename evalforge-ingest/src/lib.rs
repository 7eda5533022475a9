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

//! Event ingestion pipeline
//!
//! The hot path: admission check against queue depth, per-event
//! validation with partial acceptance, a durable-enqueue acknowledgment,
//! then background batch writers draining into the event store with
//! retry and dead-lettering. An accepted batch is acknowledged when it is
//! *enqueued*, not when it is stored; callers are told as much.

pub mod batcher;
pub mod pipeline;
pub mod queue;
pub mod validation;

pub use batcher::{BatchWriter, BatcherConfig, WriterStats};
pub use pipeline::{IngestPipeline, IngestReport, PipelineConfig, ProjectResolver, StaticProjects};
pub use queue::{EventQueue, QueueReceiver};
pub use validation::{validate_batch_size, validate_event, RejectReason, RejectedEvent};
