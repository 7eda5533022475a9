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

//! Storage adapters
//!
//! Three tiers with distinct jobs:
//!
//! - **Metadata store** — PostgreSQL. Tenants, projects, API keys and all
//!   evaluation artifacts, with cascading ownership.
//! - **Event store** — append-only wide table for trace events, columnar
//!   (ClickHouse) preferred with a relational fallback behind the same
//!   [`EventStore`] trait. Exactly one backend is live per process.
//! - **Cache/KV** — Redis (or an in-process substitute) for rate-limit
//!   counters, analytics caches and the ingestion dead-letter list.

pub mod cache;
mod error;
pub mod events;
pub mod metadata;

pub use cache::{CacheStore, MemoryCache, RedisCache};
pub use events::{
    AnalyticsSummary, ClickHouseEventStore, ErrorSlice, EventFilter, EventPage, EventStore,
    LatencyStats, MemoryEventStore, ModelCost, PostgresEventStore, PromptSample, TimeRange,
    TraceSummary,
};
pub use metadata::MetadataStore;
