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

//! Shared application state handed to every handler.

use crate::auth::{rate_limit::TieredRateLimiter, AuthService};
use evalforge_core::EvalForgeConfig;
use evalforge_evals::Orchestrator;
use evalforge_ingest::IngestPipeline;
use evalforge_metrics::{MetricsHandle, SubscriptionHub};
use evalforge_storage::{CacheStore, EventStore, MetadataStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EvalForgeConfig>,
    pub metadata: Arc<MetadataStore>,
    pub events: Arc<dyn EventStore>,
    pub cache: Arc<dyn CacheStore>,
    pub pipeline: Arc<IngestPipeline>,
    pub metrics: MetricsHandle,
    pub hub: Arc<SubscriptionHub>,
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<AuthService>,
    pub rate_limiter: Arc<TieredRateLimiter>,
}
