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

//! EvalForge server
//!
//! Wires the storage adapters, ingestion pipeline, metrics fan-out and
//! auto-evaluation loop behind one axum application, then serves it with
//! graceful shutdown. Startup distinguishes configuration errors (exit
//! code 1) from storage initialization failures (exit code 2).

pub mod api;
pub mod auth;
pub mod state;

use api::{
    alerts, analytics, auth_routes, evaluations, events, export, health, ingest, projects,
    stream, suggestions,
};
use auth::{auth_middleware, rate_limit::TieredRateLimiter, AuthService};
use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Router,
};
use evalforge_core::EvalForgeConfig;
use evalforge_evals::{
    CircuitBreaker, CircuitBreakerConfig, LlmClient, MockLlm, OpenAiClient, Orchestrator,
    OrchestratorConfig,
};
use evalforge_ingest::{queue, BatchWriter, BatcherConfig, IngestPipeline, PipelineConfig};
use evalforge_metrics::{
    AggregatorConfig, AlertEvaluator, HubConfig, MetricsAggregator, SubscriptionHub,
};
use evalforge_metrics::alerts::LogSink;
use evalforge_storage::{
    CacheStore, ClickHouseEventStore, EventStore, MemoryCache, MetadataStore,
    PostgresEventStore, RedisCache,
};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage initialization failed: {0}")]
    Storage(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ServerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Config(_) => 1,
            ServerError::Storage(_) => 2,
            ServerError::Runtime(_) => 1,
        }
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evalforge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub async fn run_server(config: EvalForgeConfig) -> Result<(), ServerError> {
    config
        .validate()
        .map_err(|e| ServerError::Config(e.to_string()))?;
    info!(port = config.server.port, "starting EvalForge server");

    let shutdown = CancellationToken::new();
    let (state, _writer) = build_state(Arc::new(config), shutdown.clone())
        .await?;

    let addr = format!(
        "{}:{}",
        state.config.server.bind_addr, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Config(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "listening");

    let app = build_router(state);
    let shutdown_signal = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining");
        shutdown_signal.cancel();
    });

    serve
        .await
        .map_err(|e| ServerError::Runtime(e.to_string()))?;
    info!("server stopped cleanly");
    Ok(())
}

/// Construct every subsystem and spawn the background tasks. Returned
/// separately from serving so tests can assemble a full application
/// against in-process fakes.
pub async fn build_state(
    config: Arc<EvalForgeConfig>,
    shutdown: CancellationToken,
) -> Result<(AppState, BatchWriter), ServerError> {
    // Metadata store is mandatory.
    let postgres_url = config
        .storage
        .postgres_url
        .as_deref()
        .ok_or_else(|| ServerError::Config("postgres_url is required".into()))?;
    let metadata = Arc::new(
        MetadataStore::connect(postgres_url, config.storage.pg_pool_size)
            .await
            .map_err(|e| ServerError::Storage(format!("metadata store: {e}")))?,
    );

    // Event store: columnar when configured, relational fallback
    // otherwise. Exactly one backend per process.
    let events: Arc<dyn EventStore> = match config.storage.columnar_url.as_deref() {
        Some(url) => {
            info!("event store: clickhouse");
            Arc::new(
                ClickHouseEventStore::connect(url, config.storage.event_ttl_days)
                    .await
                    .map_err(|e| ServerError::Storage(format!("columnar store: {e}")))?,
            )
        }
        None => {
            info!("event store: postgres fallback");
            Arc::new(
                PostgresEventStore::connect(postgres_url, config.storage.pg_pool_size)
                    .await
                    .map_err(|e| ServerError::Storage(format!("event store: {e}")))?,
            )
        }
    };

    let cache: Arc<dyn CacheStore> = match config.storage.cache_url.as_deref() {
        Some(url) => Arc::new(
            RedisCache::connect(url)
                .await
                .map_err(|e| ServerError::Storage(format!("cache: {e}")))?,
        ),
        None => {
            warn!("no cache_url configured, using in-process cache");
            Arc::new(MemoryCache::new())
        }
    };

    // Metrics fan-out.
    let hub = Arc::new(SubscriptionHub::new(HubConfig {
        queue_capacity: config.metrics.subscriber_queue,
        drop_threshold: config.metrics.drop_threshold,
    }));
    let metrics = MetricsAggregator::new(AggregatorConfig {
        snapshot_interval: Duration::from_millis(config.metrics.snapshot_interval_ms.max(100)),
        ..Default::default()
    })
    .spawn(hub.clone(), shutdown.clone());

    // Ingestion: bounded queue + background writers.
    let (event_queue, queue_receiver) = queue::bounded(config.ingest.max_queue_depth);
    let writer = BatchWriter::new(
        BatcherConfig {
            batch_size: config.ingest.batch_size,
            flush_interval: Duration::from_millis(config.ingest.flush_interval_ms.max(1)),
            workers: config.ingest.writer_workers,
            ..Default::default()
        },
        events.clone(),
        cache.clone(),
    );
    writer.spawn(queue_receiver, shutdown.clone());

    let pipeline = Arc::new(IngestPipeline::new(
        PipelineConfig::default(),
        event_queue,
        metadata.clone(),
        Some(metrics.clone()),
    ));

    // Judge LLM: real client behind a circuit breaker, or the
    // deterministic stub when no key is configured (local development).
    let llm: Arc<dyn LlmClient> = match config.llm.api_key.clone() {
        Some(api_key) => Arc::new(CircuitBreaker::new(
            OpenAiClient::new(
                api_key,
                config.llm.base_url.clone(),
                config.llm.judge_model.clone(),
            ),
            CircuitBreakerConfig::default(),
        )),
        None => {
            warn!("no LLM API key configured, judge is stubbed");
            Arc::new(MockLlm::new())
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(
        metadata.clone(),
        events.clone(),
        llm,
        Some(metrics.clone()),
        OrchestratorConfig {
            max_concurrent: config.evals.max_concurrent_evaluations,
            trigger_threshold: config.evals.trigger_threshold,
            scan_interval: Duration::from_secs(config.evals.scan_interval_s.max(1)),
            phase_timeout: Duration::from_secs(config.evals.phase_timeout_s.max(1)),
            lookback: Duration::from_secs(config.evals.lookback_hours as u64 * 3600),
            retry_cooldown: Duration::from_secs(config.evals.retry_cooldown_hours as u64 * 3600),
            judge_model: config.llm.judge_model.clone(),
            executor: evalforge_evals::ExecutorConfig {
                parallelism: config.evals.per_eval_parallelism,
                ..Default::default()
            },
            ..Default::default()
        },
    ));
    orchestrator.clone().spawn(shutdown.clone());

    AlertEvaluator::new(
        metadata.clone(),
        metrics.clone(),
        Arc::new(LogSink),
        Duration::from_secs(config.metrics.alert_interval_s.max(1)),
    )
    .spawn(shutdown.clone());

    spawn_retention_sweep(
        events.clone(),
        config.storage.event_ttl_days,
        shutdown.clone(),
    );

    let jwt_secret = config
        .auth
        .jwt_secret
        .as_deref()
        .ok_or_else(|| ServerError::Config("jwt_secret is required".into()))?;
    let auth = Arc::new(AuthService::new(
        jwt_secret,
        config.auth.session_ttl_days,
        metadata.clone(),
    ));
    let rate_limiter = Arc::new(TieredRateLimiter::new(
        cache.clone(),
        config.auth.rate_limit_tiers.as_ref(),
    ));

    let state = AppState {
        config,
        metadata,
        events,
        cache,
        pipeline,
        metrics,
        hub,
        orchestrator,
        auth,
        rate_limiter,
    };
    Ok((state, writer))
}

/// Periodic TTL enforcement. A no-op round trip on the columnar backend,
/// a real delete on the relational fallback.
fn spawn_retention_sweep(
    events: Arc<dyn EventStore>,
    ttl_days: u32,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match events.delete_expired(ttl_days).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "expired events removed"),
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/auth/register", post(auth_routes::register))
        .route("/api/v1/auth/login", post(auth_routes::login))
        .route("/ingest", post(ingest::ingest_events))
        .route("/api/v1/ingest", post(ingest::ingest_events))
        .route(
            "/api/v1/projects",
            post(projects::create_project).get(projects::list_projects),
        )
        .route(
            "/api/v1/projects/:project_id",
            get(projects::get_project).delete(projects::delete_project),
        )
        .route(
            "/api/v1/projects/:project_id/keys",
            post(projects::create_api_key),
        )
        .route(
            "/api/v1/projects/:project_id/keys/:key_id",
            delete(projects::revoke_api_key),
        )
        .route(
            "/api/v1/projects/:project_id/events",
            get(events::list_events),
        )
        .route(
            "/api/v1/projects/:project_id/traces",
            get(events::list_traces),
        )
        .route(
            "/api/v1/projects/:project_id/traces/:trace_id",
            get(events::get_trace),
        )
        .route(
            "/api/v1/projects/:project_id/analytics/summary",
            get(analytics::summary),
        )
        .route(
            "/api/v1/projects/:project_id/analytics/costs",
            get(analytics::costs),
        )
        .route(
            "/api/v1/projects/:project_id/analytics/latency",
            get(analytics::latency),
        )
        .route(
            "/api/v1/projects/:project_id/analytics/errors",
            get(analytics::errors),
        )
        .route(
            "/api/v1/projects/:project_id/evaluations",
            post(evaluations::create_evaluation).get(evaluations::list_evaluations),
        )
        .route(
            "/api/v1/evaluations/:evaluation_id",
            get(evaluations::get_evaluation),
        )
        .route(
            "/api/v1/evaluations/:evaluation_id/run",
            post(evaluations::run_evaluation),
        )
        .route(
            "/api/v1/evaluations/:evaluation_id/cancel",
            post(evaluations::cancel_evaluation),
        )
        .route(
            "/api/v1/evaluations/:evaluation_id/metrics",
            get(evaluations::get_metrics),
        )
        .route(
            "/api/v1/evaluations/:evaluation_id/analysis",
            get(evaluations::get_analysis),
        )
        .route(
            "/api/v1/evaluations/:evaluation_id/cases",
            get(evaluations::list_test_cases),
        )
        .route(
            "/api/v1/evaluations/:evaluation_id/suggestions",
            get(suggestions::list_evaluation_suggestions),
        )
        .route(
            "/api/v1/projects/:project_id/suggestions",
            get(suggestions::list_suggestions),
        )
        .route(
            "/api/v1/projects/:project_id/suggestions/:suggestion_id/:action",
            post(suggestions::act_on_suggestion),
        )
        .route(
            "/api/v1/projects/:project_id/alerts",
            put(alerts::upsert_threshold).get(alerts::list_thresholds),
        )
        .route(
            "/api/v1/projects/:project_id/alerts/:threshold_id",
            delete(alerts::delete_threshold),
        )
        .route(
            "/api/v1/projects/:project_id/notifications",
            post(alerts::create_notification_config).get(alerts::list_notification_configs),
        )
        .route(
            "/api/v1/projects/:project_id/notifications/:config_id",
            delete(alerts::delete_notification_config),
        )
        .route("/api/v1/export", get(export::export))
        .route("/stream/metrics", get(stream::stream_metrics))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http());

    if state.config.server.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}
