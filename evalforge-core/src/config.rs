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

//! Runtime configuration
//!
//! Priority: TOML file < environment variables. Every tunable has a
//! documented default; `validate()` is the gate between "config error"
//! (exit code 1) and attempting storage init (exit code 2 on failure).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalForgeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub evals: EvalSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub llm: LlmSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// HTTP listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Metadata store (required).
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Columnar event store; when unset the relational fallback holds the
    /// events table instead. Never both.
    #[serde(default)]
    pub columnar_url: Option<String>,
    /// Cache/KV tier; when unset an in-process cache substitutes.
    #[serde(default)]
    pub cache_url: Option<String>,
    #[serde(default = "default_event_ttl_days")]
    pub event_ttl_days: u32,
    #[serde(default = "default_pg_pool_size")]
    pub pg_pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_writer_workers")]
    pub writer_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: u64,
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: u64,
    #[serde(default = "default_alert_interval_s")]
    pub alert_interval_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSection {
    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: u64,
    #[serde(default = "default_scan_interval_s")]
    pub scan_interval_s: u64,
    #[serde(default = "default_phase_timeout_s")]
    pub phase_timeout_s: u64,
    #[serde(default = "default_per_eval_parallelism")]
    pub per_eval_parallelism: usize,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    #[serde(default = "default_retry_cooldown_hours")]
    pub retry_cooldown_hours: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// HMAC secret for session tokens. Required.
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: u32,
    /// Tier overrides as JSON, e.g. `{"sdk_ingest":{"rate":20000,...}}`.
    #[serde(default)]
    pub rate_limit_tiers: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_judge_model")]
    pub judge_model: String,
}

fn default_port() -> u16 {
    8080
}
fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_enable_cors() -> bool {
    true
}
fn default_event_ttl_days() -> u32 {
    90
}
fn default_pg_pool_size() -> u32 {
    100
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    5000
}
fn default_max_queue_depth() -> usize {
    1_048_576
}
fn default_writer_workers() -> usize {
    2
}
fn default_snapshot_interval_ms() -> u64 {
    5000
}
fn default_subscriber_queue() -> usize {
    64
}
fn default_drop_threshold() -> u64 {
    128
}
fn default_idle_timeout_s() -> u64 {
    60
}
fn default_alert_interval_s() -> u64 {
    60
}
fn default_max_concurrent_evaluations() -> usize {
    4
}
fn default_trigger_threshold() -> u64 {
    5
}
fn default_scan_interval_s() -> u64 {
    60
}
fn default_phase_timeout_s() -> u64 {
    300
}
fn default_per_eval_parallelism() -> usize {
    8
}
fn default_lookback_hours() -> u32 {
    24
}
fn default_retry_cooldown_hours() -> u32 {
    24
}
fn default_session_ttl_days() -> u32 {
    7
}
fn default_judge_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
            enable_cors: default_enable_cors(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            postgres_url: None,
            columnar_url: None,
            cache_url: None,
            event_ttl_days: default_event_ttl_days(),
            pg_pool_size: default_pg_pool_size(),
        }
    }
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_queue_depth: default_max_queue_depth(),
            writer_workers: default_writer_workers(),
        }
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: default_snapshot_interval_ms(),
            subscriber_queue: default_subscriber_queue(),
            drop_threshold: default_drop_threshold(),
            idle_timeout_s: default_idle_timeout_s(),
            alert_interval_s: default_alert_interval_s(),
        }
    }
}

impl Default for EvalSection {
    fn default() -> Self {
        Self {
            max_concurrent_evaluations: default_max_concurrent_evaluations(),
            trigger_threshold: default_trigger_threshold(),
            scan_interval_s: default_scan_interval_s(),
            phase_timeout_s: default_phase_timeout_s(),
            per_eval_parallelism: default_per_eval_parallelism(),
            lookback_hours: default_lookback_hours(),
            retry_cooldown_hours: default_retry_cooldown_hours(),
        }
    }
}

impl Default for EvalForgeConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            storage: StorageSection::default(),
            ingest: IngestSection::default(),
            metrics: MetricsSection::default(),
            evals: EvalSection::default(),
            auth: AuthSection::default(),
            llm: LlmSection::default(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Some(raw) = env_var(name) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(var = name, value = %raw, "unparseable env override ignored"),
        }
    }
}

impl EvalForgeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Validation(format!("cannot read config file: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::Validation(format!("invalid config: {e}")))
    }

    /// Apply `EVALFORGE_*` environment overrides on top of `self`.
    pub fn merge_env(mut self) -> Self {
        env_parse("EVALFORGE_PORT", &mut self.server.port);
        if let Some(v) = env_var("EVALFORGE_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        env_parse("EVALFORGE_ENABLE_CORS", &mut self.server.enable_cors);

        if let Some(v) = env_var("EVALFORGE_POSTGRES_URL") {
            self.storage.postgres_url = Some(v);
        }
        if let Some(v) = env_var("EVALFORGE_COLUMNAR_URL") {
            self.storage.columnar_url = Some(v);
        }
        if let Some(v) = env_var("EVALFORGE_CACHE_URL") {
            self.storage.cache_url = Some(v);
        }
        env_parse("EVALFORGE_EVENT_TTL_DAYS", &mut self.storage.event_ttl_days);
        env_parse("EVALFORGE_PG_POOL_SIZE", &mut self.storage.pg_pool_size);

        env_parse("EVALFORGE_BATCH_SIZE", &mut self.ingest.batch_size);
        env_parse(
            "EVALFORGE_FLUSH_INTERVAL_MS",
            &mut self.ingest.flush_interval_ms,
        );
        env_parse("EVALFORGE_MAX_QUEUE_DEPTH", &mut self.ingest.max_queue_depth);
        env_parse("EVALFORGE_WRITER_WORKERS", &mut self.ingest.writer_workers);

        env_parse(
            "EVALFORGE_SNAPSHOT_INTERVAL_MS",
            &mut self.metrics.snapshot_interval_ms,
        );
        env_parse(
            "EVALFORGE_DROP_THRESHOLD",
            &mut self.metrics.drop_threshold,
        );
        env_parse("EVALFORGE_IDLE_TIMEOUT_S", &mut self.metrics.idle_timeout_s);
        env_parse(
            "EVALFORGE_ALERT_INTERVAL_S",
            &mut self.metrics.alert_interval_s,
        );

        env_parse(
            "EVALFORGE_MAX_CONCURRENT_EVALUATIONS",
            &mut self.evals.max_concurrent_evaluations,
        );
        env_parse(
            "EVALFORGE_EVAL_TRIGGER_THRESHOLD",
            &mut self.evals.trigger_threshold,
        );
        env_parse(
            "EVALFORGE_EVAL_SCAN_INTERVAL_S",
            &mut self.evals.scan_interval_s,
        );
        env_parse(
            "EVALFORGE_EVAL_PHASE_TIMEOUT_S",
            &mut self.evals.phase_timeout_s,
        );
        env_parse(
            "EVALFORGE_PER_EVAL_PARALLELISM",
            &mut self.evals.per_eval_parallelism,
        );

        if let Some(v) = env_var("EVALFORGE_JWT_SECRET") {
            self.auth.jwt_secret = Some(v);
        }
        if let Some(raw) = env_var("EVALFORGE_RATE_LIMIT_TIERS") {
            match serde_json::from_str(&raw) {
                Ok(v) => self.auth.rate_limit_tiers = Some(v),
                Err(e) => {
                    tracing::warn!(error = %e, "EVALFORGE_RATE_LIMIT_TIERS is not valid JSON, ignored")
                }
            }
        }

        if let Some(v) = env_var("EVALFORGE_LLM_API_KEY").or_else(|| env_var("OPENAI_API_KEY")) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = env_var("EVALFORGE_LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = env_var("EVALFORGE_JUDGE_MODEL") {
            self.llm.judge_model = v;
        }

        self
    }

    /// Load with priority: defaults < file < environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let base = match config_file {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                tracing::warn!(?path, "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        Ok(base.merge_env())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.postgres_url.is_none() {
            return Err(Error::Validation(
                "EVALFORGE_POSTGRES_URL is required".into(),
            ));
        }
        if self.auth.jwt_secret.as_deref().map_or(true, |s| s.len() < 16) {
            return Err(Error::Validation(
                "EVALFORGE_JWT_SECRET is required (min 16 bytes)".into(),
            ));
        }
        if self.ingest.batch_size == 0 || self.ingest.max_queue_depth == 0 {
            return Err(Error::Validation(
                "batch_size and max_queue_depth must be positive".into(),
            ));
        }
        if self.evals.max_concurrent_evaluations == 0 || self.evals.per_eval_parallelism == 0 {
            return Err(Error::Validation(
                "evaluation concurrency limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let c = EvalForgeConfig::default();
        assert_eq!(c.server.port, 8080);
        assert_eq!(c.ingest.batch_size, 100);
        assert_eq!(c.ingest.flush_interval_ms, 5000);
        assert_eq!(c.ingest.max_queue_depth, 1_048_576);
        assert_eq!(c.metrics.snapshot_interval_ms, 5000);
        assert_eq!(c.evals.max_concurrent_evaluations, 4);
        assert_eq!(c.evals.trigger_threshold, 5);
        assert_eq!(c.evals.scan_interval_s, 60);
        assert_eq!(c.evals.phase_timeout_s, 300);
        assert_eq!(c.evals.per_eval_parallelism, 8);
        assert_eq!(c.storage.event_ttl_days, 90);
    }

    #[test]
    fn validate_requires_postgres_and_secret() {
        let mut c = EvalForgeConfig::default();
        assert!(c.validate().is_err());

        c.storage.postgres_url = Some("postgres://localhost/evalforge".into());
        assert!(c.validate().is_err());

        c.auth.jwt_secret = Some("short".into());
        assert!(c.validate().is_err());

        c.auth.jwt_secret = Some("0123456789abcdef0123".into());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn toml_round_trip() {
        let toml_src = r#"
            [server]
            port = 9090

            [storage]
            postgres_url = "postgres://localhost/ef"

            [ingest]
            batch_size = 250
        "#;
        let c: EvalForgeConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(c.server.port, 9090);
        assert_eq!(c.ingest.batch_size, 250);
        // Untouched sections keep their defaults.
        assert_eq!(c.ingest.flush_interval_ms, 5000);
        assert_eq!(c.evals.trigger_threshold, 5);
    }
}
