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

//! Append-only event store
//!
//! One wide `events` table, write-once per `(project_id, event_id)`.
//! ClickHouse is the preferred backend: monthly + project-hash partitions,
//! ReplacingMergeTree so an identical retry collapses into one row, and
//! minute/hour rollups kept far past the raw-event TTL. The PostgreSQL
//! fallback serves the same query surface from a relational table with
//! `ON CONFLICT DO NOTHING` dedup. The backend is chosen once at boot;
//! no query ever spans both.

use crate::error::{from_clickhouse, from_sqlx};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use evalforge_core::{Error, EventStatus, Result, TraceEvent};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, QueryBuilder, Row as SqlxRow};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_PAGE_SIZE: u64 = 100;
const MAX_PAGE_SIZE: u64 = 1000;

/// Half-open time range; `None` bounds are unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t < e)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub range: TimeRange,
    pub operation_type: Option<String>,
    pub status: Option<EventStatus>,
    pub model: Option<String>,
    /// Opaque cursor from a previous page.
    pub cursor: Option<String>,
    pub limit: Option<u64>,
}

impl EventFilter {
    fn page_size(&self) -> u64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE)
    }

    fn matches(&self, e: &TraceEvent) -> bool {
        self.range.contains(e.start_time)
            && self.operation_type.as_deref().map_or(true, |o| e.operation_type == o)
            && self.status.map_or(true, |s| e.status == s)
            && self.model.as_deref().map_or(true, |m| e.model == m)
    }
}

/// Cursor is `base64("{start_time_us}:{event_id}")` of the last row of the
/// previous page; listing runs newest-first.
fn encode_cursor(start_us: i64, event_id: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("{start_us}:{event_id}"))
}

fn decode_cursor(cursor: &str) -> Result<(i64, String)> {
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| Error::Validation("malformed cursor".into()))?;
    let raw = String::from_utf8(raw).map_err(|_| Error::Validation("malformed cursor".into()))?;
    let (us, id) = raw
        .split_once(':')
        .ok_or_else(|| Error::Validation("malformed cursor".into()))?;
    let us: i64 = us
        .parse()
        .map_err(|_| Error::Validation("malformed cursor".into()))?;
    Ok((us, id.to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<TraceEvent>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub span_count: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub root_operation: String,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub total_events: u64,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCost {
    pub model: String,
    pub provider: String,
    pub event_count: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSlice {
    pub operation_type: String,
    pub status: String,
    pub count: u64,
    pub sample_message: String,
}

/// Raw material for the fingerprint scanner.
#[derive(Debug, Clone)]
pub struct PromptSample {
    pub operation_type: String,
    pub model: String,
    pub input: serde_json::Value,
}

/// The single polymorphism seam of the storage layer: columnar preferred,
/// relational fallback, identical query surface.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Bulk insert, idempotent per `(project_id, event_id)`. Returns the
    /// number of rows submitted (duplicates silently collapse).
    async fn insert_batch(&self, events: &[TraceEvent]) -> Result<u64>;

    async fn query_events(&self, project_id: i64, filter: &EventFilter) -> Result<EventPage>;

    async fn list_traces(
        &self,
        project_id: i64,
        range: TimeRange,
        limit: u64,
    ) -> Result<Vec<TraceSummary>>;

    /// All spans of one trace, ordered by start time. The span tree is
    /// rebuilt by the caller from `parent_span_id`.
    async fn trace_events(&self, project_id: i64, trace_id: &str) -> Result<Vec<TraceEvent>>;

    async fn analytics_summary(&self, project_id: i64, range: TimeRange)
        -> Result<AnalyticsSummary>;

    async fn cost_by_model(&self, project_id: i64, range: TimeRange) -> Result<Vec<ModelCost>>;

    async fn latency_percentiles(&self, project_id: i64, range: TimeRange) -> Result<LatencyStats>;

    async fn error_breakdown(&self, project_id: i64, range: TimeRange) -> Result<Vec<ErrorSlice>>;

    async fn prompt_samples(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PromptSample>>;

    async fn count_events(&self, project_id: i64) -> Result<u64>;

    async fn delete_project_events(&self, project_id: i64) -> Result<()>;

    /// Drop events older than the retention window. The columnar backend
    /// owns retention through table TTL and treats this as a no-op.
    async fn delete_expired(&self, ttl_days: u32) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ClickHouse backend
// ---------------------------------------------------------------------------

/// Wire row; field names match column names, DateTime64(6) travels as
/// microsecond ticks.
#[derive(Debug, clickhouse::Row, Serialize, Deserialize)]
struct ChEventRow {
    project_id: i64,
    event_id: String,
    trace_id: String,
    span_id: String,
    parent_span_id: String,
    operation_type: String,
    status: String,
    start_time: i64,
    end_time: i64,
    duration_ms: i64,
    input: String,
    output: String,
    metadata: String,
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
    cost: f64,
    provider: String,
    model: String,
    error_message: String,
}

impl ChEventRow {
    fn from_event(e: &TraceEvent) -> Self {
        Self {
            project_id: e.project_id,
            event_id: e.event_id.clone(),
            trace_id: e.trace_id.clone(),
            span_id: e.span_id.clone(),
            parent_span_id: e.parent_span_id.clone().unwrap_or_default(),
            operation_type: e.operation_type.clone(),
            status: e.status.as_str().to_string(),
            start_time: e.start_time.timestamp_micros(),
            end_time: e.end_time.timestamp_micros(),
            duration_ms: e.duration_ms(),
            input: e.input.to_string(),
            output: e.output.to_string(),
            metadata: e.metadata.to_string(),
            prompt_tokens: e.prompt_tokens,
            completion_tokens: e.completion_tokens,
            total_tokens: e.total_tokens,
            cost: e.cost,
            provider: e.provider.clone(),
            model: e.model.clone(),
            error_message: e.error_message.clone().unwrap_or_default(),
        }
    }

    fn into_event(self) -> Result<TraceEvent> {
        let status = EventStatus::parse(&self.status)
            .ok_or_else(|| Error::internal(format!("unknown event status '{}'", self.status)))?;
        Ok(TraceEvent {
            project_id: self.project_id,
            event_id: self.event_id,
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: (!self.parent_span_id.is_empty()).then_some(self.parent_span_id),
            operation_type: self.operation_type,
            status,
            start_time: micros_to_utc(self.start_time)?,
            end_time: micros_to_utc(self.end_time)?,
            input: parse_payload(&self.input),
            output: parse_payload(&self.output),
            metadata: parse_payload(&self.metadata),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            cost: self.cost,
            provider: self.provider,
            model: self.model,
            error_message: (!self.error_message.is_empty()).then_some(self.error_message),
        })
    }
}

fn micros_to_utc(us: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| Error::internal(format!("timestamp out of range: {us}")))
}

fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

pub struct ClickHouseEventStore {
    client: clickhouse::Client,
}

impl ClickHouseEventStore {
    pub async fn connect(url: &str, ttl_days: u32) -> Result<Self> {
        let client = clickhouse::Client::default().with_url(url);
        let store = Self { client };
        store.init_schema(ttl_days).await?;
        Ok(store)
    }

    async fn init_schema(&self, ttl_days: u32) -> Result<()> {
        let events_ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                project_id Int64,
                event_id String,
                trace_id String,
                span_id String,
                parent_span_id String,
                operation_type LowCardinality(String),
                status LowCardinality(String),
                start_time DateTime64(6, 'UTC'),
                end_time DateTime64(6, 'UTC'),
                duration_ms Int64,
                input String,
                output String,
                metadata String,
                prompt_tokens UInt32,
                completion_tokens UInt32,
                total_tokens UInt32,
                cost Float64,
                provider LowCardinality(String),
                model LowCardinality(String),
                error_message String
            )
            ENGINE = ReplacingMergeTree
            PARTITION BY (toYYYYMM(start_time), intHash32(toUInt64(project_id)) % 16)
            ORDER BY (project_id, start_time, trace_id, span_id, event_id)
            TTL toDateTime(start_time) + toIntervalDay({ttl_days})
            "#
        );

        let rollup_1m_ddl = r#"
            CREATE TABLE IF NOT EXISTS events_rollup_1m (
                project_id Int64,
                bucket DateTime('UTC'),
                operation_type LowCardinality(String),
                status LowCardinality(String),
                events UInt64,
                errors UInt64,
                total_tokens UInt64,
                total_cost Float64,
                duration_ms_sum Int64
            )
            ENGINE = SummingMergeTree
            PARTITION BY toYYYYMM(bucket)
            ORDER BY (project_id, bucket, operation_type, status)
            TTL bucket + toIntervalDay(365)
        "#;

        let rollup_1m_mv = r#"
            CREATE MATERIALIZED VIEW IF NOT EXISTS events_rollup_1m_mv
            TO events_rollup_1m AS
            SELECT
                project_id,
                toStartOfMinute(start_time) AS bucket,
                operation_type,
                status,
                count() AS events,
                countIf(status != 'success') AS errors,
                sum(total_tokens) AS total_tokens,
                sum(cost) AS total_cost,
                sum(duration_ms) AS duration_ms_sum
            FROM events
            GROUP BY project_id, bucket, operation_type, status
        "#;

        let rollup_1h_ddl = r#"
            CREATE TABLE IF NOT EXISTS events_rollup_1h (
                project_id Int64,
                bucket DateTime('UTC'),
                operation_type LowCardinality(String),
                status LowCardinality(String),
                events UInt64,
                errors UInt64,
                total_tokens UInt64,
                total_cost Float64,
                duration_ms_sum Int64
            )
            ENGINE = SummingMergeTree
            PARTITION BY toYYYYMM(bucket)
            ORDER BY (project_id, bucket, operation_type, status)
            TTL bucket + toIntervalDay(730)
        "#;

        let rollup_1h_mv = r#"
            CREATE MATERIALIZED VIEW IF NOT EXISTS events_rollup_1h_mv
            TO events_rollup_1h AS
            SELECT
                project_id,
                toStartOfHour(start_time) AS bucket,
                operation_type,
                status,
                count() AS events,
                countIf(status != 'success') AS errors,
                sum(total_tokens) AS total_tokens,
                sum(cost) AS total_cost,
                sum(duration_ms) AS duration_ms_sum
            FROM events
            GROUP BY project_id, bucket, operation_type, status
        "#;

        for ddl in [
            events_ddl.as_str(),
            rollup_1m_ddl,
            rollup_1m_mv,
            rollup_1h_ddl,
            rollup_1h_mv,
        ] {
            self.client
                .query(ddl)
                .execute()
                .await
                .map_err(from_clickhouse)?;
        }
        Ok(())
    }

    fn range_clause(range: &TimeRange) -> (String, Vec<i64>) {
        let mut clause = String::new();
        let mut binds = Vec::new();
        if let Some(start) = range.start {
            clause.push_str(" AND toUnixTimestamp64Micro(start_time) >= ?");
            binds.push(start.timestamp_micros());
        }
        if let Some(end) = range.end {
            clause.push_str(" AND toUnixTimestamp64Micro(start_time) < ?");
            binds.push(end.timestamp_micros());
        }
        (clause, binds)
    }
}

#[async_trait]
impl EventStore for ClickHouseEventStore {
    async fn insert_batch(&self, events: &[TraceEvent]) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut insert = self.client.insert("events").map_err(from_clickhouse)?;
        for event in events {
            insert
                .write(&ChEventRow::from_event(event))
                .await
                .map_err(from_clickhouse)?;
        }
        insert.end().await.map_err(from_clickhouse)?;
        Ok(events.len() as u64)
    }

    async fn query_events(&self, project_id: i64, filter: &EventFilter) -> Result<EventPage> {
        let (range_clause, range_binds) = Self::range_clause(&filter.range);
        let mut sql = format!(
            "SELECT ?fields FROM events FINAL WHERE project_id = ?{range_clause}"
        );
        if filter.operation_type.is_some() {
            sql.push_str(" AND operation_type = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.model.is_some() {
            sql.push_str(" AND model = ?");
        }
        let cursor = filter.cursor.as_deref().map(decode_cursor).transpose()?;
        if cursor.is_some() {
            sql.push_str(" AND (toUnixTimestamp64Micro(start_time), event_id) < (?, ?)");
        }
        sql.push_str(" ORDER BY start_time DESC, event_id DESC LIMIT ?");

        let mut query = self.client.query(&sql).bind(project_id);
        for b in range_binds {
            query = query.bind(b);
        }
        if let Some(op) = &filter.operation_type {
            query = query.bind(op.as_str());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(model) = &filter.model {
            query = query.bind(model.as_str());
        }
        if let Some((us, id)) = &cursor {
            query = query.bind(*us).bind(id.as_str());
        }
        let page_size = filter.page_size();
        query = query.bind(page_size);

        let rows: Vec<ChEventRow> = query.fetch_all().await.map_err(from_clickhouse)?;
        let next_cursor = (rows.len() as u64 == page_size)
            .then(|| rows.last().map(|r| encode_cursor(r.start_time, &r.event_id)))
            .flatten();
        let events = rows
            .into_iter()
            .map(ChEventRow::into_event)
            .collect::<Result<Vec<_>>>()?;
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    async fn list_traces(
        &self,
        project_id: i64,
        range: TimeRange,
        limit: u64,
    ) -> Result<Vec<TraceSummary>> {
        #[derive(clickhouse::Row, Deserialize)]
        struct TraceRow {
            trace_id: String,
            span_count: u64,
            start_us: i64,
            end_us: i64,
            root_operation: String,
            total_tokens: u64,
            total_cost: f64,
            error_count: u64,
        }

        let (range_clause, range_binds) = Self::range_clause(&range);
        let sql = format!(
            r#"
            SELECT
                trace_id,
                count() AS span_count,
                min(toUnixTimestamp64Micro(start_time)) AS start_us,
                max(toUnixTimestamp64Micro(end_time)) AS end_us,
                argMin(operation_type, start_time) AS root_operation,
                sum(total_tokens) AS total_tokens,
                sum(cost) AS total_cost,
                countIf(status != 'success') AS error_count
            FROM events FINAL
            WHERE project_id = ?{range_clause}
            GROUP BY trace_id
            ORDER BY start_us DESC
            LIMIT ?
            "#
        );
        let mut query = self.client.query(&sql).bind(project_id);
        for b in range_binds {
            query = query.bind(b);
        }
        query = query.bind(limit.min(MAX_PAGE_SIZE));

        let rows: Vec<TraceRow> = query.fetch_all().await.map_err(from_clickhouse)?;
        rows.into_iter()
            .map(|r| {
                Ok(TraceSummary {
                    trace_id: r.trace_id,
                    span_count: r.span_count,
                    start_time: micros_to_utc(r.start_us)?,
                    end_time: micros_to_utc(r.end_us)?,
                    root_operation: r.root_operation,
                    total_tokens: r.total_tokens,
                    total_cost: r.total_cost,
                    error_count: r.error_count,
                })
            })
            .collect()
    }

    async fn trace_events(&self, project_id: i64, trace_id: &str) -> Result<Vec<TraceEvent>> {
        let rows: Vec<ChEventRow> = self
            .client
            .query(
                "SELECT ?fields FROM events FINAL \
                 WHERE project_id = ? AND trace_id = ? \
                 ORDER BY start_time ASC",
            )
            .bind(project_id)
            .bind(trace_id)
            .fetch_all()
            .await
            .map_err(from_clickhouse)?;
        rows.into_iter().map(ChEventRow::into_event).collect()
    }

    async fn analytics_summary(
        &self,
        project_id: i64,
        range: TimeRange,
    ) -> Result<AnalyticsSummary> {
        #[derive(clickhouse::Row, Deserialize)]
        struct SummaryRow {
            total_events: u64,
            total_cost: f64,
            total_tokens: u64,
            error_events: u64,
            avg_latency_ms: f64,
        }

        let (range_clause, range_binds) = Self::range_clause(&range);
        let sql = format!(
            r#"
            SELECT
                count() AS total_events,
                sum(cost) AS total_cost,
                sum(total_tokens) AS total_tokens,
                countIf(status != 'success') AS error_events,
                avg(duration_ms) AS avg_latency_ms
            FROM events FINAL
            WHERE project_id = ?{range_clause}
            "#
        );
        let mut query = self.client.query(&sql).bind(project_id);
        for b in range_binds {
            query = query.bind(b);
        }
        let row: SummaryRow = query.fetch_one().await.map_err(from_clickhouse)?;
        Ok(AnalyticsSummary {
            total_events: row.total_events,
            total_cost: row.total_cost,
            total_tokens: row.total_tokens,
            error_rate: if row.total_events > 0 {
                row.error_events as f64 / row.total_events as f64
            } else {
                0.0
            },
            avg_latency_ms: if row.avg_latency_ms.is_finite() {
                row.avg_latency_ms
            } else {
                0.0
            },
        })
    }

    async fn cost_by_model(&self, project_id: i64, range: TimeRange) -> Result<Vec<ModelCost>> {
        #[derive(clickhouse::Row, Deserialize)]
        struct CostRow {
            model: String,
            provider: String,
            event_count: u64,
            total_tokens: u64,
            total_cost: f64,
        }

        let (range_clause, range_binds) = Self::range_clause(&range);
        let sql = format!(
            r#"
            SELECT
                model,
                any(provider) AS provider,
                count() AS event_count,
                sum(total_tokens) AS total_tokens,
                sum(cost) AS total_cost
            FROM events FINAL
            WHERE project_id = ?{range_clause}
            GROUP BY model
            ORDER BY total_cost DESC
            "#
        );
        let mut query = self.client.query(&sql).bind(project_id);
        for b in range_binds {
            query = query.bind(b);
        }
        let rows: Vec<CostRow> = query.fetch_all().await.map_err(from_clickhouse)?;
        Ok(rows
            .into_iter()
            .map(|r| ModelCost {
                model: r.model,
                provider: r.provider,
                event_count: r.event_count,
                total_tokens: r.total_tokens,
                total_cost: r.total_cost,
            })
            .collect())
    }

    async fn latency_percentiles(
        &self,
        project_id: i64,
        range: TimeRange,
    ) -> Result<LatencyStats> {
        #[derive(clickhouse::Row, Deserialize)]
        struct LatencyRow {
            avg_ms: f64,
            p50_ms: f64,
            p90_ms: f64,
            p95_ms: f64,
            p99_ms: f64,
        }

        let (range_clause, range_binds) = Self::range_clause(&range);
        let sql = format!(
            r#"
            SELECT
                avg(duration_ms) AS avg_ms,
                quantile(0.5)(duration_ms) AS p50_ms,
                quantile(0.9)(duration_ms) AS p90_ms,
                quantile(0.95)(duration_ms) AS p95_ms,
                quantile(0.99)(duration_ms) AS p99_ms
            FROM events FINAL
            WHERE project_id = ?{range_clause}
            "#
        );
        let mut query = self.client.query(&sql).bind(project_id);
        for b in range_binds {
            query = query.bind(b);
        }
        let row: LatencyRow = query.fetch_one().await.map_err(from_clickhouse)?;
        let sane = |v: f64| if v.is_finite() { v } else { 0.0 };
        Ok(LatencyStats {
            avg_ms: sane(row.avg_ms),
            p50_ms: sane(row.p50_ms),
            p90_ms: sane(row.p90_ms),
            p95_ms: sane(row.p95_ms),
            p99_ms: sane(row.p99_ms),
        })
    }

    async fn error_breakdown(&self, project_id: i64, range: TimeRange) -> Result<Vec<ErrorSlice>> {
        #[derive(clickhouse::Row, Deserialize)]
        struct ErrorRow {
            operation_type: String,
            status: String,
            count: u64,
            sample_message: String,
        }

        let (range_clause, range_binds) = Self::range_clause(&range);
        let sql = format!(
            r#"
            SELECT
                operation_type,
                status,
                count() AS count,
                any(error_message) AS sample_message
            FROM events FINAL
            WHERE project_id = ? AND status != 'success'{range_clause}
            GROUP BY operation_type, status
            ORDER BY count DESC
            "#
        );
        let mut query = self.client.query(&sql).bind(project_id);
        for b in range_binds {
            query = query.bind(b);
        }
        let rows: Vec<ErrorRow> = query.fetch_all().await.map_err(from_clickhouse)?;
        Ok(rows
            .into_iter()
            .map(|r| ErrorSlice {
                operation_type: r.operation_type,
                status: r.status,
                count: r.count,
                sample_message: r.sample_message,
            })
            .collect())
    }

    async fn prompt_samples(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PromptSample>> {
        #[derive(clickhouse::Row, Deserialize)]
        struct SampleRow {
            operation_type: String,
            model: String,
            input: String,
        }

        let rows: Vec<SampleRow> = self
            .client
            .query(
                "SELECT operation_type, model, input FROM events FINAL \
                 WHERE project_id = ? AND toUnixTimestamp64Micro(start_time) >= ? \
                 ORDER BY start_time DESC LIMIT ?",
            )
            .bind(project_id)
            .bind(since.timestamp_micros())
            .bind(limit)
            .fetch_all()
            .await
            .map_err(from_clickhouse)?;
        Ok(rows
            .into_iter()
            .map(|r| PromptSample {
                operation_type: r.operation_type,
                model: r.model,
                input: parse_payload(&r.input),
            })
            .collect())
    }

    async fn count_events(&self, project_id: i64) -> Result<u64> {
        let count: u64 = self
            .client
            .query("SELECT count() FROM events FINAL WHERE project_id = ?")
            .bind(project_id)
            .fetch_one()
            .await
            .map_err(from_clickhouse)?;
        Ok(count)
    }

    async fn delete_project_events(&self, project_id: i64) -> Result<()> {
        self.client
            .query("ALTER TABLE events DELETE WHERE project_id = ?")
            .bind(project_id)
            .execute()
            .await
            .map_err(from_clickhouse)
    }

    async fn delete_expired(&self, _ttl_days: u32) -> Result<u64> {
        // Partition-level TTL on the table already expires old events.
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        let _: u8 = self
            .client
            .query("SELECT 1")
            .fetch_one()
            .await
            .map_err(from_clickhouse)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL fallback backend
// ---------------------------------------------------------------------------

pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(url)
            .await
            .map_err(from_sqlx)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                project_id BIGINT NOT NULL,
                event_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                span_id TEXT NOT NULL,
                parent_span_id TEXT,
                operation_type TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT NOT NULL,
                input JSONB NOT NULL DEFAULT 'null',
                output JSONB NOT NULL DEFAULT 'null',
                metadata JSONB NOT NULL DEFAULT 'null',
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                cost DOUBLE PRECISION NOT NULL DEFAULT 0,
                provider TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                error_message TEXT,
                PRIMARY KEY (project_id, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS events_project_time_idx \
             ON events (project_id, start_time DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS events_project_trace_idx \
             ON events (project_id, trace_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;

        Ok(())
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<TraceEvent> {
        let status_raw: String = row.try_get("status").map_err(from_sqlx)?;
        let status = EventStatus::parse(&status_raw)
            .ok_or_else(|| Error::internal(format!("unknown event status '{status_raw}'")))?;
        Ok(TraceEvent {
            project_id: row.try_get("project_id").map_err(from_sqlx)?,
            event_id: row.try_get("event_id").map_err(from_sqlx)?,
            trace_id: row.try_get("trace_id").map_err(from_sqlx)?,
            span_id: row.try_get("span_id").map_err(from_sqlx)?,
            parent_span_id: row.try_get("parent_span_id").map_err(from_sqlx)?,
            operation_type: row.try_get("operation_type").map_err(from_sqlx)?,
            status,
            start_time: row.try_get("start_time").map_err(from_sqlx)?,
            end_time: row.try_get("end_time").map_err(from_sqlx)?,
            input: row.try_get("input").map_err(from_sqlx)?,
            output: row.try_get("output").map_err(from_sqlx)?,
            metadata: row.try_get("metadata").map_err(from_sqlx)?,
            prompt_tokens: row.try_get::<i32, _>("prompt_tokens").map_err(from_sqlx)? as u32,
            completion_tokens: row
                .try_get::<i32, _>("completion_tokens")
                .map_err(from_sqlx)? as u32,
            total_tokens: row.try_get::<i32, _>("total_tokens").map_err(from_sqlx)? as u32,
            cost: row.try_get("cost").map_err(from_sqlx)?,
            provider: row.try_get("provider").map_err(from_sqlx)?,
            model: row.try_get("model").map_err(from_sqlx)?,
            error_message: row.try_get("error_message").map_err(from_sqlx)?,
        })
    }

    fn push_filter_conditions<'a>(
        qb: &mut QueryBuilder<'a, sqlx::Postgres>,
        project_id: i64,
        filter: &'a EventFilter,
    ) {
        qb.push(" WHERE project_id = ").push_bind(project_id);
        if let Some(start) = filter.range.start {
            qb.push(" AND start_time >= ").push_bind(start);
        }
        if let Some(end) = filter.range.end {
            qb.push(" AND start_time < ").push_bind(end);
        }
        if let Some(op) = &filter.operation_type {
            qb.push(" AND operation_type = ").push_bind(op.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(model) = &filter.model {
            qb.push(" AND model = ").push_bind(model.as_str());
        }
    }

    fn push_range_conditions<'a>(
        qb: &mut QueryBuilder<'a, sqlx::Postgres>,
        project_id: i64,
        range: &TimeRange,
    ) {
        qb.push(" WHERE project_id = ").push_bind(project_id);
        if let Some(start) = range.start {
            qb.push(" AND start_time >= ").push_bind(start);
        }
        if let Some(end) = range.end {
            qb.push(" AND start_time < ").push_bind(end);
        }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn insert_batch(&self, events: &[TraceEvent]) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(
            "INSERT INTO events (project_id, event_id, trace_id, span_id, parent_span_id, \
             operation_type, status, start_time, end_time, duration_ms, input, output, \
             metadata, prompt_tokens, completion_tokens, total_tokens, cost, provider, \
             model, error_message) ",
        );
        qb.push_values(events, |mut b, e| {
            b.push_bind(e.project_id)
                .push_bind(&e.event_id)
                .push_bind(&e.trace_id)
                .push_bind(&e.span_id)
                .push_bind(&e.parent_span_id)
                .push_bind(&e.operation_type)
                .push_bind(e.status.as_str())
                .push_bind(e.start_time)
                .push_bind(e.end_time)
                .push_bind(e.duration_ms())
                .push_bind(&e.input)
                .push_bind(&e.output)
                .push_bind(&e.metadata)
                .push_bind(e.prompt_tokens as i32)
                .push_bind(e.completion_tokens as i32)
                .push_bind(e.total_tokens as i32)
                .push_bind(e.cost)
                .push_bind(&e.provider)
                .push_bind(&e.model)
                .push_bind(&e.error_message);
        });
        qb.push(" ON CONFLICT (project_id, event_id) DO NOTHING");
        qb.build().execute(&self.pool).await.map_err(from_sqlx)?;
        Ok(events.len() as u64)
    }

    async fn query_events(&self, project_id: i64, filter: &EventFilter) -> Result<EventPage> {
        let mut qb = QueryBuilder::new("SELECT * FROM events");
        Self::push_filter_conditions(&mut qb, project_id, filter);
        if let Some(cursor) = &filter.cursor {
            let (us, event_id) = decode_cursor(cursor)?;
            let before = micros_to_utc(us)?;
            qb.push(" AND (start_time, event_id) < (")
                .push_bind(before)
                .push(", ")
                .push_bind(event_id)
                .push(")");
        }
        let page_size = filter.page_size();
        qb.push(" ORDER BY start_time DESC, event_id DESC LIMIT ")
            .push_bind(page_size as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(from_sqlx)?;
        let events = rows
            .iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = (events.len() as u64 == page_size)
            .then(|| {
                events
                    .last()
                    .map(|e| encode_cursor(e.start_time.timestamp_micros(), &e.event_id))
            })
            .flatten();
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    async fn list_traces(
        &self,
        project_id: i64,
        range: TimeRange,
        limit: u64,
    ) -> Result<Vec<TraceSummary>> {
        let mut qb = QueryBuilder::new(
            "SELECT trace_id, count(*) AS span_count, min(start_time) AS started, \
             max(end_time) AS ended, \
             (array_agg(operation_type ORDER BY start_time))[1] AS root_operation, \
             sum(total_tokens)::bigint AS total_tokens, sum(cost) AS total_cost, \
             count(*) FILTER (WHERE status != 'success') AS error_count \
             FROM events",
        );
        Self::push_range_conditions(&mut qb, project_id, &range);
        qb.push(" GROUP BY trace_id ORDER BY started DESC LIMIT ")
            .push_bind(limit.min(MAX_PAGE_SIZE) as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(from_sqlx)?;
        rows.iter()
            .map(|row| {
                Ok(TraceSummary {
                    trace_id: row.try_get("trace_id").map_err(from_sqlx)?,
                    span_count: row.try_get::<i64, _>("span_count").map_err(from_sqlx)? as u64,
                    start_time: row.try_get("started").map_err(from_sqlx)?,
                    end_time: row.try_get("ended").map_err(from_sqlx)?,
                    root_operation: row.try_get("root_operation").map_err(from_sqlx)?,
                    total_tokens: row.try_get::<i64, _>("total_tokens").map_err(from_sqlx)? as u64,
                    total_cost: row.try_get("total_cost").map_err(from_sqlx)?,
                    error_count: row.try_get::<i64, _>("error_count").map_err(from_sqlx)? as u64,
                })
            })
            .collect()
    }

    async fn trace_events(&self, project_id: i64, trace_id: &str) -> Result<Vec<TraceEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE project_id = $1 AND trace_id = $2 \
             ORDER BY start_time ASC",
        )
        .bind(project_id)
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn analytics_summary(
        &self,
        project_id: i64,
        range: TimeRange,
    ) -> Result<AnalyticsSummary> {
        let mut qb = QueryBuilder::new(
            "SELECT count(*) AS total_events, coalesce(sum(cost), 0) AS total_cost, \
             coalesce(sum(total_tokens), 0)::bigint AS total_tokens, \
             count(*) FILTER (WHERE status != 'success') AS error_events, \
             coalesce(avg(duration_ms), 0) AS avg_latency_ms \
             FROM events",
        );
        Self::push_range_conditions(&mut qb, project_id, &range);
        let row = qb.build().fetch_one(&self.pool).await.map_err(from_sqlx)?;

        let total_events = row.try_get::<i64, _>("total_events").map_err(from_sqlx)? as u64;
        let error_events = row.try_get::<i64, _>("error_events").map_err(from_sqlx)? as u64;
        Ok(AnalyticsSummary {
            total_events,
            total_cost: row.try_get("total_cost").map_err(from_sqlx)?,
            total_tokens: row.try_get::<i64, _>("total_tokens").map_err(from_sqlx)? as u64,
            error_rate: if total_events > 0 {
                error_events as f64 / total_events as f64
            } else {
                0.0
            },
            avg_latency_ms: row
                .try_get::<f64, _>("avg_latency_ms")
                .unwrap_or_default(),
        })
    }

    async fn cost_by_model(&self, project_id: i64, range: TimeRange) -> Result<Vec<ModelCost>> {
        let mut qb = QueryBuilder::new(
            "SELECT model, min(provider) AS provider, count(*) AS event_count, \
             coalesce(sum(total_tokens), 0)::bigint AS total_tokens, \
             coalesce(sum(cost), 0) AS total_cost FROM events",
        );
        Self::push_range_conditions(&mut qb, project_id, &range);
        qb.push(" GROUP BY model ORDER BY total_cost DESC");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(from_sqlx)?;
        rows.iter()
            .map(|row| {
                Ok(ModelCost {
                    model: row.try_get("model").map_err(from_sqlx)?,
                    provider: row.try_get("provider").map_err(from_sqlx)?,
                    event_count: row.try_get::<i64, _>("event_count").map_err(from_sqlx)? as u64,
                    total_tokens: row.try_get::<i64, _>("total_tokens").map_err(from_sqlx)? as u64,
                    total_cost: row.try_get("total_cost").map_err(from_sqlx)?,
                })
            })
            .collect()
    }

    async fn latency_percentiles(
        &self,
        project_id: i64,
        range: TimeRange,
    ) -> Result<LatencyStats> {
        let mut qb = QueryBuilder::new(
            "SELECT coalesce(avg(duration_ms), 0) AS avg_ms, \
             coalesce(percentile_cont(0.5) WITHIN GROUP (ORDER BY duration_ms), 0) AS p50_ms, \
             coalesce(percentile_cont(0.9) WITHIN GROUP (ORDER BY duration_ms), 0) AS p90_ms, \
             coalesce(percentile_cont(0.95) WITHIN GROUP (ORDER BY duration_ms), 0) AS p95_ms, \
             coalesce(percentile_cont(0.99) WITHIN GROUP (ORDER BY duration_ms), 0) AS p99_ms \
             FROM events",
        );
        Self::push_range_conditions(&mut qb, project_id, &range);
        let row = qb.build().fetch_one(&self.pool).await.map_err(from_sqlx)?;
        Ok(LatencyStats {
            avg_ms: row.try_get("avg_ms").map_err(from_sqlx)?,
            p50_ms: row.try_get("p50_ms").map_err(from_sqlx)?,
            p90_ms: row.try_get("p90_ms").map_err(from_sqlx)?,
            p95_ms: row.try_get("p95_ms").map_err(from_sqlx)?,
            p99_ms: row.try_get("p99_ms").map_err(from_sqlx)?,
        })
    }

    async fn error_breakdown(&self, project_id: i64, range: TimeRange) -> Result<Vec<ErrorSlice>> {
        let mut qb = QueryBuilder::new(
            "SELECT operation_type, status, count(*) AS count, \
             coalesce(min(error_message), '') AS sample_message FROM events",
        );
        Self::push_range_conditions(&mut qb, project_id, &range);
        qb.push(" AND status != 'success' GROUP BY operation_type, status ORDER BY count DESC");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(from_sqlx)?;
        rows.iter()
            .map(|row| {
                Ok(ErrorSlice {
                    operation_type: row.try_get("operation_type").map_err(from_sqlx)?,
                    status: row.try_get("status").map_err(from_sqlx)?,
                    count: row.try_get::<i64, _>("count").map_err(from_sqlx)? as u64,
                    sample_message: row.try_get("sample_message").map_err(from_sqlx)?,
                })
            })
            .collect()
    }

    async fn prompt_samples(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PromptSample>> {
        let rows = sqlx::query(
            "SELECT operation_type, model, input FROM events \
             WHERE project_id = $1 AND start_time >= $2 \
             ORDER BY start_time DESC LIMIT $3",
        )
        .bind(project_id)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter()
            .map(|row| {
                Ok(PromptSample {
                    operation_type: row.try_get("operation_type").map_err(from_sqlx)?,
                    model: row.try_get("model").map_err(from_sqlx)?,
                    input: row.try_get("input").map_err(from_sqlx)?,
                })
            })
            .collect()
    }

    async fn count_events(&self, project_id: i64) -> Result<u64> {
        let row = sqlx::query("SELECT count(*) AS count FROM events WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(row.try_get::<i64, _>("count").map_err(from_sqlx)? as u64)
    }

    async fn delete_project_events(&self, project_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM events WHERE project_id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }

    async fn delete_expired(&self, ttl_days: u32) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM events WHERE start_time < now() - make_interval(days => $1)",
        )
        .bind(ttl_days as i32)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process fake for tests
// ---------------------------------------------------------------------------

/// Test double with the same observable semantics (dedup, filters,
/// aggregations). `fail_next_inserts` makes the next N `insert_batch`
/// calls return `Unavailable`, for retry-path tests.
#[derive(Default)]
pub struct MemoryEventStore {
    events: parking_lot::RwLock<Vec<TraceEvent>>,
    seen: parking_lot::Mutex<HashSet<(i64, String)>>,
    pub fail_next_inserts: AtomicUsize,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_events(&self) -> Vec<TraceEvent> {
        self.events.read().clone()
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let rank = p * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        if lo == hi {
            sorted[lo]
        } else {
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_batch(&self, events: &[TraceEvent]) -> Result<u64> {
        let pending = self.fail_next_inserts.load(Ordering::Relaxed);
        if pending > 0 {
            self.fail_next_inserts.store(pending - 1, Ordering::Relaxed);
            return Err(Error::Unavailable("simulated event-store outage".into()));
        }

        let mut seen = self.seen.lock();
        let mut store = self.events.write();
        for event in events {
            let key = (event.project_id, event.event_id.clone());
            if seen.insert(key) {
                store.push(event.clone());
            }
        }
        Ok(events.len() as u64)
    }

    async fn query_events(&self, project_id: i64, filter: &EventFilter) -> Result<EventPage> {
        let cursor = filter.cursor.as_deref().map(decode_cursor).transpose()?;
        let mut matched: Vec<TraceEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.project_id == project_id && filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            (b.start_time, &b.event_id).cmp(&(a.start_time, &a.event_id))
        });
        if let Some((us, id)) = cursor {
            let before = micros_to_utc(us)?;
            matched.retain(|e| (e.start_time, e.event_id.as_str()) < (before, id.as_str()));
        }
        let page_size = filter.page_size() as usize;
        let next_cursor = (matched.len() > page_size).then(|| {
            let last = &matched[page_size - 1];
            encode_cursor(last.start_time.timestamp_micros(), &last.event_id)
        });
        matched.truncate(page_size);
        Ok(EventPage {
            events: matched,
            next_cursor,
        })
    }

    async fn list_traces(
        &self,
        project_id: i64,
        range: TimeRange,
        limit: u64,
    ) -> Result<Vec<TraceSummary>> {
        let events = self.events.read();
        let mut traces: HashMap<String, Vec<&TraceEvent>> = HashMap::new();
        for e in events
            .iter()
            .filter(|e| e.project_id == project_id && range.contains(e.start_time))
        {
            traces.entry(e.trace_id.clone()).or_default().push(e);
        }
        let mut summaries: Vec<TraceSummary> = traces
            .into_iter()
            .map(|(trace_id, spans)| {
                let start = spans.iter().map(|e| e.start_time).min().unwrap();
                let end = spans.iter().map(|e| e.end_time).max().unwrap();
                let root = spans
                    .iter()
                    .min_by_key(|e| e.start_time)
                    .map(|e| e.operation_type.clone())
                    .unwrap_or_default();
                TraceSummary {
                    trace_id,
                    span_count: spans.len() as u64,
                    start_time: start,
                    end_time: end,
                    root_operation: root,
                    total_tokens: spans.iter().map(|e| e.total_tokens as u64).sum(),
                    total_cost: spans.iter().map(|e| e.cost).sum(),
                    error_count: spans.iter().filter(|e| e.status.is_error()).count() as u64,
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        summaries.truncate(limit as usize);
        Ok(summaries)
    }

    async fn trace_events(&self, project_id: i64, trace_id: &str) -> Result<Vec<TraceEvent>> {
        let mut spans: Vec<TraceEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.project_id == project_id && e.trace_id == trace_id)
            .cloned()
            .collect();
        spans.sort_by_key(|e| e.start_time);
        Ok(spans)
    }

    async fn analytics_summary(
        &self,
        project_id: i64,
        range: TimeRange,
    ) -> Result<AnalyticsSummary> {
        let events = self.events.read();
        let rows: Vec<&TraceEvent> = events
            .iter()
            .filter(|e| e.project_id == project_id && range.contains(e.start_time))
            .collect();
        let total = rows.len() as u64;
        let errors = rows.iter().filter(|e| e.status.is_error()).count() as u64;
        Ok(AnalyticsSummary {
            total_events: total,
            total_cost: rows.iter().map(|e| e.cost).sum(),
            total_tokens: rows.iter().map(|e| e.total_tokens as u64).sum(),
            error_rate: if total > 0 {
                errors as f64 / total as f64
            } else {
                0.0
            },
            avg_latency_ms: if total > 0 {
                rows.iter().map(|e| e.duration_ms() as f64).sum::<f64>() / total as f64
            } else {
                0.0
            },
        })
    }

    async fn cost_by_model(&self, project_id: i64, range: TimeRange) -> Result<Vec<ModelCost>> {
        let events = self.events.read();
        let mut by_model: HashMap<String, ModelCost> = HashMap::new();
        for e in events
            .iter()
            .filter(|e| e.project_id == project_id && range.contains(e.start_time))
        {
            let entry = by_model
                .entry(e.model.clone())
                .or_insert_with(|| ModelCost {
                    model: e.model.clone(),
                    provider: e.provider.clone(),
                    event_count: 0,
                    total_tokens: 0,
                    total_cost: 0.0,
                });
            entry.event_count += 1;
            entry.total_tokens += e.total_tokens as u64;
            entry.total_cost += e.cost;
        }
        let mut costs: Vec<ModelCost> = by_model.into_values().collect();
        costs.sort_by(|a, b| b.total_cost.partial_cmp(&a.total_cost).unwrap());
        Ok(costs)
    }

    async fn latency_percentiles(
        &self,
        project_id: i64,
        range: TimeRange,
    ) -> Result<LatencyStats> {
        let events = self.events.read();
        let mut durations: Vec<f64> = events
            .iter()
            .filter(|e| e.project_id == project_id && range.contains(e.start_time))
            .map(|e| e.duration_ms() as f64)
            .collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
        if durations.is_empty() {
            return Ok(LatencyStats::default());
        }
        Ok(LatencyStats {
            avg_ms: durations.iter().sum::<f64>() / durations.len() as f64,
            p50_ms: Self::percentile(&durations, 0.5),
            p90_ms: Self::percentile(&durations, 0.9),
            p95_ms: Self::percentile(&durations, 0.95),
            p99_ms: Self::percentile(&durations, 0.99),
        })
    }

    async fn error_breakdown(&self, project_id: i64, range: TimeRange) -> Result<Vec<ErrorSlice>> {
        let events = self.events.read();
        let mut slices: HashMap<(String, String), ErrorSlice> = HashMap::new();
        for e in events.iter().filter(|e| {
            e.project_id == project_id
                && range.contains(e.start_time)
                && e.status != EventStatus::Success
        }) {
            let key = (e.operation_type.clone(), e.status.as_str().to_string());
            let entry = slices.entry(key.clone()).or_insert_with(|| ErrorSlice {
                operation_type: key.0,
                status: key.1,
                count: 0,
                sample_message: e.error_message.clone().unwrap_or_default(),
            });
            entry.count += 1;
        }
        let mut out: Vec<ErrorSlice> = slices.into_values().collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(out)
    }

    async fn prompt_samples(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PromptSample>> {
        let events = self.events.read();
        let mut rows: Vec<&TraceEvent> = events
            .iter()
            .filter(|e| e.project_id == project_id && e.start_time >= since)
            .collect();
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(rows
            .into_iter()
            .take(limit as usize)
            .map(|e| PromptSample {
                operation_type: e.operation_type.clone(),
                model: e.model.clone(),
                input: e.input.clone(),
            })
            .collect())
    }

    async fn count_events(&self, project_id: i64) -> Result<u64> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.project_id == project_id)
            .count() as u64)
    }

    async fn delete_project_events(&self, project_id: i64) -> Result<()> {
        self.events.write().retain(|e| e.project_id != project_id);
        self.seen.lock().retain(|(p, _)| *p != project_id);
        Ok(())
    }

    async fn delete_expired(&self, ttl_days: u32) -> Result<u64> {
        let horizon = Utc::now() - chrono::Duration::days(ttl_days as i64);
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.start_time >= horizon);
        Ok((before - events.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(project_id: i64, event_id: &str, secs: u32) -> TraceEvent {
        TraceEvent {
            event_id: event_id.to_string(),
            project_id,
            trace_id: "t1".into(),
            span_id: format!("s-{event_id}"),
            parent_span_id: None,
            operation_type: "chat".into(),
            status: EventStatus::Success,
            start_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, secs).unwrap(),
            end_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, secs + 1).unwrap(),
            input: serde_json::json!({"prompt": "hi"}),
            output: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            prompt_tokens: 10,
            completion_tokens: 10,
            total_tokens: 20,
            cost: 0.01,
            provider: "openai".into(),
            model: "gpt-4o".into(),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn duplicate_event_ids_collapse() {
        let store = MemoryEventStore::new();
        store.insert_batch(&[event(1, "e1", 0)]).await.unwrap();
        store.insert_batch(&[event(1, "e1", 0)]).await.unwrap();

        assert_eq!(store.count_events(1).await.unwrap(), 1);

        // Same event id under a different project is a different event.
        store.insert_batch(&[event(2, "e1", 0)]).await.unwrap();
        assert_eq!(store.count_events(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cursor_pagination_walks_all_events() {
        let store = MemoryEventStore::new();
        let batch: Vec<TraceEvent> = (0..25).map(|i| event(1, &format!("e{i}"), i)).collect();
        store.insert_batch(&batch).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .query_events(
                    1,
                    &EventFilter {
                        limit: Some(10),
                        cursor: cursor.clone(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            seen.extend(page.events.iter().map(|e| e.event_id.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 25);
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 25);
    }

    #[tokio::test]
    async fn summary_matches_inserted_values() {
        let store = MemoryEventStore::new();
        let mut e1 = event(1, "e1", 0);
        let mut e2 = event(1, "e2", 1);
        e1.cost = 0.5;
        e2.cost = 1.5;
        e2.status = EventStatus::Error;
        store.insert_batch(&[e1, e2]).await.unwrap();

        let summary = store
            .analytics_summary(1, TimeRange::default())
            .await
            .unwrap();
        assert_eq!(summary.total_events, 2);
        assert!((summary.total_cost - 2.0).abs() < 1e-9);
        assert!((summary.error_rate - 0.5).abs() < 1e-9);
        assert!((summary.avg_latency_ms - 1000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn filters_apply() {
        let store = MemoryEventStore::new();
        let mut a = event(1, "a", 0);
        a.operation_type = "chat".into();
        let mut b = event(1, "b", 1);
        b.operation_type = "embedding".into();
        store.insert_batch(&[a, b]).await.unwrap();

        let page = store
            .query_events(
                1,
                &EventFilter {
                    operation_type: Some("embedding".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].event_id, "b");
    }

    #[tokio::test]
    async fn fail_next_inserts_simulates_outage() {
        let store = MemoryEventStore::new();
        store.fail_next_inserts.store(1, Ordering::Relaxed);

        let err = store.insert_batch(&[event(1, "e1", 0)]).await.unwrap_err();
        assert!(err.is_retryable());

        store.insert_batch(&[event(1, "e1", 0)]).await.unwrap();
        assert_eq!(store.count_events(1).await.unwrap(), 1);
    }

    #[test]
    fn cursor_round_trip() {
        let c = encode_cursor(1_700_000_000_000_000, "evt-42");
        assert_eq!(decode_cursor(&c).unwrap(), (1_700_000_000_000_000, "evt-42".into()));
        assert!(decode_cursor("!!!").is_err());
    }
}
