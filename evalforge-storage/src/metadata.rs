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

//! Relational metadata store
//!
//! PostgreSQL holds everything that is not a trace event: tenants,
//! projects, API keys, evaluations and their artifacts, alert thresholds
//! and notification configs. Ownership cascades are enforced in the
//! schema (`ON DELETE CASCADE`, always top-down). Evaluation artifacts
//! that must appear atomically (generated test cases, suggestion sets)
//! are written inside one transaction.

use crate::error::from_sqlx;
use chrono::{DateTime, Utc};
use evalforge_core::{
    AlertMetric, AlertOperator, AlertThreshold, ApiKey, Error, Evaluation, EvaluationMetrics,
    EvaluationStatus, NotificationChannel, NotificationConfig, OptimizationSuggestion, Project,
    PromptAnalysis, Result, SuggestionCategory, SuggestionPriority, SuggestionStatus, TaskType,
    TestCase, TestCaseStatus, TestCategory, User,
};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id BIGSERIAL PRIMARY KEY,
        owner_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        eval_opt_out JSONB NOT NULL DEFAULT '["test"]',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_keys (
        id BIGSERIAL PRIMARY KEY,
        project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        lookup_prefix TEXT NOT NULL,
        key_hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        revoked BOOLEAN NOT NULL DEFAULT false
    )
    "#,
    "CREATE INDEX IF NOT EXISTS api_keys_prefix_idx ON api_keys (lookup_prefix)",
    r#"
    CREATE TABLE IF NOT EXISTS evaluations (
        id UUID PRIMARY KEY,
        project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        fingerprint TEXT NOT NULL,
        name TEXT NOT NULL,
        prompt_text TEXT NOT NULL,
        status TEXT NOT NULL,
        progress SMALLINT NOT NULL DEFAULT 0,
        failure_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS evaluations_project_idx ON evaluations (project_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS evaluations_fingerprint_idx ON evaluations (project_id, fingerprint)",
    r#"
    CREATE TABLE IF NOT EXISTS prompt_analyses (
        id UUID PRIMARY KEY,
        evaluation_id UUID NOT NULL UNIQUE REFERENCES evaluations(id) ON DELETE CASCADE,
        task_type TEXT NOT NULL,
        input_schema JSONB NOT NULL DEFAULT 'null',
        output_schema JSONB NOT NULL DEFAULT 'null',
        constraints JSONB NOT NULL DEFAULT '[]',
        examples JSONB NOT NULL DEFAULT 'null',
        confidence DOUBLE PRECISION NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS test_cases (
        id UUID PRIMARY KEY,
        evaluation_id UUID NOT NULL REFERENCES evaluations(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        input TEXT NOT NULL,
        expected_output TEXT NOT NULL,
        category TEXT NOT NULL,
        weight DOUBLE PRECISION NOT NULL DEFAULT 1.0,
        status TEXT NOT NULL,
        score DOUBLE PRECISION,
        actual_output TEXT,
        execution_time_ms BIGINT,
        error_message TEXT,
        executed_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS test_cases_eval_idx ON test_cases (evaluation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS evaluation_metrics (
        evaluation_id UUID PRIMARY KEY REFERENCES evaluations(id) ON DELETE CASCADE,
        payload JSONB NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS optimization_suggestions (
        id UUID PRIMARY KEY,
        evaluation_id UUID NOT NULL REFERENCES evaluations(id) ON DELETE CASCADE,
        category TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        old_prompt TEXT NOT NULL,
        new_prompt TEXT NOT NULL,
        expected_impact DOUBLE PRECISION NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        priority TEXT NOT NULL,
        status TEXT NOT NULL,
        reasoning TEXT NOT NULL DEFAULT '',
        examples JSONB NOT NULL DEFAULT 'null',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS suggestions_eval_idx ON optimization_suggestions (evaluation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS alert_thresholds (
        id BIGSERIAL PRIMARY KEY,
        project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        metric TEXT NOT NULL,
        operator TEXT NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        window_minutes INTEGER NOT NULL DEFAULT 5,
        cooldown_minutes INTEGER NOT NULL DEFAULT 15,
        last_triggered TIMESTAMPTZ,
        enabled BOOLEAN NOT NULL DEFAULT true,
        UNIQUE (project_id, metric)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notification_configs (
        id BIGSERIAL PRIMARY KEY,
        project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        channel TEXT NOT NULL,
        target TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT true
    )
    "#,
];

pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
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

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(from_sqlx)?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }

    // -- users ------------------------------------------------------------

    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User> {
        let row = sqlx::query(
            "INSERT INTO users (email, password_hash) VALUES ($1, $2) \
             RETURNING id, email, password_hash, created_at",
        )
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row_to_user(&row)
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row.as_ref().map(row_to_user).transpose()
    }

    // -- projects ----------------------------------------------------------

    pub async fn create_project(
        &self,
        owner_id: i64,
        name: &str,
        description: &str,
    ) -> Result<Project> {
        let row = sqlx::query(
            "INSERT INTO projects (owner_id, name, description) VALUES ($1, $2, $3) \
             RETURNING id, owner_id, name, description, eval_opt_out, created_at",
        )
        .bind(owner_id)
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row_to_project(&row)
    }

    pub async fn get_project(&self, id: i64) -> Result<Project> {
        let row = sqlx::query(
            "SELECT id, owner_id, name, description, eval_opt_out, created_at \
             FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?
        .ok_or_else(|| Error::NotFound(format!("project {id}")))?;
        row_to_project(&row)
    }

    pub async fn list_projects(&self, owner_id: i64) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, owner_id, name, description, eval_opt_out, created_at \
             FROM projects WHERE owner_id = $1 ORDER BY created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter().map(row_to_project).collect()
    }

    pub async fn all_project_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM projects ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
        rows.iter()
            .map(|r| r.try_get("id").map_err(from_sqlx))
            .collect()
    }

    /// Cascades to keys, evaluations, suggestions and alert configs via
    /// the schema. The caller is responsible for the event store side.
    pub async fn delete_project(&self, id: i64, owner_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("project {id}")));
        }
        Ok(())
    }

    pub async fn project_exists(&self, id: i64) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(row.is_some())
    }

    // -- api keys ----------------------------------------------------------

    pub async fn insert_api_key(
        &self,
        project_id: i64,
        lookup_prefix: &str,
        key_hash: &str,
    ) -> Result<ApiKey> {
        let row = sqlx::query(
            "INSERT INTO api_keys (project_id, lookup_prefix, key_hash) VALUES ($1, $2, $3) \
             RETURNING id, project_id, lookup_prefix, key_hash, created_at, revoked",
        )
        .bind(project_id)
        .bind(lookup_prefix)
        .bind(key_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row_to_api_key(&row)
    }

    /// All live keys sharing a lookup prefix; the caller resolves the
    /// match by constant-time digest comparison.
    pub async fn api_keys_by_prefix(&self, lookup_prefix: &str) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query(
            "SELECT id, project_id, lookup_prefix, key_hash, created_at, revoked \
             FROM api_keys WHERE lookup_prefix = $1 AND NOT revoked",
        )
        .bind(lookup_prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter().map(row_to_api_key).collect()
    }

    pub async fn revoke_api_key(&self, id: i64, project_id: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE api_keys SET revoked = true WHERE id = $1 AND project_id = $2")
                .bind(id)
                .bind(project_id)
                .execute(&self.pool)
                .await
                .map_err(from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("api key {id}")));
        }
        Ok(())
    }

    // -- evaluations -------------------------------------------------------

    pub async fn insert_evaluation(&self, eval: &Evaluation) -> Result<()> {
        sqlx::query(
            "INSERT INTO evaluations \
             (id, project_id, fingerprint, name, prompt_text, status, progress, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(eval.id)
        .bind(eval.project_id)
        .bind(&eval.fingerprint)
        .bind(&eval.name)
        .bind(&eval.prompt_text)
        .bind(eval.status.as_str())
        .bind(eval.progress as i16)
        .bind(eval.created_at)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    pub async fn get_evaluation(&self, id: Uuid) -> Result<Evaluation> {
        let row = sqlx::query("SELECT * FROM evaluations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(from_sqlx)?
            .ok_or_else(|| Error::NotFound(format!("evaluation {id}")))?;
        row_to_evaluation(&row)
    }

    pub async fn list_evaluations(&self, project_id: i64, limit: i64) -> Result<Vec<Evaluation>> {
        let rows = sqlx::query(
            "SELECT * FROM evaluations WHERE project_id = $1 \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter().map(row_to_evaluation).collect()
    }

    pub async fn list_pending_evaluations(&self, limit: i64) -> Result<Vec<Evaluation>> {
        let rows = sqlx::query(
            "SELECT * FROM evaluations WHERE status = 'pending' \
             ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter().map(row_to_evaluation).collect()
    }

    /// Transition an evaluation's status, refusing moves out of a
    /// terminal state. Returns whether a row changed.
    pub async fn update_evaluation_status(
        &self,
        id: Uuid,
        status: EvaluationStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE evaluations SET \
               status = $2, \
               failure_reason = coalesce($3, failure_reason), \
               started_at = CASE WHEN $2 = 'running' THEN coalesce(started_at, now()) \
                                 ELSE started_at END, \
               completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') \
                                 THEN coalesce(completed_at, now()) \
                                 ELSE completed_at END, \
               progress = CASE WHEN $2 = 'completed' THEN 100 ELSE progress END \
             WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(failure_reason)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    /// Idempotent progress bump: `progress = max(old, new)`.
    pub async fn update_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        sqlx::query(
            "UPDATE evaluations SET progress = GREATEST(progress, $2) \
             WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(id)
        .bind(progress.min(100) as i16)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    pub async fn has_live_evaluation(&self, project_id: i64, fingerprint: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM evaluations \
             WHERE project_id = $1 AND fingerprint = $2 \
               AND status IN ('pending', 'running') LIMIT 1",
        )
        .bind(project_id)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(row.is_some())
    }

    /// Most recent terminal timestamp for a fingerprint, used for the
    /// scanner's retry cooldown.
    pub async fn last_terminal_at(
        &self,
        project_id: i64,
        fingerprint: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT max(completed_at) AS last FROM evaluations \
             WHERE project_id = $1 AND fingerprint = $2 \
               AND status IN ('completed', 'failed', 'cancelled')",
        )
        .bind(project_id)
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row.try_get("last").map_err(from_sqlx)
    }

    // -- prompt analyses ---------------------------------------------------

    pub async fn insert_analysis(&self, analysis: &PromptAnalysis) -> Result<()> {
        sqlx::query(
            "INSERT INTO prompt_analyses \
             (id, evaluation_id, task_type, input_schema, output_schema, constraints, \
              examples, confidence) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (evaluation_id) DO NOTHING",
        )
        .bind(analysis.id)
        .bind(analysis.evaluation_id)
        .bind(analysis.task_type.as_str())
        .bind(&analysis.input_schema)
        .bind(&analysis.output_schema)
        .bind(serde_json::to_value(&analysis.constraints)?)
        .bind(&analysis.examples)
        .bind(analysis.confidence)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    pub async fn get_analysis(&self, evaluation_id: Uuid) -> Result<Option<PromptAnalysis>> {
        let row = sqlx::query("SELECT * FROM prompt_analyses WHERE evaluation_id = $1")
            .bind(evaluation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(from_sqlx)?;
        row.as_ref().map(row_to_analysis).transpose()
    }

    // -- test cases --------------------------------------------------------

    /// The generated suite lands atomically: all cases or none.
    pub async fn insert_test_cases(&self, cases: &[TestCase]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;
        for case in cases {
            sqlx::query(
                "INSERT INTO test_cases \
                 (id, evaluation_id, name, input, expected_output, category, weight, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(case.id)
            .bind(case.evaluation_id)
            .bind(&case.name)
            .bind(&case.input)
            .bind(&case.expected_output)
            .bind(case.category.as_str())
            .bind(case.weight)
            .bind(case.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        }
        tx.commit().await.map_err(from_sqlx)?;
        Ok(())
    }

    pub async fn list_test_cases(&self, evaluation_id: Uuid) -> Result<Vec<TestCase>> {
        let rows = sqlx::query(
            "SELECT * FROM test_cases WHERE evaluation_id = $1 ORDER BY category, name",
        )
        .bind(evaluation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter().map(row_to_test_case).collect()
    }

    pub async fn update_test_case(&self, case: &TestCase) -> Result<()> {
        sqlx::query(
            "UPDATE test_cases SET status = $2, score = $3, actual_output = $4, \
             execution_time_ms = $5, error_message = $6, executed_at = $7 \
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(case.id)
        .bind(case.status.as_str())
        .bind(case.score)
        .bind(&case.actual_output)
        .bind(case.execution_time_ms)
        .bind(&case.error_message)
        .bind(case.executed_at)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    /// Mark every unfinished case skipped; used on cancellation.
    pub async fn skip_unfinished_cases(&self, evaluation_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE test_cases SET status = 'skipped' \
             WHERE evaluation_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(evaluation_id)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(result.rows_affected())
    }

    // -- evaluation metrics ------------------------------------------------

    /// Persisted exactly once per evaluation; later writes are no-ops.
    pub async fn insert_metrics(&self, metrics: &EvaluationMetrics) -> Result<()> {
        sqlx::query(
            "INSERT INTO evaluation_metrics (evaluation_id, payload, computed_at) \
             VALUES ($1, $2, $3) ON CONFLICT (evaluation_id) DO NOTHING",
        )
        .bind(metrics.evaluation_id)
        .bind(serde_json::to_value(metrics)?)
        .bind(metrics.computed_at)
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(())
    }

    pub async fn get_metrics(&self, evaluation_id: Uuid) -> Result<Option<EvaluationMetrics>> {
        let row = sqlx::query("SELECT payload FROM evaluation_metrics WHERE evaluation_id = $1")
            .bind(evaluation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(from_sqlx)?;
        match row {
            Some(row) => {
                let payload: serde_json::Value = row.try_get("payload").map_err(from_sqlx)?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    // -- optimization suggestions -------------------------------------------

    pub async fn insert_suggestions(&self, suggestions: &[OptimizationSuggestion]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;
        for s in suggestions {
            sqlx::query(
                "INSERT INTO optimization_suggestions \
                 (id, evaluation_id, category, title, description, old_prompt, new_prompt, \
                  expected_impact, confidence, priority, status, reasoning, examples, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(s.id)
            .bind(s.evaluation_id)
            .bind(s.category.as_str())
            .bind(&s.title)
            .bind(&s.description)
            .bind(&s.old_prompt)
            .bind(&s.new_prompt)
            .bind(s.expected_impact)
            .bind(s.confidence)
            .bind(s.priority.as_str())
            .bind(s.status.as_str())
            .bind(&s.reasoning)
            .bind(&s.examples)
            .bind(s.created_at)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        }
        tx.commit().await.map_err(from_sqlx)?;
        Ok(())
    }

    pub async fn list_suggestions(&self, evaluation_id: Uuid) -> Result<Vec<OptimizationSuggestion>> {
        let rows = sqlx::query(
            "SELECT * FROM optimization_suggestions WHERE evaluation_id = $1 \
             ORDER BY expected_impact * confidence DESC",
        )
        .bind(evaluation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter().map(row_to_suggestion).collect()
    }

    pub async fn list_project_suggestions(
        &self,
        project_id: i64,
        limit: i64,
    ) -> Result<Vec<OptimizationSuggestion>> {
        let rows = sqlx::query(
            "SELECT s.* FROM optimization_suggestions s \
             JOIN evaluations e ON e.id = s.evaluation_id \
             WHERE e.project_id = $1 \
             ORDER BY s.created_at DESC LIMIT $2",
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(from_sqlx)?;
        rows.iter().map(row_to_suggestion).collect()
    }

    pub async fn update_suggestion_status(
        &self,
        id: Uuid,
        project_id: i64,
        status: SuggestionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE optimization_suggestions s SET status = $3 \
             FROM evaluations e \
             WHERE s.id = $1 AND e.id = s.evaluation_id AND e.project_id = $2",
        )
        .bind(id)
        .bind(project_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    // -- alert thresholds ---------------------------------------------------

    pub async fn upsert_threshold(
        &self,
        project_id: i64,
        metric: AlertMetric,
        operator: AlertOperator,
        value: f64,
        window_minutes: u32,
        cooldown_minutes: u32,
        enabled: bool,
    ) -> Result<AlertThreshold> {
        let row = sqlx::query(
            "INSERT INTO alert_thresholds \
             (project_id, metric, operator, value, window_minutes, cooldown_minutes, enabled) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (project_id, metric) DO UPDATE SET \
               operator = EXCLUDED.operator, value = EXCLUDED.value, \
               window_minutes = EXCLUDED.window_minutes, \
               cooldown_minutes = EXCLUDED.cooldown_minutes, enabled = EXCLUDED.enabled \
             RETURNING *",
        )
        .bind(project_id)
        .bind(metric.as_str())
        .bind(operator.as_str())
        .bind(value)
        .bind(window_minutes as i32)
        .bind(cooldown_minutes as i32)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row_to_threshold(&row)
    }

    pub async fn list_thresholds(&self, project_id: i64) -> Result<Vec<AlertThreshold>> {
        let rows = sqlx::query("SELECT * FROM alert_thresholds WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
        rows.iter().map(row_to_threshold).collect()
    }

    pub async fn list_enabled_thresholds(&self) -> Result<Vec<AlertThreshold>> {
        let rows = sqlx::query("SELECT * FROM alert_thresholds WHERE enabled")
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
        rows.iter().map(row_to_threshold).collect()
    }

    pub async fn set_last_triggered(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE alert_thresholds SET last_triggered = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(())
    }

    pub async fn delete_threshold(&self, id: i64, project_id: i64) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM alert_thresholds WHERE id = $1 AND project_id = $2")
                .bind(id)
                .bind(project_id)
                .execute(&self.pool)
                .await
                .map_err(from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("alert threshold {id}")));
        }
        Ok(())
    }

    // -- notification configs ----------------------------------------------

    pub async fn insert_notification_config(
        &self,
        project_id: i64,
        channel: NotificationChannel,
        target: &str,
        enabled: bool,
    ) -> Result<NotificationConfig> {
        let row = sqlx::query(
            "INSERT INTO notification_configs (project_id, channel, target, enabled) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(project_id)
        .bind(channel.as_str())
        .bind(target)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        row_to_notification(&row)
    }

    pub async fn list_notification_configs(
        &self,
        project_id: i64,
    ) -> Result<Vec<NotificationConfig>> {
        let rows = sqlx::query("SELECT * FROM notification_configs WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(from_sqlx)?;
        rows.iter().map(row_to_notification).collect()
    }

    pub async fn delete_notification_config(&self, id: i64, project_id: i64) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM notification_configs WHERE id = $1 AND project_id = $2")
                .bind(id)
                .bind(project_id)
                .execute(&self.pool)
                .await
                .map_err(from_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("notification config {id}")));
        }
        Ok(())
    }
}

// -- row mappers ------------------------------------------------------------

fn row_to_user(row: &sqlx::postgres::PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id").map_err(from_sqlx)?,
        email: row.try_get("email").map_err(from_sqlx)?,
        password_hash: row.try_get("password_hash").map_err(from_sqlx)?,
        created_at: row.try_get("created_at").map_err(from_sqlx)?,
    })
}

fn row_to_project(row: &sqlx::postgres::PgRow) -> Result<Project> {
    let opt_out: serde_json::Value = row.try_get("eval_opt_out").map_err(from_sqlx)?;
    Ok(Project {
        id: row.try_get("id").map_err(from_sqlx)?,
        owner_id: row.try_get("owner_id").map_err(from_sqlx)?,
        name: row.try_get("name").map_err(from_sqlx)?,
        description: row.try_get("description").map_err(from_sqlx)?,
        eval_opt_out: serde_json::from_value(opt_out).unwrap_or_default(),
        created_at: row.try_get("created_at").map_err(from_sqlx)?,
    })
}

fn row_to_api_key(row: &sqlx::postgres::PgRow) -> Result<ApiKey> {
    Ok(ApiKey {
        id: row.try_get("id").map_err(from_sqlx)?,
        project_id: row.try_get("project_id").map_err(from_sqlx)?,
        lookup_prefix: row.try_get("lookup_prefix").map_err(from_sqlx)?,
        key_hash: row.try_get("key_hash").map_err(from_sqlx)?,
        created_at: row.try_get("created_at").map_err(from_sqlx)?,
        revoked: row.try_get("revoked").map_err(from_sqlx)?,
    })
}

fn row_to_evaluation(row: &sqlx::postgres::PgRow) -> Result<Evaluation> {
    let status_raw: String = row.try_get("status").map_err(from_sqlx)?;
    let status = EvaluationStatus::parse(&status_raw)
        .ok_or_else(|| Error::internal(format!("unknown evaluation status '{status_raw}'")))?;
    Ok(Evaluation {
        id: row.try_get("id").map_err(from_sqlx)?,
        project_id: row.try_get("project_id").map_err(from_sqlx)?,
        fingerprint: row.try_get("fingerprint").map_err(from_sqlx)?,
        name: row.try_get("name").map_err(from_sqlx)?,
        prompt_text: row.try_get("prompt_text").map_err(from_sqlx)?,
        status,
        progress: row.try_get::<i16, _>("progress").map_err(from_sqlx)? as u8,
        failure_reason: row.try_get("failure_reason").map_err(from_sqlx)?,
        created_at: row.try_get("created_at").map_err(from_sqlx)?,
        started_at: row.try_get("started_at").map_err(from_sqlx)?,
        completed_at: row.try_get("completed_at").map_err(from_sqlx)?,
    })
}

fn row_to_analysis(row: &sqlx::postgres::PgRow) -> Result<PromptAnalysis> {
    let task_raw: String = row.try_get("task_type").map_err(from_sqlx)?;
    let task_type = TaskType::parse(&task_raw)
        .ok_or_else(|| Error::internal(format!("unknown task type '{task_raw}'")))?;
    let constraints: serde_json::Value = row.try_get("constraints").map_err(from_sqlx)?;
    Ok(PromptAnalysis {
        id: row.try_get("id").map_err(from_sqlx)?,
        evaluation_id: row.try_get("evaluation_id").map_err(from_sqlx)?,
        task_type,
        input_schema: row.try_get("input_schema").map_err(from_sqlx)?,
        output_schema: row.try_get("output_schema").map_err(from_sqlx)?,
        constraints: serde_json::from_value(constraints).unwrap_or_default(),
        examples: row.try_get("examples").map_err(from_sqlx)?,
        confidence: row.try_get("confidence").map_err(from_sqlx)?,
    })
}

fn row_to_test_case(row: &sqlx::postgres::PgRow) -> Result<TestCase> {
    let status_raw: String = row.try_get("status").map_err(from_sqlx)?;
    let status = TestCaseStatus::parse(&status_raw)
        .ok_or_else(|| Error::internal(format!("unknown test case status '{status_raw}'")))?;
    let category_raw: String = row.try_get("category").map_err(from_sqlx)?;
    let category = TestCategory::parse(&category_raw)
        .ok_or_else(|| Error::internal(format!("unknown test category '{category_raw}'")))?;
    Ok(TestCase {
        id: row.try_get("id").map_err(from_sqlx)?,
        evaluation_id: row.try_get("evaluation_id").map_err(from_sqlx)?,
        name: row.try_get("name").map_err(from_sqlx)?,
        input: row.try_get("input").map_err(from_sqlx)?,
        expected_output: row.try_get("expected_output").map_err(from_sqlx)?,
        category,
        weight: row.try_get("weight").map_err(from_sqlx)?,
        status,
        score: row.try_get("score").map_err(from_sqlx)?,
        actual_output: row.try_get("actual_output").map_err(from_sqlx)?,
        execution_time_ms: row.try_get("execution_time_ms").map_err(from_sqlx)?,
        error_message: row.try_get("error_message").map_err(from_sqlx)?,
        executed_at: row.try_get("executed_at").map_err(from_sqlx)?,
    })
}

fn row_to_suggestion(row: &sqlx::postgres::PgRow) -> Result<OptimizationSuggestion> {
    let category_raw: String = row.try_get("category").map_err(from_sqlx)?;
    let category = SuggestionCategory::parse(&category_raw)
        .ok_or_else(|| Error::internal(format!("unknown suggestion category '{category_raw}'")))?;
    let priority_raw: String = row.try_get("priority").map_err(from_sqlx)?;
    let priority = SuggestionPriority::parse(&priority_raw)
        .ok_or_else(|| Error::internal(format!("unknown priority '{priority_raw}'")))?;
    let status_raw: String = row.try_get("status").map_err(from_sqlx)?;
    let status = SuggestionStatus::parse(&status_raw)
        .ok_or_else(|| Error::internal(format!("unknown suggestion status '{status_raw}'")))?;
    Ok(OptimizationSuggestion {
        id: row.try_get("id").map_err(from_sqlx)?,
        evaluation_id: row.try_get("evaluation_id").map_err(from_sqlx)?,
        category,
        title: row.try_get("title").map_err(from_sqlx)?,
        description: row.try_get("description").map_err(from_sqlx)?,
        old_prompt: row.try_get("old_prompt").map_err(from_sqlx)?,
        new_prompt: row.try_get("new_prompt").map_err(from_sqlx)?,
        expected_impact: row.try_get("expected_impact").map_err(from_sqlx)?,
        confidence: row.try_get("confidence").map_err(from_sqlx)?,
        priority,
        status,
        reasoning: row.try_get("reasoning").map_err(from_sqlx)?,
        examples: row.try_get("examples").map_err(from_sqlx)?,
        created_at: row.try_get("created_at").map_err(from_sqlx)?,
    })
}

fn row_to_threshold(row: &sqlx::postgres::PgRow) -> Result<AlertThreshold> {
    let metric_raw: String = row.try_get("metric").map_err(from_sqlx)?;
    let metric = AlertMetric::parse(&metric_raw)
        .ok_or_else(|| Error::internal(format!("unknown alert metric '{metric_raw}'")))?;
    let operator_raw: String = row.try_get("operator").map_err(from_sqlx)?;
    let operator = AlertOperator::parse(&operator_raw)
        .ok_or_else(|| Error::internal(format!("unknown alert operator '{operator_raw}'")))?;
    Ok(AlertThreshold {
        id: row.try_get("id").map_err(from_sqlx)?,
        project_id: row.try_get("project_id").map_err(from_sqlx)?,
        metric,
        operator,
        value: row.try_get("value").map_err(from_sqlx)?,
        window_minutes: row.try_get::<i32, _>("window_minutes").map_err(from_sqlx)? as u32,
        cooldown_minutes: row.try_get::<i32, _>("cooldown_minutes").map_err(from_sqlx)? as u32,
        last_triggered: row.try_get("last_triggered").map_err(from_sqlx)?,
        enabled: row.try_get("enabled").map_err(from_sqlx)?,
    })
}

fn row_to_notification(row: &sqlx::postgres::PgRow) -> Result<NotificationConfig> {
    let channel_raw: String = row.try_get("channel").map_err(from_sqlx)?;
    let channel = NotificationChannel::parse(&channel_raw)
        .ok_or_else(|| Error::internal(format!("unknown channel '{channel_raw}'")))?;
    Ok(NotificationConfig {
        id: row.try_get("id").map_err(from_sqlx)?,
        project_id: row.try_get("project_id").map_err(from_sqlx)?,
        channel,
        target: row.try_get("target").map_err(from_sqlx)?,
        enabled: row.try_get("enabled").map_err(from_sqlx)?,
    })
}
