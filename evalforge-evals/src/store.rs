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

//! Persistence seam of the orchestrator
//!
//! The subset of metadata operations the evaluation loop needs, so the
//! loop is drivable against an in-process store in tests. Production
//! wiring passes the PostgreSQL-backed [`MetadataStore`] straight in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evalforge_core::{
    Error, Evaluation, EvaluationMetrics, EvaluationStatus, OptimizationSuggestion,
    PromptAnalysis, Result, TestCase, TestCaseStatus,
};
use evalforge_storage::MetadataStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
pub trait EvalStore: Send + Sync {
    async fn project_ids(&self) -> Result<Vec<i64>>;

    /// Substrings that exempt a project's prompts from auto-evaluation.
    async fn project_opt_out(&self, project_id: i64) -> Result<Vec<String>>;

    async fn insert_evaluation(&self, eval: &Evaluation) -> Result<()>;
    async fn get_evaluation(&self, id: Uuid) -> Result<Evaluation>;
    async fn list_pending(&self, limit: i64) -> Result<Vec<Evaluation>>;
    async fn update_status(
        &self,
        id: Uuid,
        status: EvaluationStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool>;
    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<()>;
    async fn has_live_evaluation(&self, project_id: i64, fingerprint: &str) -> Result<bool>;
    async fn last_terminal_at(
        &self,
        project_id: i64,
        fingerprint: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn insert_analysis(&self, analysis: &PromptAnalysis) -> Result<()>;
    async fn insert_test_cases(&self, cases: &[TestCase]) -> Result<()>;
    async fn update_test_case(&self, case: &TestCase) -> Result<()>;
    async fn skip_unfinished_cases(&self, evaluation_id: Uuid) -> Result<u64>;
    async fn insert_metrics(&self, metrics: &EvaluationMetrics) -> Result<()>;
    async fn insert_suggestions(&self, suggestions: &[OptimizationSuggestion]) -> Result<()>;
}

#[async_trait]
impl EvalStore for MetadataStore {
    async fn project_ids(&self) -> Result<Vec<i64>> {
        self.all_project_ids().await
    }

    async fn project_opt_out(&self, project_id: i64) -> Result<Vec<String>> {
        Ok(self.get_project(project_id).await?.eval_opt_out)
    }

    async fn insert_evaluation(&self, eval: &Evaluation) -> Result<()> {
        MetadataStore::insert_evaluation(self, eval).await
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Evaluation> {
        MetadataStore::get_evaluation(self, id).await
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<Evaluation>> {
        self.list_pending_evaluations(limit).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: EvaluationStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        self.update_evaluation_status(id, status, failure_reason)
            .await
    }

    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        MetadataStore::update_progress(self, id, progress).await
    }

    async fn has_live_evaluation(&self, project_id: i64, fingerprint: &str) -> Result<bool> {
        MetadataStore::has_live_evaluation(self, project_id, fingerprint).await
    }

    async fn last_terminal_at(
        &self,
        project_id: i64,
        fingerprint: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        MetadataStore::last_terminal_at(self, project_id, fingerprint).await
    }

    async fn insert_analysis(&self, analysis: &PromptAnalysis) -> Result<()> {
        MetadataStore::insert_analysis(self, analysis).await
    }

    async fn insert_test_cases(&self, cases: &[TestCase]) -> Result<()> {
        MetadataStore::insert_test_cases(self, cases).await
    }

    async fn update_test_case(&self, case: &TestCase) -> Result<()> {
        MetadataStore::update_test_case(self, case).await
    }

    async fn skip_unfinished_cases(&self, evaluation_id: Uuid) -> Result<u64> {
        MetadataStore::skip_unfinished_cases(self, evaluation_id).await
    }

    async fn insert_metrics(&self, metrics: &EvaluationMetrics) -> Result<()> {
        MetadataStore::insert_metrics(self, metrics).await
    }

    async fn insert_suggestions(&self, suggestions: &[OptimizationSuggestion]) -> Result<()> {
        MetadataStore::insert_suggestions(self, suggestions).await
    }
}

/// In-process store for driving the loop in tests.
#[derive(Default)]
pub struct MemoryEvalStore {
    pub projects: Mutex<HashMap<i64, Vec<String>>>,
    pub evaluations: Mutex<HashMap<Uuid, Evaluation>>,
    pub analyses: Mutex<HashMap<Uuid, PromptAnalysis>>,
    pub test_cases: Mutex<HashMap<Uuid, Vec<TestCase>>>,
    pub metrics: Mutex<HashMap<Uuid, EvaluationMetrics>>,
    pub suggestions: Mutex<HashMap<Uuid, Vec<OptimizationSuggestion>>>,
}

impl MemoryEvalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, project_id: i64, opt_out: Vec<String>) -> Self {
        self.projects.lock().insert(project_id, opt_out);
        self
    }

    pub fn evaluation(&self, id: Uuid) -> Option<Evaluation> {
        self.evaluations.lock().get(&id).cloned()
    }

    pub fn cases_of(&self, id: Uuid) -> Vec<TestCase> {
        self.test_cases.lock().get(&id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl EvalStore for MemoryEvalStore {
    async fn project_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self.projects.lock().keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn project_opt_out(&self, project_id: i64) -> Result<Vec<String>> {
        self.projects
            .lock()
            .get(&project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))
    }

    async fn insert_evaluation(&self, eval: &Evaluation) -> Result<()> {
        self.evaluations.lock().insert(eval.id, eval.clone());
        Ok(())
    }

    async fn get_evaluation(&self, id: Uuid) -> Result<Evaluation> {
        self.evaluation(id)
            .ok_or_else(|| Error::NotFound(format!("evaluation {id}")))
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<Evaluation>> {
        let mut pending: Vec<Evaluation> = self
            .evaluations
            .lock()
            .values()
            .filter(|e| e.status == EvaluationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: EvaluationStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let mut evaluations = self.evaluations.lock();
        let Some(eval) = evaluations.get_mut(&id) else {
            return Ok(false);
        };
        if eval.status.is_terminal() {
            return Ok(false);
        }
        eval.status = status;
        if let Some(reason) = failure_reason {
            eval.failure_reason = Some(reason.to_string());
        }
        match status {
            EvaluationStatus::Running => {
                eval.started_at.get_or_insert_with(Utc::now);
            }
            s if s.is_terminal() => {
                eval.completed_at.get_or_insert_with(Utc::now);
                if s == EvaluationStatus::Completed {
                    eval.progress = 100;
                }
            }
            _ => {}
        }
        Ok(true)
    }

    async fn update_progress(&self, id: Uuid, progress: u8) -> Result<()> {
        if let Some(eval) = self.evaluations.lock().get_mut(&id) {
            if !eval.status.is_terminal() {
                eval.progress = eval.progress.max(progress.min(100));
            }
        }
        Ok(())
    }

    async fn has_live_evaluation(&self, project_id: i64, fingerprint: &str) -> Result<bool> {
        Ok(self.evaluations.lock().values().any(|e| {
            e.project_id == project_id && e.fingerprint == fingerprint && !e.status.is_terminal()
        }))
    }

    async fn last_terminal_at(
        &self,
        project_id: i64,
        fingerprint: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .evaluations
            .lock()
            .values()
            .filter(|e| {
                e.project_id == project_id
                    && e.fingerprint == fingerprint
                    && e.status.is_terminal()
            })
            .filter_map(|e| e.completed_at)
            .max())
    }

    async fn insert_analysis(&self, analysis: &PromptAnalysis) -> Result<()> {
        self.analyses
            .lock()
            .entry(analysis.evaluation_id)
            .or_insert_with(|| analysis.clone());
        Ok(())
    }

    async fn insert_test_cases(&self, cases: &[TestCase]) -> Result<()> {
        for case in cases {
            self.test_cases
                .lock()
                .entry(case.evaluation_id)
                .or_default()
                .push(case.clone());
        }
        Ok(())
    }

    async fn update_test_case(&self, case: &TestCase) -> Result<()> {
        let mut table = self.test_cases.lock();
        if let Some(cases) = table.get_mut(&case.evaluation_id) {
            if let Some(existing) = cases.iter_mut().find(|c| c.id == case.id) {
                // Same guard as the relational store: terminal rows are
                // immutable.
                if matches!(
                    existing.status,
                    TestCaseStatus::Pending | TestCaseStatus::Running
                ) {
                    *existing = case.clone();
                }
            }
        }
        Ok(())
    }

    async fn skip_unfinished_cases(&self, evaluation_id: Uuid) -> Result<u64> {
        let mut table = self.test_cases.lock();
        let mut skipped = 0;
        if let Some(cases) = table.get_mut(&evaluation_id) {
            for case in cases.iter_mut() {
                if matches!(
                    case.status,
                    TestCaseStatus::Pending | TestCaseStatus::Running
                ) {
                    case.status = TestCaseStatus::Skipped;
                    skipped += 1;
                }
            }
        }
        Ok(skipped)
    }

    async fn insert_metrics(&self, metrics: &EvaluationMetrics) -> Result<()> {
        self.metrics
            .lock()
            .entry(metrics.evaluation_id)
            .or_insert_with(|| metrics.clone());
        Ok(())
    }

    async fn insert_suggestions(&self, suggestions: &[OptimizationSuggestion]) -> Result<()> {
        for s in suggestions {
            self.suggestions
                .lock()
                .entry(s.evaluation_id)
                .or_default()
                .push(s.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_states_are_immutable() {
        let store = MemoryEvalStore::new().with_project(1, vec![]);
        let eval = Evaluation::new(1, "fp".into(), "n".into(), "p".into());
        store.insert_evaluation(&eval).await.unwrap();

        assert!(store
            .update_status(eval.id, EvaluationStatus::Running, None)
            .await
            .unwrap());
        assert!(store
            .update_status(eval.id, EvaluationStatus::Completed, None)
            .await
            .unwrap());
        // No transition out of Completed.
        assert!(!store
            .update_status(eval.id, EvaluationStatus::Failed, Some("nope"))
            .await
            .unwrap());
        assert_eq!(
            store.evaluation(eval.id).unwrap().status,
            EvaluationStatus::Completed
        );
    }

    #[tokio::test]
    async fn progress_is_monotone() {
        let store = MemoryEvalStore::new().with_project(1, vec![]);
        let eval = Evaluation::new(1, "fp".into(), "n".into(), "p".into());
        store.insert_evaluation(&eval).await.unwrap();

        store.update_progress(eval.id, 40).await.unwrap();
        store.update_progress(eval.id, 20).await.unwrap();
        assert_eq!(store.evaluation(eval.id).unwrap().progress, 40);

        store.update_progress(eval.id, 80).await.unwrap();
        assert_eq!(store.evaluation(eval.id).unwrap().progress, 80);
    }
}
