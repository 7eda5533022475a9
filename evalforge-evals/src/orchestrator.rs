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

//! Auto-evaluation orchestrator
//!
//! Two responsibilities, one background loop. The *scanner* fingerprints
//! recent prompts per project and creates a pending evaluation when a
//! fingerprint recurs often enough (and is not opted out, already live,
//! or inside its retry cooldown). The *driver* takes pending evaluations
//! through Analyzing → Generating → Executing → Scoring → Suggesting
//! behind a counted semaphore, with per-phase deadlines, monotone
//! progress, and a cancel token checked at every phase boundary.

use crate::analysis::PromptAnalyzer;
use crate::calculator::calculate_metrics;
use crate::executor::{EvalExecutor, ExecutorConfig};
use crate::generator::{GeneratorConfig, TestGenerator};
use crate::llm::LlmClient;
use crate::store::EvalStore;
use crate::suggester::Suggester;
use chrono::Utc;
use dashmap::DashMap;
use evalforge_core::{
    Error, EvalPhase, Evaluation, EvaluationStatus, NormalizerConfig, PromptAnalysis,
    PromptFingerprint, Result, TaskType,
};
use evalforge_metrics::{MetricsEvent, MetricsHandle};
use evalforge_storage::EventStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent: usize,
    pub trigger_threshold: u64,
    pub scan_interval: Duration,
    pub phase_timeout: Duration,
    pub lookback: Duration,
    pub retry_cooldown: Duration,
    /// Max prompt samples pulled per project per scan.
    pub sample_limit: u64,
    pub judge_model: String,
    pub normalizer: NormalizerConfig,
    pub generator: GeneratorConfig,
    pub executor: ExecutorConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            trigger_threshold: 5,
            scan_interval: Duration::from_secs(60),
            phase_timeout: Duration::from_secs(300),
            lookback: Duration::from_secs(24 * 3600),
            retry_cooldown: Duration::from_secs(24 * 3600),
            sample_limit: 5000,
            judge_model: "gpt-4o-mini".to_string(),
            normalizer: NormalizerConfig::default(),
            generator: GeneratorConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

enum PhaseFailure {
    Cancelled,
    Error(Error),
}

impl From<Error> for PhaseFailure {
    fn from(e: Error) -> Self {
        PhaseFailure::Error(e)
    }
}

pub struct Orchestrator {
    store: Arc<dyn EvalStore>,
    events: Arc<dyn EventStore>,
    llm: Arc<dyn LlmClient>,
    metrics: Option<MetricsHandle>,
    config: OrchestratorConfig,
    semaphore: Arc<Semaphore>,
    cancels: DashMap<Uuid, CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EvalStore>,
        events: Arc<dyn EventStore>,
        llm: Arc<dyn LlmClient>,
        metrics: Option<MetricsHandle>,
        config: OrchestratorConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            events,
            llm,
            metrics,
            config,
            semaphore,
            cancels: DashMap::new(),
        }
    }

    /// Background loop: scan, then dispatch whatever fits under the
    /// concurrency cap.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            info!(
                interval_s = self.config.scan_interval.as_secs(),
                threshold = self.config.trigger_threshold,
                "evaluation scanner started"
            );
            let mut ticker = tokio::time::interval(self.config.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.scan_once().await {
                            Ok(created) if created > 0 => {
                                info!(created, "scanner created evaluations");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "fingerprint scan failed"),
                        }
                        self.clone().dispatch_pending().await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("evaluation scanner shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// One scanner pass over every project. Returns how many evaluations
    /// were created.
    pub async fn scan_once(&self) -> Result<usize> {
        let now = Utc::now();
        let since = now
            - chrono::Duration::from_std(self.config.lookback)
                .map_err(|e| Error::internal(format!("lookback out of range: {e}")))?;
        let cooldown = chrono::Duration::from_std(self.config.retry_cooldown)
            .map_err(|e| Error::internal(format!("cooldown out of range: {e}")))?;

        struct Candidate {
            count: u64,
            text: String,
            operation_type: String,
        }

        let mut created = 0usize;
        for project_id in self.store.project_ids().await? {
            let opt_out = self
                .store
                .project_opt_out(project_id)
                .await
                .unwrap_or_default();
            let samples = self
                .events
                .prompt_samples(project_id, since, self.config.sample_limit)
                .await?;

            let mut candidates: HashMap<String, Candidate> = HashMap::new();
            for sample in samples {
                let Some(text) = evalforge_core::input_text_of(&sample.input) else {
                    continue;
                };
                if text.trim().is_empty() {
                    continue;
                }
                let fingerprint = PromptFingerprint::compute(
                    project_id,
                    &sample.operation_type,
                    &sample.model,
                    &text,
                    &self.config.normalizer,
                );
                candidates
                    .entry(fingerprint.0)
                    .and_modify(|c| c.count += 1)
                    .or_insert(Candidate {
                        count: 1,
                        text,
                        operation_type: sample.operation_type,
                    });
            }

            for (fingerprint, candidate) in candidates {
                if candidate.count < self.config.trigger_threshold {
                    continue;
                }
                let lowered = candidate.text.to_lowercase();
                if opt_out
                    .iter()
                    .any(|s| !s.is_empty() && lowered.contains(&s.to_lowercase()))
                {
                    debug!(project = project_id, "fingerprint opted out");
                    continue;
                }
                if self
                    .store
                    .has_live_evaluation(project_id, &fingerprint)
                    .await?
                {
                    continue;
                }
                if let Some(terminal_at) = self
                    .store
                    .last_terminal_at(project_id, &fingerprint)
                    .await?
                {
                    if now < terminal_at + cooldown {
                        continue;
                    }
                }

                let name = format!(
                    "auto: {} {}",
                    candidate.operation_type,
                    &fingerprint[..8.min(fingerprint.len())]
                );
                let evaluation =
                    Evaluation::new(project_id, fingerprint, name, candidate.text);
                self.store.insert_evaluation(&evaluation).await?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Start as many pending evaluations as the semaphore allows.
    pub async fn dispatch_pending(self: Arc<Self>) {
        let pending = match self.store.list_pending(32).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "cannot list pending evaluations");
                return;
            }
        };

        for evaluation in pending {
            if self.cancels.contains_key(&evaluation.id) {
                continue;
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let cancel = CancellationToken::new();
            self.cancels.insert(evaluation.id, cancel.clone());

            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.run_one(evaluation, cancel).await;
            });
        }
    }

    /// Cooperative cancel. Pending evaluations flip straight to
    /// Cancelled; running ones get their token flipped and finish at the
    /// next phase boundary.
    pub async fn request_cancel(&self, id: Uuid) -> Result<bool> {
        if let Some(entry) = self.cancels.get(&id) {
            entry.value().cancel();
            return Ok(true);
        }
        let evaluation = self.store.get_evaluation(id).await?;
        match evaluation.status {
            EvaluationStatus::Pending => {
                self.store
                    .update_status(id, EvaluationStatus::Cancelled, None)
                    .await
            }
            status if status.is_terminal() => Ok(false),
            _ => Ok(false),
        }
    }

    async fn run_one(self: Arc<Self>, evaluation: Evaluation, cancel: CancellationToken) {
        let id = evaluation.id;
        let started = match self
            .store
            .update_status(id, EvaluationStatus::Running, None)
            .await
        {
            Ok(true) => true,
            Ok(false) => false,
            Err(e) => {
                error!(evaluation = %id, error = %e, "cannot mark evaluation running");
                false
            }
        };
        if !started {
            self.cancels.remove(&id);
            return;
        }

        if let Some(metrics) = &self.metrics {
            metrics.try_record(MetricsEvent::EvaluationStarted {
                project_id: evaluation.project_id,
            });
        }
        info!(evaluation = %id, project = evaluation.project_id, "evaluation running");

        let outcome = self.drive(&evaluation, &cancel).await;
        let final_status = match outcome {
            Ok(()) => {
                let _ = self
                    .store
                    .update_status(id, EvaluationStatus::Completed, None)
                    .await;
                EvaluationStatus::Completed
            }
            Err(PhaseFailure::Cancelled) => {
                if let Err(e) = self.store.skip_unfinished_cases(id).await {
                    warn!(evaluation = %id, error = %e, "could not skip unfinished cases");
                }
                let _ = self
                    .store
                    .update_status(id, EvaluationStatus::Cancelled, None)
                    .await;
                EvaluationStatus::Cancelled
            }
            Err(PhaseFailure::Error(e)) => {
                warn!(evaluation = %id, error = %e, "evaluation failed");
                let _ = self
                    .store
                    .update_status(id, EvaluationStatus::Failed, Some(&e.to_string()))
                    .await;
                EvaluationStatus::Failed
            }
        };

        info!(evaluation = %id, status = final_status.as_str(), "evaluation finished");
        self.cancels.remove(&id);
    }

    async fn enter_phase(
        &self,
        id: Uuid,
        phase: EvalPhase,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), PhaseFailure> {
        if cancel.is_cancelled() {
            return Err(PhaseFailure::Cancelled);
        }
        self.store.update_progress(id, phase.progress_floor()).await?;
        debug!(evaluation = %id, phase = phase.as_str(), "phase entered");
        Ok(())
    }

    async fn drive(
        &self,
        evaluation: &Evaluation,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), PhaseFailure> {
        let id = evaluation.id;
        let timeout = self.config.phase_timeout;

        // Analyzing. A timed-out or failed analysis degrades to the
        // generation default instead of failing the evaluation.
        self.enter_phase(id, EvalPhase::Analyzing, cancel).await?;
        let analyzer = PromptAnalyzer::new(self.llm.clone(), self.config.judge_model.clone());
        let analysis = match tokio::time::timeout(
            timeout,
            analyzer.analyze(id, &evaluation.prompt_text, self.config.executor.case_timeout),
        )
        .await
        {
            Ok(analysis) => analysis,
            Err(_) => {
                warn!(evaluation = %id, "analysis phase timed out, defaulting to generation");
                PromptAnalysis {
                    id: Uuid::new_v4(),
                    evaluation_id: id,
                    task_type: TaskType::Generation,
                    input_schema: serde_json::Value::Null,
                    output_schema: serde_json::Value::Null,
                    constraints: Vec::new(),
                    examples: serde_json::Value::Null,
                    confidence: 0.5,
                }
            }
        };
        self.store.insert_analysis(&analysis).await?;

        // Generating.
        self.enter_phase(id, EvalPhase::Generating, cancel).await?;
        let generator = TestGenerator::new(
            self.llm.clone(),
            self.config.judge_model.clone(),
            self.config.generator.clone(),
        );
        let cases = tokio::time::timeout(
            timeout,
            generator.generate(id, &evaluation.prompt_text, &analysis, timeout),
        )
        .await
        .map_err(|_| Error::Timeout("test generation phase".into()))??;
        self.store.insert_test_cases(&cases).await?;

        // Executing.
        self.enter_phase(id, EvalPhase::Executing, cancel).await?;
        let executor = EvalExecutor::new(
            self.llm.clone(),
            self.config.judge_model.clone(),
            self.config.executor.clone(),
        );
        let (finished, totals) = tokio::time::timeout(
            timeout,
            executor.execute(&evaluation.prompt_text, analysis.task_type, cases, cancel),
        )
        .await
        .map_err(|_| Error::Timeout("execution phase".into()))?;
        for case in &finished {
            self.store.update_test_case(case).await?;
        }
        if cancel.is_cancelled() {
            return Err(PhaseFailure::Cancelled);
        }

        // Scoring.
        self.enter_phase(id, EvalPhase::Scoring, cancel).await?;
        let metrics = calculate_metrics(id, analysis.task_type, &finished, totals);
        self.store.insert_metrics(&metrics).await?;

        // Suggesting.
        self.enter_phase(id, EvalPhase::Suggesting, cancel).await?;
        let suggester = Suggester::new(Some(self.llm.clone()), self.config.judge_model.clone());
        let suggestions = suggester
            .suggest(evaluation, &analysis, &metrics, &finished, timeout)
            .await;
        self.store.insert_suggestions(&suggestions).await?;

        self.store.update_progress(id, 100).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlm};
    use crate::store::MemoryEvalStore;
    use evalforge_core::{EventStatus, TestCaseStatus, TraceEvent};
    use evalforge_storage::MemoryEventStore;

    fn trace_event(project_id: i64, id: &str, prompt: &str) -> TraceEvent {
        TraceEvent {
            event_id: id.into(),
            project_id,
            trace_id: "t".into(),
            span_id: id.into(),
            parent_span_id: None,
            operation_type: "classification".into(),
            status: EventStatus::Success,
            start_time: Utc::now() - chrono::Duration::minutes(5),
            end_time: Utc::now() - chrono::Duration::minutes(5) + chrono::Duration::seconds(1),
            input: serde_json::json!({ "prompt": prompt }),
            output: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            prompt_tokens: 10,
            completion_tokens: 10,
            total_tokens: 20,
            cost: 0.001,
            provider: "openai".into(),
            model: "gpt-4o".into(),
            error_message: None,
        }
    }

    fn orchestrator(
        store: Arc<MemoryEvalStore>,
        events: Arc<MemoryEventStore>,
        llm: Arc<MockLlm>,
    ) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            store,
            events,
            llm,
            None,
            OrchestratorConfig {
                scan_interval: Duration::from_millis(50),
                phase_timeout: Duration::from_secs(10),
                ..Default::default()
            },
        ))
    }

    async fn seed_recurring_prompts(events: &MemoryEventStore, project_id: i64, n: usize) {
        let batch: Vec<TraceEvent> = (0..n)
            .map(|i| {
                trace_event(
                    project_id,
                    &format!("e{i}"),
                    &format!("Classify: order {i}"),
                )
            })
            .collect();
        events.insert_batch(&batch).await.unwrap();
    }

    #[tokio::test]
    async fn scanner_triggers_at_threshold() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec![]));
        let events = Arc::new(MemoryEventStore::new());
        seed_recurring_prompts(&events, 1, 5).await;

        let orch = orchestrator(store.clone(), events.clone(), Arc::new(MockLlm::new()));
        assert_eq!(orch.scan_once().await.unwrap(), 1);

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].project_id, 1);

        // A live evaluation for the same fingerprint blocks re-creation.
        assert_eq!(orch.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn below_threshold_does_not_trigger() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec![]));
        let events = Arc::new(MemoryEventStore::new());
        seed_recurring_prompts(&events, 1, 4).await;

        let orch = orchestrator(store, events, Arc::new(MockLlm::new()));
        assert_eq!(orch.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn opted_out_prompts_are_skipped() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec!["test".into()]));
        let events = Arc::new(MemoryEventStore::new());
        let batch: Vec<TraceEvent> = (0..6)
            .map(|i| trace_event(1, &format!("e{i}"), "Classify: test fixture 1"))
            .collect();
        events.insert_batch(&batch).await.unwrap();

        let orch = orchestrator(store, events, Arc::new(MockLlm::new()));
        assert_eq!(orch.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_evaluation_reaches_completed() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec![]));
        let events = Arc::new(MemoryEventStore::new());
        seed_recurring_prompts(&events, 1, 5).await;

        let orch = orchestrator(store.clone(), events, Arc::new(MockLlm::new()));
        orch.scan_once().await.unwrap();
        orch.clone().dispatch_pending().await;

        // Wait for the run to finish.
        let id = store.evaluations.lock().keys().copied().next().unwrap();
        for _ in 0..100 {
            if store.evaluation(id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let eval = store.evaluation(id).unwrap();
        assert_eq!(eval.status, EvaluationStatus::Completed);
        assert_eq!(eval.progress, 100);
        assert!(eval.started_at.is_some());
        assert!(eval.completed_at.is_some());

        assert!(store.analyses.lock().contains_key(&id));
        let metrics = store.metrics.lock().get(&id).cloned().unwrap();
        assert!(metrics.total_cases > 0);
        let cases = store.cases_of(id);
        assert!(cases.iter().all(|c| c.status.is_terminal()));
        assert_eq!(
            metrics.total_cases as usize,
            cases
                .iter()
                .filter(|c| c.status.is_terminal())
                .count()
        );
        let suggestions = store.suggestions.lock().get(&id).cloned().unwrap();
        assert!(!suggestions.is_empty());
    }

    #[tokio::test]
    async fn generation_failure_marks_failed_keeping_analysis() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec![]));
        let events = Arc::new(MemoryEventStore::new());
        seed_recurring_prompts(&events, 1, 5).await;

        let llm = Arc::new(MockLlm::new());
        // First call answers analysis; the generator call then fails
        // terminally.
        llm.push_response(r#"{"task_type": "classification", "confidence": 0.9}"#);
        llm.push_error(LlmError::NonRetryable("quota exhausted".into()));

        let orch = orchestrator(store.clone(), events, llm);
        orch.scan_once().await.unwrap();
        orch.clone().dispatch_pending().await;

        let id = store.evaluations.lock().keys().copied().next().unwrap();
        for _ in 0..100 {
            if store.evaluation(id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let eval = store.evaluation(id).unwrap();
        assert_eq!(eval.status, EvaluationStatus::Failed);
        assert!(eval.failure_reason.as_deref().unwrap().contains("quota"));
        // Partial artifacts are retained.
        assert!(store.analyses.lock().contains_key(&id));
        assert!(store.metrics.lock().get(&id).is_none());
    }

    #[tokio::test]
    async fn cancellation_mid_execution_skips_cases() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec![]));
        let events = Arc::new(MemoryEventStore::new());
        seed_recurring_prompts(&events, 1, 5).await;

        let llm = Arc::new(MockLlm::new());
        llm.delay_ms.store(100, std::sync::atomic::Ordering::Relaxed);

        let orch = orchestrator(store.clone(), events, llm);
        orch.scan_once().await.unwrap();
        orch.clone().dispatch_pending().await;

        let id = store.evaluations.lock().keys().copied().next().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(orch.request_cancel(id).await.unwrap());

        for _ in 0..200 {
            if store.evaluation(id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let eval = store.evaluation(id).unwrap();
        assert_eq!(eval.status, EvaluationStatus::Cancelled);
        let cases = store.cases_of(id);
        if !cases.is_empty() {
            assert!(cases.iter().all(|c| c.status.is_terminal()));
            assert!(cases
                .iter()
                .any(|c| c.status == TestCaseStatus::Skipped));
        }
    }

    #[tokio::test]
    async fn cancel_pending_without_dispatch() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec![]));
        let events = Arc::new(MemoryEventStore::new());
        let orch = orchestrator(store.clone(), events, Arc::new(MockLlm::new()));

        let eval = Evaluation::new(1, "fp".into(), "n".into(), "p".into());
        store.insert_evaluation(&eval).await.unwrap();

        assert!(orch.request_cancel(eval.id).await.unwrap());
        assert_eq!(
            store.evaluation(eval.id).unwrap().status,
            EvaluationStatus::Cancelled
        );
        // Cancelling a terminal evaluation is a no-op.
        assert!(!orch.request_cancel(eval.id).await.unwrap());
    }

    #[tokio::test]
    async fn cooldown_blocks_rescan_after_failure() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec![]));
        let events = Arc::new(MemoryEventStore::new());
        seed_recurring_prompts(&events, 1, 5).await;

        let orch = orchestrator(store.clone(), events, Arc::new(MockLlm::new()));
        assert_eq!(orch.scan_once().await.unwrap(), 1);

        let id = store.evaluations.lock().keys().copied().next().unwrap();
        store
            .update_status(id, EvaluationStatus::Running, None)
            .await
            .unwrap();
        store
            .update_status(id, EvaluationStatus::Failed, Some("boom"))
            .await
            .unwrap();

        // Terminal-with-cooldown: the same fingerprint is not retried.
        assert_eq!(orch.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_semaphore() {
        let store = Arc::new(MemoryEvalStore::new().with_project(1, vec![]));
        let events = Arc::new(MemoryEventStore::new());

        for i in 0..6 {
            let eval = Evaluation::new(1, format!("fp{i}"), format!("n{i}"), "p".into());
            store.insert_evaluation(&eval).await.unwrap();
        }

        let llm = Arc::new(MockLlm::new());
        llm.delay_ms.store(80, std::sync::atomic::Ordering::Relaxed);
        let orch = Arc::new(Orchestrator::new(
            store.clone(),
            events,
            llm,
            None,
            OrchestratorConfig {
                max_concurrent: 2,
                ..Default::default()
            },
        ));

        orch.clone().dispatch_pending().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let running = store
            .evaluations
            .lock()
            .values()
            .filter(|e| e.status == EvaluationStatus::Running)
            .count();
        assert!(running <= 2, "at most two evaluations run concurrently");
    }
}
