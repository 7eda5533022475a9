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

//! Test-case execution phase
//!
//! Runs each case's input through the subject prompt via the external
//! LLM, bounded-parallel, and scores the output against the expectation:
//! exact label match for discrete tasks, token-overlap F1 for generative
//! ones. Cancellation marks unstarted and in-flight cases skipped; a
//! per-case timeout or LLM error marks that case errored without
//! touching its siblings.

use crate::calculator::ExecutionTotals;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use chrono::Utc;
use evalforge_core::{TaskType, TestCase, TestCaseStatus};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Cases in flight concurrently per evaluation.
    pub parallelism: usize,
    pub case_timeout: Duration,
    /// Minimum score counted as a pass.
    pub pass_threshold: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: 8,
            case_timeout: Duration::from_secs(60),
            pass_threshold: 0.5,
        }
    }
}

pub struct EvalExecutor {
    llm: Arc<dyn LlmClient>,
    model: String,
    config: ExecutorConfig,
}

impl EvalExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, model: String, config: ExecutorConfig) -> Self {
        Self { llm, model, config }
    }

    /// Run all cases; every returned case is in a terminal state.
    pub async fn execute(
        &self,
        prompt_text: &str,
        task_type: TaskType,
        cases: Vec<TestCase>,
        cancel: &CancellationToken,
    ) -> (Vec<TestCase>, ExecutionTotals) {
        let results: Vec<(TestCase, ExecutionTotals)> = stream::iter(cases)
            .map(|case| self.run_case(prompt_text, task_type, case, cancel))
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut totals = ExecutionTotals::default();
        let mut finished = Vec::with_capacity(results.len());
        for (case, case_totals) in results {
            totals.tokens += case_totals.tokens;
            totals.cost += case_totals.cost;
            finished.push(case);
        }
        (finished, totals)
    }

    async fn run_case(
        &self,
        prompt_text: &str,
        task_type: TaskType,
        mut case: TestCase,
        cancel: &CancellationToken,
    ) -> (TestCase, ExecutionTotals) {
        if cancel.is_cancelled() {
            case.status = TestCaseStatus::Skipped;
            return (case, ExecutionTotals::default());
        }

        case.status = TestCaseStatus::Running;
        let started = Instant::now();
        let request = CompletionRequest {
            timeout: self.config.case_timeout,
            ..CompletionRequest::new(
                self.model.clone(),
                vec![
                    ChatMessage::system(prompt_text),
                    ChatMessage::user(case.input.clone()),
                ],
            )
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.config.case_timeout, self.llm.complete(request)) => result,
            _ = cancel.cancelled() => {
                case.status = TestCaseStatus::Skipped;
                return (case, ExecutionTotals::default());
            }
        };

        case.execution_time_ms = Some(started.elapsed().as_millis() as i64);
        case.executed_at = Some(Utc::now());

        let mut totals = ExecutionTotals::default();
        match outcome {
            Ok(Ok(response)) => {
                let (input_cost, output_cost) = self.llm.cost_per_token();
                totals.tokens =
                    response.prompt_tokens as u64 + response.completion_tokens as u64;
                totals.cost = response.prompt_tokens as f64 * input_cost
                    + response.completion_tokens as f64 * output_cost;

                let score = score_output(task_type, &case.expected_output, &response.content);
                case.actual_output = Some(response.content);
                case.score = Some(score);
                case.status = if score >= self.config.pass_threshold {
                    TestCaseStatus::Passed
                } else {
                    TestCaseStatus::Failed
                };
            }
            Ok(Err(e)) => {
                case.status = TestCaseStatus::Error;
                case.error_message = Some(e.to_string());
            }
            Err(_) => {
                case.status = TestCaseStatus::Error;
                case.error_message = Some("case timed out".into());
            }
        }

        debug!(
            case = %case.name,
            status = case.status.as_str(),
            score = case.score,
            "case executed"
        );
        (case, totals)
    }
}

/// Score in [0,1] for an actual output against the expectation, by task
/// shape.
pub fn score_output(task_type: TaskType, expected: &str, actual: &str) -> f64 {
    if task_type.is_discrete() {
        if normalize(expected) == normalize(actual) {
            1.0
        } else {
            0.0
        }
    } else {
        token_f1(expected, actual)
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn tokens(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Harmonic mean of token precision and recall — the similarity proxy
/// for generative outputs.
pub fn token_f1(expected: &str, actual: &str) -> f64 {
    let expected_tokens = tokens(expected);
    let actual_tokens = tokens(actual);
    if expected_tokens.is_empty() && actual_tokens.is_empty() {
        return 1.0;
    }
    if expected_tokens.is_empty() || actual_tokens.is_empty() {
        return 0.0;
    }

    let mut counts = std::collections::HashMap::new();
    for t in &expected_tokens {
        *counts.entry(t.as_str()).or_insert(0i64) += 1;
    }
    let mut overlap = 0i64;
    for t in &actual_tokens {
        if let Some(n) = counts.get_mut(t.as_str()) {
            if *n > 0 {
                *n -= 1;
                overlap += 1;
            }
        }
    }
    if overlap == 0 {
        return 0.0;
    }
    let precision = overlap as f64 / actual_tokens.len() as f64;
    let recall = overlap as f64 / expected_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlm};
    use uuid::Uuid;

    fn case(name: &str, input: &str, expected: &str) -> TestCase {
        TestCase::new(
            Uuid::new_v4(),
            name.into(),
            input.into(),
            expected.into(),
            evalforge_core::TestCategory::Normal,
        )
    }

    #[test]
    fn discrete_scoring_is_exact_match() {
        assert_eq!(score_output(TaskType::Classification, "Positive", " positive "), 1.0);
        assert_eq!(score_output(TaskType::Classification, "positive", "negative"), 0.0);
        assert_eq!(score_output(TaskType::Extraction, "42", "42"), 1.0);
    }

    #[test]
    fn generative_scoring_is_token_overlap() {
        assert_eq!(score_output(TaskType::Generation, "the cat sat", "the cat sat"), 1.0);
        assert_eq!(score_output(TaskType::Generation, "alpha beta", "gamma delta"), 0.0);
        let partial = score_output(TaskType::Summarization, "the cat sat down", "the cat stood");
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn token_f1_edge_cases() {
        assert_eq!(token_f1("", ""), 1.0);
        assert_eq!(token_f1("something", ""), 0.0);
        assert_eq!(token_f1("", "something"), 0.0);
    }

    #[tokio::test]
    async fn executes_all_cases_to_terminal_states() {
        let mock = Arc::new(MockLlm::new());
        let executor = EvalExecutor::new(mock, "m".into(), ExecutorConfig::default());
        let cancel = CancellationToken::new();

        let cases = vec![
            case("pass", "in1", "ok"),
            case("fail", "in2", "completely different expectation"),
        ];
        let (finished, totals) = executor
            .execute("You are the subject", TaskType::Generation, cases, &cancel)
            .await;

        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|c| c.status.is_terminal()));
        let passed = finished.iter().find(|c| c.name == "pass").unwrap();
        assert_eq!(passed.status, TestCaseStatus::Passed);
        assert_eq!(passed.actual_output.as_deref(), Some("ok"));
        let failed = finished.iter().find(|c| c.name == "fail").unwrap();
        assert_eq!(failed.status, TestCaseStatus::Failed);
        assert!(totals.tokens > 0);
        assert!(totals.cost > 0.0);
    }

    #[tokio::test]
    async fn llm_error_marks_case_errored() {
        let mock = Arc::new(MockLlm::new());
        mock.push_error(LlmError::NonRetryable("boom".into()));
        let executor = EvalExecutor::new(mock, "m".into(), ExecutorConfig::default());
        let cancel = CancellationToken::new();

        let (finished, _) = executor
            .execute("subject", TaskType::Generation, vec![case("e", "x", "y")], &cancel)
            .await;
        assert_eq!(finished[0].status, TestCaseStatus::Error);
        assert!(finished[0].error_message.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn cancellation_skips_cases() {
        let mock = Arc::new(MockLlm::new());
        let executor = EvalExecutor::new(mock, "m".into(), ExecutorConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (finished, totals) = executor
            .execute(
                "subject",
                TaskType::Generation,
                vec![case("a", "x", "y"), case("b", "x", "y")],
                &cancel,
            )
            .await;
        assert!(finished
            .iter()
            .all(|c| c.status == TestCaseStatus::Skipped));
        assert_eq!(totals.tokens, 0);
    }
}
