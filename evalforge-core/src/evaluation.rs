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

//! Evaluation entities and their state machines
//!
//! One `Evaluation` is a full pass of the auto-eval loop over one prompt
//! fingerprint: analysis → test generation → execution → scoring →
//! suggestion. Terminal states are immutable and `progress` only moves
//! forward (except on explicit cancel).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl EvaluationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvaluationStatus::Completed | EvaluationStatus::Failed | EvaluationStatus::Cancelled
        )
    }

    /// Legal transitions. Terminal states accept nothing.
    pub fn can_transition(&self, to: EvaluationStatus) -> bool {
        use EvaluationStatus::*;
        match (self, to) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Running => "running",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Failed => "failed",
            EvaluationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EvaluationStatus::Pending),
            "running" => Some(EvaluationStatus::Running),
            "completed" => Some(EvaluationStatus::Completed),
            "failed" => Some(EvaluationStatus::Failed),
            "cancelled" => Some(EvaluationStatus::Cancelled),
            _ => None,
        }
    }
}

/// Substates of `Running`, advancing strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalPhase {
    Analyzing,
    Generating,
    Executing,
    Scoring,
    Suggesting,
}

impl EvalPhase {
    /// Progress percentage reported when the phase begins.
    pub fn progress_floor(&self) -> u8 {
        match self {
            EvalPhase::Analyzing => 5,
            EvalPhase::Generating => 20,
            EvalPhase::Executing => 40,
            EvalPhase::Scoring => 80,
            EvalPhase::Suggesting => 90,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalPhase::Analyzing => "analyzing",
            EvalPhase::Generating => "generating",
            EvalPhase::Executing => "executing",
            EvalPhase::Scoring => "scoring",
            EvalPhase::Suggesting => "suggesting",
        }
    }
}

/// What kind of work the subject prompt performs. Drives test generation
/// and the choice of comparator and metric surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Classification,
    Generation,
    Extraction,
    Summarization,
    QuestionAnswering,
    Transformation,
    Completion,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Classification => "classification",
            TaskType::Generation => "generation",
            TaskType::Extraction => "extraction",
            TaskType::Summarization => "summarization",
            TaskType::QuestionAnswering => "question_answering",
            TaskType::Transformation => "transformation",
            TaskType::Completion => "completion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "classification" => Some(TaskType::Classification),
            "generation" => Some(TaskType::Generation),
            "extraction" => Some(TaskType::Extraction),
            "summarization" => Some(TaskType::Summarization),
            "question_answering" => Some(TaskType::QuestionAnswering),
            "transformation" => Some(TaskType::Transformation),
            "completion" => Some(TaskType::Completion),
            _ => None,
        }
    }

    /// Whether outputs are compared exactly (label match) rather than by
    /// textual similarity.
    pub fn is_discrete(&self) -> bool {
        matches!(self, TaskType::Classification | TaskType::Extraction)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub project_id: i64,
    /// Hex fingerprint of the recurring prompt this evaluation targets.
    pub fingerprint: String,
    pub name: String,
    pub prompt_text: String,
    pub status: EvaluationStatus,
    /// 0..=100, monotone non-decreasing while non-terminal.
    pub progress: u8,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Evaluation {
    pub fn new(project_id: i64, fingerprint: String, name: String, prompt_text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            fingerprint,
            name,
            prompt_text,
            status: EvaluationStatus::Pending,
            progress: 0,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Structured understanding of the subject prompt, produced by the
/// analysis phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptAnalysis {
    pub id: Uuid,
    pub evaluation_id: Uuid,
    pub task_type: TaskType,
    #[serde(default)]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub output_schema: serde_json::Value,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub examples: serde_json::Value,
    /// Classifier confidence in [0,1]; 0.5 when the heuristic fallback
    /// decided.
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    Normal,
    EdgeCase,
    Adversarial,
}

impl TestCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestCategory::Normal => "normal",
            TestCategory::EdgeCase => "edge_case",
            TestCategory::Adversarial => "adversarial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(TestCategory::Normal),
            "edge_case" => Some(TestCategory::EdgeCase),
            "adversarial" => Some(TestCategory::Adversarial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TestCaseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TestCaseStatus::Pending | TestCaseStatus::Running)
    }

    pub fn can_transition(&self, to: TestCaseStatus) -> bool {
        use TestCaseStatus::*;
        match (self, to) {
            (Pending, Running) | (Pending, Skipped) => true,
            (Running, Passed) | (Running, Failed) | (Running, Error) | (Running, Skipped) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestCaseStatus::Pending => "pending",
            TestCaseStatus::Running => "running",
            TestCaseStatus::Passed => "passed",
            TestCaseStatus::Failed => "failed",
            TestCaseStatus::Error => "error",
            TestCaseStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TestCaseStatus::Pending),
            "running" => Some(TestCaseStatus::Running),
            "passed" => Some(TestCaseStatus::Passed),
            "failed" => Some(TestCaseStatus::Failed),
            "error" => Some(TestCaseStatus::Error),
            "skipped" => Some(TestCaseStatus::Skipped),
            _ => None,
        }
    }
}

/// One input/expected-output pair executed against the subject prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub evaluation_id: Uuid,
    pub name: String,
    pub input: String,
    pub expected_output: String,
    pub category: TestCategory,
    /// Relative weight in aggregate scoring; defaults to 1.0.
    pub weight: f64,
    pub status: TestCaseStatus,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub actual_output: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
}

impl TestCase {
    pub fn new(
        evaluation_id: Uuid,
        name: String,
        input: String,
        expected_output: String,
        category: TestCategory,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            evaluation_id,
            name,
            input,
            expected_output,
            category,
            weight: 1.0,
            status: TestCaseStatus::Pending,
            score: None,
            actual_output: None,
            execution_time_ms: None,
            error_message: None,
            executed_at: None,
        }
    }
}

/// Aggregate metrics for one completed evaluation, persisted exactly once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub evaluation_id: Uuid,
    pub overall_score: f64,
    pub pass_rate: f64,
    pub total_cases: u32,
    pub passed_cases: u32,
    pub failed_cases: u32,
    pub error_cases: u32,
    pub skipped_cases: u32,

    // Classification surface.
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub macro_f1: Option<f64>,
    #[serde(default)]
    pub weighted_f1: Option<f64>,
    /// Per-class precision/recall/F1/support, keyed by class label.
    #[serde(default)]
    pub per_class: serde_json::Value,

    // Generation surface.
    #[serde(default)]
    pub bleu: Option<f64>,
    #[serde(default)]
    pub rouge1: Option<f64>,
    #[serde(default)]
    pub rouge2: Option<f64>,
    #[serde(default)]
    pub rouge_l: Option<f64>,

    /// Judge tokens and cost attributed to this evaluation.
    pub total_tokens: u64,
    pub total_cost: f64,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_status_machine() {
        use EvaluationStatus::*;
        assert!(Pending.can_transition(Running));
        assert!(Pending.can_transition(Cancelled));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Cancelled));

        assert!(!Pending.can_transition(Completed));
        assert!(!Completed.can_transition(Running));
        assert!(!Failed.can_transition(Running));
        assert!(!Cancelled.can_transition(Pending));
    }

    #[test]
    fn test_case_status_machine() {
        use TestCaseStatus::*;
        assert!(Pending.can_transition(Running));
        assert!(Pending.can_transition(Skipped));
        assert!(Running.can_transition(Passed));
        assert!(Running.can_transition(Skipped));

        assert!(!Passed.can_transition(Running));
        assert!(!Skipped.can_transition(Running));
        assert!(!Pending.can_transition(Passed));
    }

    #[test]
    fn phases_are_ordered() {
        let phases = [
            EvalPhase::Analyzing,
            EvalPhase::Generating,
            EvalPhase::Executing,
            EvalPhase::Scoring,
            EvalPhase::Suggesting,
        ];
        for pair in phases.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].progress_floor() < pair[1].progress_floor());
        }
    }

    #[test]
    fn task_type_round_trip() {
        for t in [
            TaskType::Classification,
            TaskType::Generation,
            TaskType::Extraction,
            TaskType::Summarization,
            TaskType::QuestionAnswering,
            TaskType::Transformation,
            TaskType::Completion,
        ] {
            assert_eq!(TaskType::parse(t.as_str()), Some(t));
        }
    }
}
