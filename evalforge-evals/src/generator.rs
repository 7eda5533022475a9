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

//! Test-suite generation phase
//!
//! Asks the generator LLM for a mixed suite — mostly representative
//! inputs, a few boundary cases, a few adversarial ones — as a JSON
//! array. Unlike analysis, a generation failure fails the evaluation:
//! there is nothing to execute without a suite.

use crate::llm::{extract_json, ChatMessage, CompletionRequest, LlmClient};
use evalforge_core::{Error, PromptAnalysis, Result, TestCase, TestCategory};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub normal_cases: usize,
    pub edge_cases: usize,
    pub adversarial_cases: usize,
    /// Attempts against retryable LLM failures.
    pub max_attempts: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            normal_cases: 20,
            edge_cases: 5,
            adversarial_cases: 3,
            max_attempts: 3,
        }
    }
}

#[derive(Deserialize)]
struct GeneratedCase {
    name: String,
    input: String,
    expected_output: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    weight: Option<f64>,
}

pub struct TestGenerator {
    llm: Arc<dyn LlmClient>,
    model: String,
    config: GeneratorConfig,
}

impl TestGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, model: String, config: GeneratorConfig) -> Self {
        Self { llm, model, config }
    }

    pub async fn generate(
        &self,
        evaluation_id: Uuid,
        prompt_text: &str,
        analysis: &PromptAnalysis,
        timeout: Duration,
    ) -> Result<Vec<TestCase>> {
        let total =
            self.config.normal_cases + self.config.edge_cases + self.config.adversarial_cases;
        let system = format!(
            "You design test suites for LLM prompts. Produce test cases as a JSON array, \
             nothing else. Each element: {{\"name\", \"input\", \"expected_output\", \
             \"category\"}} where category is one of normal, edge_case, adversarial. \
             Produce {total} cases: {} normal, {} edge_case, {} adversarial. \
             The prompt performs a {} task.",
            self.config.normal_cases,
            self.config.edge_cases,
            self.config.adversarial_cases,
            analysis.task_type.as_str(),
        );
        let user = format!(
            "Prompt under test:\n\n{prompt_text}\n\nConstraints noted during analysis: {}",
            if analysis.constraints.is_empty() {
                "none".to_string()
            } else {
                analysis.constraints.join("; ")
            }
        );

        let mut last_error = Error::Unavailable("test generator produced nothing".into());
        for attempt in 1..=self.config.max_attempts {
            let request = CompletionRequest {
                timeout,
                temperature: 0.7,
                ..CompletionRequest::new(
                    self.model.clone(),
                    vec![
                        ChatMessage::system(system.clone()),
                        ChatMessage::user(user.clone()),
                    ],
                )
            };

            match self.llm.complete(request).await {
                Ok(response) => match parse_cases(evaluation_id, &response.content) {
                    Some(cases) if !cases.is_empty() => {
                        debug!(cases = cases.len(), attempt, "test suite generated");
                        return Ok(cases);
                    }
                    _ => {
                        warn!(attempt, "generator reply had no usable cases");
                        last_error =
                            Error::Unavailable("generator reply had no usable cases".into());
                    }
                },
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(attempt, error = %e, "generator call failed, retrying");
                    last_error = Error::Unavailable(e.to_string());
                }
                Err(e) => {
                    return Err(Error::Unavailable(format!("test generation failed: {e}")));
                }
            }
        }
        Err(last_error)
    }
}

fn parse_cases(evaluation_id: Uuid, content: &str) -> Option<Vec<TestCase>> {
    let value = extract_json(content)?;
    let raw: Vec<GeneratedCase> = serde_json::from_value(value).ok()?;
    Some(
        raw.into_iter()
            .filter(|c| !c.input.is_empty() || !c.expected_output.is_empty())
            .map(|c| {
                let category = c
                    .category
                    .as_deref()
                    .and_then(TestCategory::parse)
                    .unwrap_or(TestCategory::Normal);
                let mut case =
                    TestCase::new(evaluation_id, c.name, c.input, c.expected_output, category);
                if let Some(weight) = c.weight {
                    case.weight = weight.clamp(0.0, 10.0);
                }
                case
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlm};
    use evalforge_core::{TaskType, TestCaseStatus};

    fn analysis(evaluation_id: Uuid) -> PromptAnalysis {
        PromptAnalysis {
            id: Uuid::new_v4(),
            evaluation_id,
            task_type: TaskType::Classification,
            input_schema: serde_json::Value::Null,
            output_schema: serde_json::Value::Null,
            constraints: vec!["one word".into()],
            examples: serde_json::Value::Null,
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn parses_generated_suite() {
        let mock = Arc::new(MockLlm::new());
        mock.push_response(
            r#"[
                {"name": "a", "input": "x", "expected_output": "yes", "category": "normal"},
                {"name": "b", "input": "", "expected_output": "no", "category": "edge_case"},
                {"name": "c", "input": "z", "expected_output": "yes", "category": "adversarial", "weight": 2.0}
            ]"#,
        );
        let eval_id = Uuid::new_v4();
        let generator = TestGenerator::new(mock, "m".into(), GeneratorConfig::default());
        let cases = generator
            .generate(eval_id, "Classify: {}", &analysis(eval_id), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(cases.len(), 3);
        assert!(cases.iter().all(|c| c.status == TestCaseStatus::Pending));
        assert!(cases.iter().all(|c| c.evaluation_id == eval_id));
        assert_eq!(cases[2].category, TestCategory::Adversarial);
        assert!((cases[2].weight - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_category_defaults_to_normal() {
        let mock = Arc::new(MockLlm::new());
        mock.push_response(
            r#"[{"name": "a", "input": "x", "expected_output": "y", "category": "weird"}]"#,
        );
        let eval_id = Uuid::new_v4();
        let generator = TestGenerator::new(mock, "m".into(), GeneratorConfig::default());
        let cases = generator
            .generate(eval_id, "p", &analysis(eval_id), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cases[0].category, TestCategory::Normal);
    }

    #[tokio::test]
    async fn retries_then_fails_terminally() {
        let mock = Arc::new(MockLlm::new());
        mock.push_error(LlmError::Retryable("hiccup".into()));
        mock.push_response(r#"[{"name": "a", "input": "x", "expected_output": "y"}]"#);
        let eval_id = Uuid::new_v4();
        let generator = TestGenerator::new(
            mock.clone(),
            "m".into(),
            GeneratorConfig {
                max_attempts: 3,
                ..Default::default()
            },
        );
        let cases = generator
            .generate(eval_id, "p", &analysis(eval_id), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(mock.call_count(), 2);

        // Non-retryable error surfaces immediately.
        let mock = Arc::new(MockLlm::new());
        mock.push_error(LlmError::NonRetryable("bad request".into()));
        let generator = TestGenerator::new(mock, "m".into(), GeneratorConfig::default());
        assert!(generator
            .generate(eval_id, "p", &analysis(eval_id), Duration::from_secs(5))
            .await
            .is_err());
    }
}
