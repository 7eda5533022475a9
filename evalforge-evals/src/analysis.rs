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

//! Prompt analysis phase
//!
//! Classifies the subject prompt into a task category and sketches its
//! input/output contract, consulting the judge LLM. Any failure —
//! transport, timeout, unparseable output — falls back to `generation`
//! with reduced confidence; analysis never fails an evaluation.

use crate::llm::{extract_json, ChatMessage, CompletionRequest, LlmClient};
use evalforge_core::{PromptAnalysis, TaskType};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const ANALYSIS_PROMPT: &str = "You are analyzing a prompt that is repeatedly sent to an LLM. \
Decide which task category it belongs to, out of: classification, generation, extraction, \
summarization, question_answering, transformation, completion. \
Reply with JSON only: {\"task_type\": ..., \"input_schema\": ..., \"output_schema\": ..., \
\"constraints\": [...], \"confidence\": 0.0-1.0}";

#[derive(Deserialize)]
struct AnalysisReply {
    task_type: String,
    #[serde(default)]
    input_schema: serde_json::Value,
    #[serde(default)]
    output_schema: serde_json::Value,
    #[serde(default)]
    constraints: Vec<String>,
    #[serde(default)]
    examples: serde_json::Value,
    #[serde(default)]
    confidence: f64,
}

pub struct PromptAnalyzer {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl PromptAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    /// Never errors: the fallback analysis is `generation` at confidence
    /// 0.5.
    pub async fn analyze(
        &self,
        evaluation_id: Uuid,
        prompt_text: &str,
        timeout: Duration,
    ) -> PromptAnalysis {
        let request = CompletionRequest {
            timeout,
            ..CompletionRequest::new(
                self.model.clone(),
                vec![
                    ChatMessage::system(ANALYSIS_PROMPT),
                    ChatMessage::user(format!("Prompt under analysis:\n\n{prompt_text}")),
                ],
            )
        };

        match self.llm.complete(request).await {
            Ok(response) => match parse_reply(&response.content) {
                Some(reply) => {
                    let task_type =
                        TaskType::parse(&reply.task_type).unwrap_or(TaskType::Generation);
                    debug!(task = task_type.as_str(), "prompt analyzed");
                    PromptAnalysis {
                        id: Uuid::new_v4(),
                        evaluation_id,
                        task_type,
                        input_schema: reply.input_schema,
                        output_schema: reply.output_schema,
                        constraints: reply.constraints,
                        examples: reply.examples,
                        confidence: reply.confidence.clamp(0.0, 1.0),
                    }
                }
                None => {
                    warn!("unparseable analysis reply, defaulting to generation");
                    fallback(evaluation_id)
                }
            },
            Err(e) => {
                warn!(error = %e, "analysis call failed, defaulting to generation");
                fallback(evaluation_id)
            }
        }
    }
}

fn parse_reply(content: &str) -> Option<AnalysisReply> {
    serde_json::from_value(extract_json(content)?).ok()
}

fn fallback(evaluation_id: Uuid) -> PromptAnalysis {
    PromptAnalysis {
        id: Uuid::new_v4(),
        evaluation_id,
        task_type: TaskType::Generation,
        input_schema: serde_json::Value::Null,
        output_schema: serde_json::Value::Null,
        constraints: Vec::new(),
        examples: serde_json::Value::Null,
        confidence: 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlm};

    #[tokio::test]
    async fn parses_judge_reply() {
        let mock = Arc::new(MockLlm::new());
        mock.push_response(
            r#"{"task_type": "summarization", "constraints": ["max 3 sentences"], "confidence": 0.8}"#,
        );
        let analyzer = PromptAnalyzer::new(mock, "m".into());
        let analysis = analyzer
            .analyze(Uuid::new_v4(), "Summarize this article", Duration::from_secs(5))
            .await;
        assert_eq!(analysis.task_type, TaskType::Summarization);
        assert_eq!(analysis.constraints, vec!["max 3 sentences".to_string()]);
        assert!((analysis.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn llm_failure_defaults_to_generation() {
        let mock = Arc::new(MockLlm::new());
        mock.push_error(LlmError::Timeout);
        let analyzer = PromptAnalyzer::new(mock, "m".into());
        let analysis = analyzer
            .analyze(Uuid::new_v4(), "whatever", Duration::from_secs(5))
            .await;
        assert_eq!(analysis.task_type, TaskType::Generation);
        assert!((analysis.confidence - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn garbage_reply_defaults_to_generation() {
        let mock = Arc::new(MockLlm::new());
        mock.push_response("I cannot answer that.");
        let analyzer = PromptAnalyzer::new(mock, "m".into());
        let analysis = analyzer
            .analyze(Uuid::new_v4(), "whatever", Duration::from_secs(5))
            .await;
        assert_eq!(analysis.task_type, TaskType::Generation);
    }

    #[tokio::test]
    async fn unknown_task_type_label_degrades_gracefully() {
        let mock = Arc::new(MockLlm::new());
        mock.push_response(r#"{"task_type": "sorcery", "confidence": 0.99}"#);
        let analyzer = PromptAnalyzer::new(mock, "m".into());
        let analysis = analyzer
            .analyze(Uuid::new_v4(), "whatever", Duration::from_secs(5))
            .await;
        assert_eq!(analysis.task_type, TaskType::Generation);
    }
}
