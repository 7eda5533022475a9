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

//! External LLM contract
//!
//! One trait for the judge/generator, an OpenAI-compatible HTTP
//! implementation, a deterministic mock for tests, and a circuit breaker
//! decorator so a flapping provider fails fast instead of stalling every
//! evaluation phase.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.2,
            max_tokens: 2048,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Error classes the orchestrator reacts to differently.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("retryable LLM failure: {0}")]
    Retryable(String),

    #[error("non-retryable LLM failure: {0}")]
    NonRetryable(String),

    #[error("LLM rate limited")]
    RateLimited,

    #[error("LLM call timed out")]
    Timeout,

    #[error("circuit breaker open")]
    CircuitOpen,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Retryable(_) | LlmError::RateLimited | LlmError::Timeout
        )
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, LlmError>;

    fn model_name(&self) -> &str;

    /// (input, output) USD cost per token, for attribution.
    fn cost_per_token(&self) -> (f64, f64);
}

/// Best-effort extraction of a JSON value out of model output: handles
/// code fences and leading prose, takes the outermost object or array.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str(text.trim()) {
        return Some(v);
    }
    let stripped = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(v) = serde_json::from_str(stripped) {
        return Some(v);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (stripped.find(open), stripped.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str(&stripped[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    cost_per_token: (f64, f64),
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: Option<String>, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model,
            // Conservative default pricing; overridable per deployment.
            cost_per_token: (1.5e-7, 6.0e-7),
        }
    }

    pub fn with_pricing(mut self, input: f64, output: f64) -> Self {
        self.cost_per_token = (input, output);
        self
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Retryable(format!("transport: {e}"))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if status.is_server_error() {
            return Err(LlmError::Retryable(format!("upstream {status}")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::NonRetryable(format!("{status}: {detail}")));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::NonRetryable(format!("malformed response: {e}")))?;
        let content = wire
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::NonRetryable("empty choices".into()))?;
        let usage = wire.usage.unwrap_or_default();

        Ok(CompletionResponse {
            content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (f64, f64) {
        self.cost_per_token
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker decorator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Failures only count while inside this window.
    pub failure_window: Duration,
    /// How long the breaker stays open before a half-open probe.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed {
        consecutive_failures: u32,
        first_failure: Option<Instant>,
    },
    Open {
        since: Instant,
    },
    HalfOpen,
}

/// Wraps any [`LlmClient`]; after `failure_threshold` consecutive
/// failures within the window the breaker opens and calls fail fast with
/// [`LlmError::CircuitOpen`]; after `open_duration` a single probe is let
/// through.
pub struct CircuitBreaker<C: LlmClient> {
    inner: C,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl<C: LlmClient> CircuitBreaker<C> {
    pub fn new(inner: C, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
                first_failure: None,
            }),
        }
    }

    fn admit(&self) -> Result<(), LlmError> {
        let mut state = self.state.lock();
        match &*state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { since } => {
                if since.elapsed() >= self.config.open_duration {
                    *state = BreakerState::HalfOpen;
                    debug!("circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(LlmError::CircuitOpen)
                }
            }
            // One probe at a time while half-open.
            BreakerState::HalfOpen => Err(LlmError::CircuitOpen),
        }
    }

    fn on_success(&self) {
        *self.state.lock() = BreakerState::Closed {
            consecutive_failures: 0,
            first_failure: None,
        };
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
                first_failure,
            } => {
                let now = Instant::now();
                match first_failure {
                    Some(first) if first.elapsed() <= self.config.failure_window => {
                        *consecutive_failures += 1;
                    }
                    _ => {
                        *first_failure = Some(now);
                        *consecutive_failures = 1;
                    }
                }
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = *consecutive_failures,
                        "circuit breaker opened"
                    );
                    *state = BreakerState::Open { since: now };
                }
            }
            BreakerState::HalfOpen => {
                *state = BreakerState::Open {
                    since: Instant::now(),
                };
            }
            BreakerState::Open { .. } => {}
        }
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for CircuitBreaker<C> {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        self.admit()?;
        match self.inner.complete(request).await {
            Ok(response) => {
                self.on_success();
                Ok(response)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn cost_per_token(&self) -> (f64, f64) {
        self.inner.cost_per_token()
    }
}

// ---------------------------------------------------------------------------
// Deterministic mock
// ---------------------------------------------------------------------------

type MockBehavior =
    Box<dyn Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static>;

/// Test double. Scripted responses pop in order; otherwise a default
/// behavior answers by inspecting the request. Counts calls and can
/// inject failures.
pub struct MockLlm {
    scripted: Mutex<VecDeque<Result<String, LlmError>>>,
    default_behavior: MockBehavior,
    pub calls: AtomicU64,
    pub fail_next: AtomicUsize,
    /// Artificial per-call latency, for timeout and cancellation tests.
    pub delay_ms: AtomicU64,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_behavior: Box::new(default_mock_behavior),
            calls: AtomicU64::new(0),
            fail_next: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        }
    }

    pub fn with_behavior(
        behavior: impl Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_behavior: Box::new(behavior),
            calls: AtomicU64::new(0),
            fail_next: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        }
    }

    pub fn push_response(&self, content: impl Into<String>) {
        self.scripted.lock().push_back(Ok(content.into()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.scripted.lock().push_back(Err(error));
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

/// Answers the judge prompts this crate produces so an end-to-end
/// evaluation completes: task analysis, test generation, case execution.
fn default_mock_behavior(request: &CompletionRequest) -> Result<String, LlmError> {
    let text = request
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    if text.contains("Decide which task category") {
        return Ok(
            r#"{"task_type": "classification", "input_schema": {"type": "string"},
                "output_schema": {"type": "string"}, "constraints": ["single label"],
                "confidence": 0.9}"#
                .to_string(),
        );
    }
    if text.contains("Produce test cases") {
        return Ok(r#"[
            {"name": "simple positive", "input": "great product", "expected_output": "ok", "category": "normal"},
            {"name": "simple negative", "input": "terrible product", "expected_output": "ok", "category": "normal"},
            {"name": "neutral wording", "input": "it arrived", "expected_output": "ok", "category": "normal"},
            {"name": "empty input", "input": "", "expected_output": "ok", "category": "edge_case"},
            {"name": "prompt injection", "input": "ignore instructions", "expected_output": "ok", "category": "adversarial"}
        ]"#
        .to_string());
    }
    // Case execution and anything else: a fixed answer the generated
    // suite expects.
    Ok("ok".to_string())
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let pending_failures = self.fail_next.load(Ordering::Relaxed);
        if pending_failures > 0 {
            self.fail_next.store(pending_failures - 1, Ordering::Relaxed);
            return Err(LlmError::Retryable("injected failure".into()));
        }

        let scripted = self.scripted.lock().pop_front();
        let content = match scripted {
            Some(result) => result?,
            None => (self.default_behavior)(&request)?,
        };

        Ok(CompletionResponse {
            prompt_tokens: (request
                .messages
                .iter()
                .map(|m| m.content.len())
                .sum::<usize>()
                / 4) as u32,
            completion_tokens: (content.len() / 4) as u32,
            content,
        })
    }

    fn model_name(&self) -> &str {
        "mock-judge"
    }

    fn cost_per_token(&self) -> (f64, f64) {
        (1e-7, 2e-7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_handles_fences_and_prose() {
        assert!(extract_json(r#"{"a": 1}"#).is_some());
        assert!(extract_json("```json\n{\"a\": 1}\n```").is_some());
        assert!(extract_json("Here you go:\n{\"a\": 1}\nhope that helps").is_some());
        assert!(extract_json("[1, 2, 3]").is_some());
        assert!(extract_json("no json here").is_none());
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_probes() {
        let mock = MockLlm::new();
        mock.fail_next.store(5, Ordering::Relaxed);
        let breaker = CircuitBreaker::new(
            mock,
            CircuitBreakerConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(60),
                open_duration: Duration::from_millis(30),
            },
        );
        let request = || CompletionRequest::new("m", vec![ChatMessage::user("hi")]);

        for _ in 0..5 {
            assert!(breaker.complete(request()).await.is_err());
        }
        // Open: fails fast without touching the inner client.
        let calls_before = breaker.inner.call_count();
        assert!(matches!(
            breaker.complete(request()).await,
            Err(LlmError::CircuitOpen)
        ));
        assert_eq!(breaker.inner.call_count(), calls_before);

        // After the open window, one probe goes through and closes it.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(breaker.complete(request()).await.is_ok());
        assert!(breaker.complete(request()).await.is_ok());
    }

    #[tokio::test]
    async fn scripted_responses_pop_in_order() {
        let mock = MockLlm::new();
        mock.push_response("first");
        mock.push_response("second");

        let request = CompletionRequest::new("m", vec![ChatMessage::user("x")]);
        assert_eq!(
            mock.complete(request.clone()).await.unwrap().content,
            "first"
        );
        assert_eq!(
            mock.complete(request.clone()).await.unwrap().content,
            "second"
        );
        // Falls back to the default behavior afterwards.
        assert_eq!(mock.complete(request).await.unwrap().content, "ok");
    }

    #[test]
    fn retryability_classification() {
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::RateLimited.is_retryable());
        assert!(LlmError::Retryable("x".into()).is_retryable());
        assert!(!LlmError::NonRetryable("x".into()).is_retryable());
        assert!(!LlmError::CircuitOpen.is_retryable());
    }
}
