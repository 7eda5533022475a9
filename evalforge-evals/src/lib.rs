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

//! Auto-evaluation loop
//!
//! A background scanner detects prompt fingerprints that recur often
//! enough to deserve a test suite, then the orchestrator drives each
//! evaluation through analysis → test generation → execution → scoring →
//! suggestion, with an external LLM as judge and generator. Evaluation
//! failures terminate the evaluation, never the ingest path.

pub mod analysis;
pub mod calculator;
pub mod executor;
pub mod generator;
pub mod llm;
pub mod orchestrator;
pub mod store;
pub mod suggester;

pub use analysis::PromptAnalyzer;
pub use calculator::{calculate_metrics, ExecutionTotals};
pub use executor::{EvalExecutor, ExecutorConfig};
pub use generator::{GeneratorConfig, TestGenerator};
pub use llm::{
    extract_json, ChatMessage, CircuitBreaker, CircuitBreakerConfig, CompletionRequest,
    CompletionResponse, LlmClient, LlmError, MockLlm, OpenAiClient,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use store::{EvalStore, MemoryEvalStore};
pub use suggester::Suggester;
