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

//! Trace events — the atomic observability record
//!
//! One event describes one LLM call (or one step of a multi-step
//! workflow). Events are identified by `(project_id, event_id)` where the
//! event id is client-supplied so retries deduplicate at the storage
//! layer. Spans form a forest via `parent_span_id`; the tree is rebuilt at
//! read time by index lookup, child pointers are never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status of the traced operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Error => "error",
            EventStatus::Timeout => "timeout",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(EventStatus::Success),
            "error" => Some(EventStatus::Error),
            "timeout" => Some(EventStatus::Timeout),
            "cancelled" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EventStatus::Error | EventStatus::Timeout)
    }
}

/// A single trace event as submitted by an SDK and persisted in the event
/// store. Immutable after ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Client-supplied idempotency key, unique per project.
    pub event_id: String,
    pub project_id: i64,

    /// Groups all spans of one workflow.
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,

    /// Low-cardinality free-form label, e.g. `chat`, `embedding`.
    pub operation_type: String,
    pub status: EventStatus,

    /// Wall-clock bounds; both must carry an explicit UTC offset.
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Opaque payloads, size-bounded but never parsed on the hot path.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,

    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,

    /// Monetary cost in USD.
    #[serde(default)]
    pub cost: f64,

    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub error_message: Option<String>,
}

impl TraceEvent {
    /// Wall-clock duration derived from the timestamp pair.
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }

    /// Best-effort extraction of the input as prompt text. Used by the
    /// fingerprint scanner, never by ingestion.
    pub fn input_text(&self) -> Option<String> {
        input_text_of(&self.input)
    }
}

/// Prompt-text projection of an opaque input payload: a plain string, a
/// `{"prompt": ...}` field, or the last `messages[].content`.
pub fn input_text_of(input: &serde_json::Value) -> Option<String> {
    match input {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(s)) = map.get("prompt") {
                return Some(s.clone());
            }
            if let Some(serde_json::Value::Array(messages)) = map.get("messages") {
                return messages
                    .iter()
                    .rev()
                    .find_map(|m| m.get("content").and_then(|c| c.as_str()))
                    .map(String::from);
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> TraceEvent {
        TraceEvent {
            event_id: "e1".into(),
            project_id: 1,
            trace_id: "t1".into(),
            span_id: "s1".into(),
            parent_span_id: None,
            operation_type: "chat".into(),
            status: EventStatus::Success,
            start_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 2).unwrap(),
            input: serde_json::json!({"prompt": "Classify: hello"}),
            output: serde_json::json!({"text": "greeting"}),
            metadata: serde_json::Value::Null,
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost: 0.0003,
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            error_message: None,
        }
    }

    #[test]
    fn duration_from_timestamps() {
        assert_eq!(event().duration_ms(), 2000);
    }

    #[test]
    fn input_text_variants() {
        let mut e = event();
        assert_eq!(e.input_text().as_deref(), Some("Classify: hello"));

        e.input = serde_json::Value::String("raw prompt".into());
        assert_eq!(e.input_text().as_deref(), Some("raw prompt"));

        e.input = serde_json::json!({"messages": [
            {"role": "system", "content": "be terse"},
            {"role": "user", "content": "final question"}
        ]});
        assert_eq!(e.input_text().as_deref(), Some("final question"));

        e.input = serde_json::Value::Null;
        assert_eq!(e.input_text(), None);
    }

    #[test]
    fn status_round_trip() {
        for s in [
            EventStatus::Success,
            EventStatus::Error,
            EventStatus::Timeout,
            EventStatus::Cancelled,
        ] {
            assert_eq!(EventStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(EventStatus::parse("unknown"), None);
    }

    #[test]
    fn naive_timestamp_rejected_by_serde() {
        let raw = r#"{
            "event_id": "e1", "project_id": 1, "trace_id": "t", "span_id": "s",
            "operation_type": "chat", "status": "success",
            "start_time": "2025-06-01T12:00:00", "end_time": "2025-06-01T12:00:01Z"
        }"#;
        assert!(serde_json::from_str::<TraceEvent>(raw).is_err());
    }
}
