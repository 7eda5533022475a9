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

//! Per-event validation
//!
//! Invalid events are rejected individually with a stable reason code;
//! the rest of the batch proceeds. Nothing here suspends — ownership is
//! resolved by the pipeline before validation runs.

use chrono::{TimeZone, Utc};
use evalforge_core::{Error, Result, TraceEvent};
use serde::Serialize;

/// Maximum events per ingest call.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Per-payload-field bound (`input`, `output`, `metadata`).
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Whole-event serialized bound.
pub const MAX_EVENT_BYTES: usize = 128 * 1024;

/// Accepted clock skew into the future.
pub const MAX_FUTURE_DRIFT_SECS: i64 = 300;

/// Stable, machine-readable rejection reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingField(&'static str),
    EndBeforeStart,
    PayloadTooLarge(&'static str),
    EventTooLarge,
    TokenCountMismatch,
    ProjectMismatch,
    TimestampOutOfRange,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::MissingField(_) => "missing_field",
            RejectReason::EndBeforeStart => "end_before_start",
            RejectReason::PayloadTooLarge(_) => "payload_too_large",
            RejectReason::EventTooLarge => "event_too_large",
            RejectReason::TokenCountMismatch => "token_count_mismatch",
            RejectReason::ProjectMismatch => "project_mismatch",
            RejectReason::TimestampOutOfRange => "timestamp_out_of_range",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingField(field) => write!(f, "missing_field:{field}"),
            RejectReason::PayloadTooLarge(field) => write!(f, "payload_too_large:{field}"),
            other => f.write_str(other.code()),
        }
    }
}

/// One rejected index in an otherwise-accepted batch.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedEvent {
    pub index: usize,
    pub reason: String,
}

pub fn validate_batch_size(count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::Validation("empty event batch".into()));
    }
    if count > MAX_BATCH_SIZE {
        return Err(Error::Validation(format!(
            "batch of {count} events exceeds the {MAX_BATCH_SIZE}-event limit"
        )));
    }
    Ok(())
}

/// Validate one event against the authenticated project. Size checks use
/// serialized JSON lengths, matching what the store persists.
pub fn validate_event(
    event: &TraceEvent,
    authenticated_project: i64,
) -> std::result::Result<(), RejectReason> {
    if event.event_id.is_empty() {
        return Err(RejectReason::MissingField("event_id"));
    }
    if event.trace_id.is_empty() {
        return Err(RejectReason::MissingField("trace_id"));
    }
    if event.span_id.is_empty() {
        return Err(RejectReason::MissingField("span_id"));
    }
    if event.operation_type.is_empty() {
        return Err(RejectReason::MissingField("operation_type"));
    }

    if event.project_id != authenticated_project {
        return Err(RejectReason::ProjectMismatch);
    }

    if event.end_time < event.start_time {
        return Err(RejectReason::EndBeforeStart);
    }

    let earliest = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let latest = Utc::now() + chrono::Duration::seconds(MAX_FUTURE_DRIFT_SECS);
    if event.start_time < earliest || event.start_time > latest {
        return Err(RejectReason::TimestampOutOfRange);
    }

    // Off-by-one slack for providers that round the total independently.
    let component_sum = event.prompt_tokens as i64 + event.completion_tokens as i64;
    if (event.total_tokens as i64) < component_sum - 1 {
        return Err(RejectReason::TokenCountMismatch);
    }

    for (field, value) in [
        ("input", &event.input),
        ("output", &event.output),
        ("metadata", &event.metadata),
    ] {
        if payload_len(value) > MAX_PAYLOAD_BYTES {
            return Err(RejectReason::PayloadTooLarge(field));
        }
    }

    let total_len = serde_json::to_vec(event).map(|v| v.len()).unwrap_or(usize::MAX);
    if total_len > MAX_EVENT_BYTES {
        return Err(RejectReason::EventTooLarge);
    }

    Ok(())
}

fn payload_len(value: &serde_json::Value) -> usize {
    if value.is_null() {
        return 0;
    }
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evalforge_core::EventStatus;

    fn event() -> TraceEvent {
        TraceEvent {
            event_id: "e1".into(),
            project_id: 1,
            trace_id: "t1".into(),
            span_id: "s1".into(),
            parent_span_id: None,
            operation_type: "chat".into(),
            status: EventStatus::Success,
            start_time: Utc::now() - chrono::Duration::seconds(5),
            end_time: Utc::now() - chrono::Duration::seconds(4),
            input: serde_json::json!({"prompt": "hi"}),
            output: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            prompt_tokens: 10,
            completion_tokens: 10,
            total_tokens: 20,
            cost: 0.0,
            provider: "openai".into(),
            model: "gpt-4o".into(),
            error_message: None,
        }
    }

    #[test]
    fn batch_size_bounds() {
        assert!(validate_batch_size(0).is_err());
        assert!(validate_batch_size(1).is_ok());
        assert!(validate_batch_size(MAX_BATCH_SIZE).is_ok());
        assert!(validate_batch_size(MAX_BATCH_SIZE + 1).is_err());
    }

    #[test]
    fn valid_event_passes() {
        assert!(validate_event(&event(), 1).is_ok());
    }

    #[test]
    fn end_before_start_rejected() {
        let mut e = event();
        e.end_time = e.start_time - chrono::Duration::seconds(1);
        assert_eq!(validate_event(&e, 1), Err(RejectReason::EndBeforeStart));
        assert_eq!(RejectReason::EndBeforeStart.code(), "end_before_start");
    }

    #[test]
    fn foreign_project_rejected() {
        assert_eq!(validate_event(&event(), 2), Err(RejectReason::ProjectMismatch));
    }

    #[test]
    fn missing_fields_rejected() {
        let mut e = event();
        e.event_id = String::new();
        assert_eq!(
            validate_event(&e, 1),
            Err(RejectReason::MissingField("event_id"))
        );

        let mut e = event();
        e.operation_type = String::new();
        assert_eq!(
            validate_event(&e, 1),
            Err(RejectReason::MissingField("operation_type"))
        );
    }

    #[test]
    fn token_invariant_allows_off_by_one() {
        let mut e = event();
        e.prompt_tokens = 10;
        e.completion_tokens = 10;
        e.total_tokens = 19; // one short is tolerated
        assert!(validate_event(&e, 1).is_ok());

        e.total_tokens = 18;
        assert_eq!(validate_event(&e, 1), Err(RejectReason::TokenCountMismatch));
    }

    #[test]
    fn payload_size_boundary() {
        let mut e = event();
        // A JSON string serializes with two quote bytes.
        e.input = serde_json::Value::String("x".repeat(MAX_PAYLOAD_BYTES - 2));
        assert!(validate_event(&e, 1).is_ok());

        e.input = serde_json::Value::String("x".repeat(MAX_PAYLOAD_BYTES - 1));
        assert_eq!(
            validate_event(&e, 1),
            Err(RejectReason::PayloadTooLarge("input"))
        );
    }

    #[test]
    fn whole_event_size_boundary() {
        let mut e = event();
        let base_len = serde_json::to_vec(&e).unwrap().len();
        // Grow metadata so the full event crosses the 128 KiB line while
        // each payload field stays under its own bound.
        let mut filler = MAX_EVENT_BYTES - base_len + 10;
        if filler > MAX_PAYLOAD_BYTES - 2 {
            e.output = serde_json::Value::String("y".repeat(MAX_PAYLOAD_BYTES - 2));
            filler = filler.saturating_sub(MAX_PAYLOAD_BYTES);
        }
        e.metadata = serde_json::Value::String("z".repeat(filler));
        assert_eq!(validate_event(&e, 1), Err(RejectReason::EventTooLarge));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let mut e = event();
        e.start_time = Utc.with_ymd_and_hms(2019, 12, 31, 23, 59, 59).unwrap();
        e.end_time = e.start_time + chrono::Duration::seconds(1);
        assert_eq!(validate_event(&e, 1), Err(RejectReason::TimestampOutOfRange));
    }
}
