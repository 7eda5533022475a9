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

//! Event and trace listing
//!
//! Cursor-paginated event queries and trace views. The span tree is
//! rebuilt per request from `parent_span_id` by index lookup; the store
//! never holds child pointers.

use crate::api::{projects::owned_project, ApiError};
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use evalforge_core::{EventStatus, TraceEvent};
use evalforge_storage::{EventFilter, EventPage, TimeRange, TraceSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct EventQueryParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub operation_type: Option<String>,
    pub status: Option<String>,
    pub model: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<u64>,
}

impl EventQueryParams {
    fn into_filter(self) -> Result<EventFilter, ApiError> {
        let status = match self.status.as_deref() {
            None => None,
            Some(raw) => Some(EventStatus::parse(raw).ok_or_else(|| {
                evalforge_core::Error::Validation(format!("unknown status '{raw}'"))
            })?),
        };
        Ok(EventFilter {
            range: TimeRange {
                start: self.start,
                end: self.end,
            },
            operation_type: self.operation_type,
            status,
            model: self.model,
            cursor: self.cursor,
            limit: self.limit,
        })
    }
}

/// GET /api/v1/projects/:project_id/events
pub async fn list_events(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Query(params): Query<EventQueryParams>,
) -> Result<Json<EventPage>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let filter = params.into_filter()?;
    Ok(Json(state.events.query_events(project_id, &filter).await?))
}

#[derive(Debug, Deserialize)]
pub struct TraceQueryParams {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

/// GET /api/v1/projects/:project_id/traces
pub async fn list_traces(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(project_id): Path<i64>,
    Query(params): Query<TraceQueryParams>,
) -> Result<Json<Vec<TraceSummary>>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let range = TimeRange {
        start: params.start,
        end: params.end,
    };
    Ok(Json(
        state
            .events
            .list_traces(project_id, range, params.limit.unwrap_or(100))
            .await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct SpanNode {
    #[serde(flatten)]
    pub event: TraceEvent,
    pub children: Vec<SpanNode>,
}

#[derive(Debug, Serialize)]
pub struct TraceDetail {
    pub trace_id: String,
    pub span_count: usize,
    pub roots: Vec<SpanNode>,
}

/// GET /api/v1/projects/:project_id/traces/:trace_id
pub async fn get_trace(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path((project_id, trace_id)): Path<(i64, String)>,
) -> Result<Json<TraceDetail>, ApiError> {
    owned_project(&state, &auth, project_id).await?;
    let events = state.events.trace_events(project_id, &trace_id).await?;
    if events.is_empty() {
        return Err(evalforge_core::Error::NotFound(format!("trace {trace_id}")).into());
    }
    let span_count = events.len();
    Ok(Json(TraceDetail {
        trace_id,
        span_count,
        roots: build_span_forest(events),
    }))
}

/// Assemble the span forest. A span whose parent is absent from the
/// trace (dropped or not yet ingested) is treated as a root rather than
/// lost.
fn build_span_forest(events: Vec<TraceEvent>) -> Vec<SpanNode> {
    let present: HashMap<String, usize> = events
        .iter()
        .enumerate()
        .map(|(i, e)| (e.span_id.clone(), i))
        .collect();

    let mut children_of: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut roots: Vec<usize> = Vec::new();
    for (index, event) in events.iter().enumerate() {
        match event
            .parent_span_id
            .as_ref()
            .and_then(|p| present.get(p))
            .copied()
        {
            // Self-referential parents count as roots too.
            Some(parent) if parent != index => {
                children_of.entry(parent).or_default().push(index)
            }
            _ => roots.push(index),
        }
    }

    fn assemble(
        index: usize,
        events: &[TraceEvent],
        children_of: &HashMap<usize, Vec<usize>>,
    ) -> SpanNode {
        let children = children_of
            .get(&index)
            .map(|ids| {
                ids.iter()
                    .map(|&child| assemble(child, events, children_of))
                    .collect()
            })
            .unwrap_or_default();
        SpanNode {
            event: events[index].clone(),
            children,
        }
    }

    roots
        .into_iter()
        .map(|index| assemble(index, &events, &children_of))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn span(span_id: &str, parent: Option<&str>) -> TraceEvent {
        TraceEvent {
            event_id: format!("e-{span_id}"),
            project_id: 1,
            trace_id: "t1".into(),
            span_id: span_id.into(),
            parent_span_id: parent.map(String::from),
            operation_type: "chat".into(),
            status: EventStatus::Success,
            start_time: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 1).unwrap(),
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            provider: String::new(),
            model: String::new(),
            error_message: None,
        }
    }

    #[test]
    fn forest_assembly() {
        // root -> (a -> a1, b)
        let events = vec![
            span("root", None),
            span("a", Some("root")),
            span("a1", Some("a")),
            span("b", Some("root")),
        ];
        let forest = build_span_forest(events);
        assert_eq!(forest.len(), 1);
        let root = &forest[0];
        assert_eq!(root.event.span_id, "root");
        assert_eq!(root.children.len(), 2);
        let a = root
            .children
            .iter()
            .find(|n| n.event.span_id == "a")
            .unwrap();
        assert_eq!(a.children.len(), 1);
        assert_eq!(a.children[0].event.span_id, "a1");
    }

    #[test]
    fn orphan_spans_become_roots() {
        let events = vec![span("a", Some("missing")), span("b", None)];
        let forest = build_span_forest(events);
        assert_eq!(forest.len(), 2);
    }

    #[test]
    fn self_parent_does_not_recurse() {
        let events = vec![span("a", Some("a"))];
        let forest = build_span_forest(events);
        assert_eq!(forest.len(), 1);
        assert!(forest[0].children.is_empty());
    }
}
