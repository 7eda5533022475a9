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

//! Export endpoint: analytics, traces or evaluations as JSON or CSV.

use crate::api::{projects::owned_project, ApiError};
use crate::auth::AuthContext;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use chrono::{DateTime, Utc};
use evalforge_core::Error;
use evalforge_storage::TimeRange;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportDataType {
    Analytics,
    Traces,
    Evaluations,
}

#[derive(Deserialize)]
pub struct ExportParams {
    pub project_id: i64,
    pub format: ExportFormat,
    pub data_type: ExportDataType,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// GET /api/v1/export
pub async fn export(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    owned_project(&state, &auth, params.project_id).await?;
    let range = TimeRange {
        start: params.start,
        end: params.end,
    };

    let (filename, body) = match params.data_type {
        ExportDataType::Analytics => {
            let summary = state
                .events
                .analytics_summary(params.project_id, range)
                .await?;
            let costs = state.events.cost_by_model(params.project_id, range).await?;
            match params.format {
                ExportFormat::Json => (
                    "analytics.json",
                    serde_json::to_string_pretty(
                        &serde_json::json!({ "summary": summary, "costs": costs }),
                    )
                    .map_err(Error::from)?,
                ),
                ExportFormat::Csv => {
                    let mut out = csv_row(&["model", "provider", "events", "tokens", "cost"]);
                    for row in &costs {
                        out.push_str(&csv_row(&[
                            &row.model,
                            &row.provider,
                            &row.event_count.to_string(),
                            &row.total_tokens.to_string(),
                            &format!("{:.6}", row.total_cost),
                        ]));
                    }
                    ("analytics.csv", out)
                }
            }
        }
        ExportDataType::Traces => {
            let traces = state
                .events
                .list_traces(params.project_id, range, 1000)
                .await?;
            match params.format {
                ExportFormat::Json => (
                    "traces.json",
                    serde_json::to_string_pretty(&traces).map_err(Error::from)?,
                ),
                ExportFormat::Csv => {
                    let mut out = csv_row(&[
                        "trace_id",
                        "spans",
                        "start_time",
                        "end_time",
                        "root_operation",
                        "tokens",
                        "cost",
                        "errors",
                    ]);
                    for t in &traces {
                        out.push_str(&csv_row(&[
                            &t.trace_id,
                            &t.span_count.to_string(),
                            &t.start_time.to_rfc3339(),
                            &t.end_time.to_rfc3339(),
                            &t.root_operation,
                            &t.total_tokens.to_string(),
                            &format!("{:.6}", t.total_cost),
                            &t.error_count.to_string(),
                        ]));
                    }
                    ("traces.csv", out)
                }
            }
        }
        ExportDataType::Evaluations => {
            let evaluations = state
                .metadata
                .list_evaluations(params.project_id, 1000)
                .await?;
            match params.format {
                ExportFormat::Json => (
                    "evaluations.json",
                    serde_json::to_string_pretty(&evaluations).map_err(Error::from)?,
                ),
                ExportFormat::Csv => {
                    let mut out = csv_row(&[
                        "id",
                        "name",
                        "status",
                        "progress",
                        "created_at",
                        "completed_at",
                    ]);
                    for e in &evaluations {
                        out.push_str(&csv_row(&[
                            &e.id.to_string(),
                            &e.name,
                            e.status.as_str(),
                            &e.progress.to_string(),
                            &e.created_at.to_rfc3339(),
                            &e.completed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                        ]));
                    }
                    ("evaluations.csv", out)
                }
            }
        }
    };

    let content_type = match params.format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
    };
    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    if let Ok(disposition) =
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
    {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, disposition);
    }
    Ok(response)
}

fn csv_row(fields: &[&str]) -> String {
    let escaped: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
    format!("{}\n", escaped.join(","))
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_escaping() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_row(&["a", "b,c"]), "a,\"b,c\"\n");
    }

    #[test]
    fn params_parse_snake_case() {
        let params: ExportParams = serde_json::from_value(serde_json::json!({
            "project_id": 1,
            "format": "csv",
            "data_type": "analytics"
        }))
        .unwrap();
        assert_eq!(params.format, ExportFormat::Csv);
        assert_eq!(params.data_type, ExportDataType::Analytics);
    }
}
