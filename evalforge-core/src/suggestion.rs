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

//! Prompt optimization suggestions produced from evaluation results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Failure pattern the suggestion addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionCategory {
    Clarity,
    Examples,
    Format,
    Accuracy,
    Safety,
}

impl SuggestionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionCategory::Clarity => "clarity",
            SuggestionCategory::Examples => "examples",
            SuggestionCategory::Format => "format",
            SuggestionCategory::Accuracy => "accuracy",
            SuggestionCategory::Safety => "safety",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clarity" => Some(SuggestionCategory::Clarity),
            "examples" => Some(SuggestionCategory::Examples),
            "format" => Some(SuggestionCategory::Format),
            "accuracy" => Some(SuggestionCategory::Accuracy),
            "safety" => Some(SuggestionCategory::Safety),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionPriority {
    Low,
    Medium,
    High,
}

impl SuggestionPriority {
    /// Fixed bucketing over expected_impact × confidence.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            SuggestionPriority::High
        } else if score >= 0.4 {
            SuggestionPriority::Medium
        } else {
            SuggestionPriority::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionPriority::Low => "low",
            SuggestionPriority::Medium => "medium",
            SuggestionPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(SuggestionPriority::Low),
            "medium" => Some(SuggestionPriority::Medium),
            "high" => Some(SuggestionPriority::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Rejected,
    Applied,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Applied => "applied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SuggestionStatus::Pending),
            "accepted" => Some(SuggestionStatus::Accepted),
            "rejected" => Some(SuggestionStatus::Rejected),
            "applied" => Some(SuggestionStatus::Applied),
            _ => None,
        }
    }
}

/// A concrete prompt rewrite with its expected payoff. Created by the
/// suggester; status transitions are user actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub id: Uuid,
    pub evaluation_id: Uuid,
    pub category: SuggestionCategory,
    pub title: String,
    pub description: String,
    pub old_prompt: String,
    pub new_prompt: String,
    /// Bounded by the observed deficit for the category.
    pub expected_impact: f64,
    pub confidence: f64,
    pub priority: SuggestionPriority,
    pub status: SuggestionStatus,
    #[serde(default)]
    pub reasoning: String,
    /// Failing cases that motivated the suggestion.
    #[serde(default)]
    pub examples: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bucketing() {
        assert_eq!(SuggestionPriority::from_score(0.7), SuggestionPriority::High);
        assert_eq!(SuggestionPriority::from_score(0.95), SuggestionPriority::High);
        assert_eq!(
            SuggestionPriority::from_score(0.69),
            SuggestionPriority::Medium
        );
        assert_eq!(
            SuggestionPriority::from_score(0.4),
            SuggestionPriority::Medium
        );
        assert_eq!(SuggestionPriority::from_score(0.39), SuggestionPriority::Low);
        assert_eq!(SuggestionPriority::from_score(0.0), SuggestionPriority::Low);
    }
}
