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

//! Alert thresholds and intents
//!
//! Thresholds are evaluated periodically against the rolling metrics
//! snapshot. A fired threshold produces an [`AlertIntent`]; delivery
//! (Slack, email, webhook) is the job of an external collaborator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    ErrorRate,
    AvgLatencyMs,
    EventsPerMinute,
    CostPerHour,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::ErrorRate => "error_rate",
            AlertMetric::AvgLatencyMs => "avg_latency_ms",
            AlertMetric::EventsPerMinute => "events_per_minute",
            AlertMetric::CostPerHour => "cost_per_hour",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error_rate" => Some(AlertMetric::ErrorRate),
            "avg_latency_ms" => Some(AlertMetric::AvgLatencyMs),
            "events_per_minute" => Some(AlertMetric::EventsPerMinute),
            "cost_per_hour" => Some(AlertMetric::CostPerHour),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "=")]
    Eq,
}

impl AlertOperator {
    /// Strict comparison semantics: `>` at equality does not hold.
    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            AlertOperator::Gt => observed > threshold,
            AlertOperator::Gte => observed >= threshold,
            AlertOperator::Lt => observed < threshold,
            AlertOperator::Lte => observed <= threshold,
            AlertOperator::Eq => (observed - threshold).abs() < f64::EPSILON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertOperator::Gt => ">",
            AlertOperator::Gte => ">=",
            AlertOperator::Lt => "<",
            AlertOperator::Lte => "<=",
            AlertOperator::Eq => "=",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            ">" => Some(AlertOperator::Gt),
            ">=" => Some(AlertOperator::Gte),
            "<" => Some(AlertOperator::Lt),
            "<=" => Some(AlertOperator::Lte),
            "=" => Some(AlertOperator::Eq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub id: i64,
    pub project_id: i64,
    pub metric: AlertMetric,
    pub operator: AlertOperator,
    pub value: f64,
    pub window_minutes: u32,
    pub cooldown_minutes: u32,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl AlertThreshold {
    /// Whether the threshold fires for `observed` at `now`. The previous
    /// fire's cooldown must have fully elapsed.
    pub fn should_fire(&self, observed: f64, now: DateTime<Utc>) -> bool {
        if !self.enabled || !self.operator.holds(observed, self.value) {
            return false;
        }
        match self.last_triggered {
            None => true,
            Some(last) => now > last + Duration::minutes(self.cooldown_minutes as i64),
        }
    }
}

/// The fact that a threshold fired, handed to the notification
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertIntent {
    pub project_id: i64,
    pub metric: AlertMetric,
    pub observed: f64,
    pub threshold: f64,
    pub operator: AlertOperator,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Slack,
    Email,
    Webhook,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Slack => "slack",
            NotificationChannel::Email => "email",
            NotificationChannel::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "slack" => Some(NotificationChannel::Slack),
            "email" => Some(NotificationChannel::Email),
            "webhook" => Some(NotificationChannel::Webhook),
            _ => None,
        }
    }
}

/// Per-project delivery target. The core persists these and hands intents
/// off; it never talks to Slack/SMTP itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub id: i64,
    pub project_id: i64,
    pub channel: NotificationChannel,
    /// Webhook URL, channel name or address, depending on the kind.
    pub target: String,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(operator: AlertOperator, value: f64) -> AlertThreshold {
        AlertThreshold {
            id: 1,
            project_id: 1,
            metric: AlertMetric::ErrorRate,
            operator,
            value,
            window_minutes: 5,
            cooldown_minutes: 10,
            last_triggered: None,
            enabled: true,
        }
    }

    #[test]
    fn gt_at_equality_does_not_fire() {
        let now = Utc::now();
        assert!(!threshold(AlertOperator::Gt, 0.5).should_fire(0.5, now));
        assert!(threshold(AlertOperator::Gte, 0.5).should_fire(0.5, now));
        assert!(threshold(AlertOperator::Gt, 0.5).should_fire(0.500001, now));
    }

    #[test]
    fn cooldown_gates_refire() {
        let now = Utc::now();
        let mut t = threshold(AlertOperator::Gte, 0.5);

        assert!(t.should_fire(0.9, now));
        t.last_triggered = Some(now);

        // Inside cooldown: no refire even though the comparison holds.
        assert!(!t.should_fire(0.9, now + Duration::minutes(9)));
        assert!(!t.should_fire(0.9, now + Duration::minutes(10)));
        // Strictly past cooldown.
        assert!(t.should_fire(0.9, now + Duration::minutes(10) + Duration::seconds(1)));
    }

    #[test]
    fn disabled_never_fires() {
        let mut t = threshold(AlertOperator::Gte, 0.0);
        t.enabled = false;
        assert!(!t.should_fire(1.0, Utc::now()));
    }

    #[test]
    fn operator_serde_uses_symbols() {
        let json = serde_json::to_string(&AlertOperator::Gte).unwrap();
        assert_eq!(json, "\">=\"");
        let op: AlertOperator = serde_json::from_str("\"<\"").unwrap();
        assert_eq!(op, AlertOperator::Lt);
    }
}
