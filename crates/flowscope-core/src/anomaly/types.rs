//! Anomaly records and summaries

use crate::models::FlowKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Spike,
    SlowBurn,
    NewEndpoint,
    NewPattern,
    SizeAnomaly,
    FrequencyAnomaly,
    CostAnomaly,
    Leak,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spike => "spike",
            Self::SlowBurn => "slow_burn",
            Self::NewEndpoint => "new_endpoint",
            Self::NewPattern => "new_pattern",
            Self::SizeAnomaly => "size_anomaly",
            Self::FrequencyAnomaly => "frequency_anomaly",
            Self::CostAnomaly => "cost_anomaly",
            Self::Leak => "leak",
        }
    }

    /// Likely explanations, most common first
    pub fn potential_causes(&self) -> &'static [&'static str] {
        match self {
            Self::Spike => &[
                "Deployment or configuration change",
                "Retry storm against a failing dependency",
                "Batch job or backfill started",
            ],
            Self::SlowBurn => &[
                "Organic traffic growth",
                "Cache hit rate degrading",
                "Payload sizes growing over time",
            ],
            Self::NewEndpoint => &[
                "New dependency introduced by a release",
                "Misconfigured endpoint or region",
            ],
            Self::Leak => &[
                "Unbounded replication or sync loop",
                "Log or metrics shipping without sampling",
            ],
            Self::CostAnomaly => &["Traffic shifted to a more expensive transfer path"],
            Self::NewPattern | Self::SizeAnomaly | Self::FrequencyAnomaly => {
                &["Change in client behavior"]
            }
        }
    }

    pub fn suggested_actions(&self) -> &'static [&'static str] {
        match self {
            Self::Spike => &[
                "Correlate with recent deployments",
                "Check retry and timeout settings of the source service",
            ],
            Self::SlowBurn => &[
                "Review growth trend against capacity plans",
                "Consider compression or caching",
            ],
            Self::NewEndpoint => &["Confirm the destination is expected"],
            Self::Leak => &[
                "Inspect the source service for runaway transfer loops",
                "Add rate limits on the egress path",
            ],
            Self::CostAnomaly => &["Route traffic through a cheaper path such as a VPC endpoint"],
            Self::NewPattern | Self::SizeAnomaly | Self::FrequencyAnomaly => {
                &["Compare with the baseline for this flow"]
            }
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity for a deviation measured in standard deviations
    pub fn from_deviation(deviation: f64) -> Self {
        let abs = deviation.abs();
        if abs > 10.0 {
            Self::Critical
        } else if abs > 7.0 {
            Self::High
        } else if abs > 5.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected or injected deviation in transfer behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flow_key: String,
    #[serde(default)]
    pub source_service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_endpoint: String,
    #[serde(default = "Utc::now")]
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_value: f64,
    #[serde(default)]
    pub baseline_value: f64,
    /// Standard deviations from the baseline mean
    #[serde(default)]
    pub deviation: f64,
    #[serde(default)]
    pub absolute_delta: f64,
    #[serde(default)]
    pub estimated_cost_impact_usd: f64,
    #[serde(default)]
    pub estimated_monthly_impact_usd: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_event_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub potential_causes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<String>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub acknowledged_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolution_notes: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Anomaly {
    /// New active anomaly for a flow key, with causes and actions for its type
    pub fn new(
        anomaly_type: AnomalyType,
        severity: Severity,
        flow_key: &str,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let (source_service, destination_service, transfer_type) = match FlowKey::parse(flow_key) {
            Some(key) => (key.source, key.destination, Some(key.transfer_type)),
            None => (flow_key.to_string(), String::new(), None),
        };
        let mut labels = HashMap::new();
        if let Some(t) = transfer_type {
            labels.insert("transfer_type".to_string(), t.to_string());
        }

        Self {
            id: Uuid::new_v4(),
            anomaly_type,
            severity,
            flow_key: flow_key.to_string(),
            source_service,
            destination_service,
            destination_endpoint: String::new(),
            detected_at,
            started_at: Some(detected_at),
            ended_at: None,
            current_value: 0.0,
            baseline_value: 0.0,
            deviation: 0.0,
            absolute_delta: 0.0,
            estimated_cost_impact_usd: 0.0,
            estimated_monthly_impact_usd: 0.0,
            related_event_ids: Vec::new(),
            potential_causes: to_strings(anomaly_type.potential_causes()),
            suggested_actions: to_strings(anomaly_type.suggested_actions()),
            acknowledged: false,
            acknowledged_by: String::new(),
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
            resolution_notes: String::new(),
            labels,
            created_at: detected_at,
            updated_at: detected_at,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.resolved && self.ended_at.is_none()
    }

    /// Hours from start to end, or to now while still open
    pub fn duration_hours(&self) -> Option<f64> {
        self.duration_hours_at(Utc::now())
    }

    pub fn duration_hours_at(&self, now: DateTime<Utc>) -> Option<f64> {
        let started = self.started_at?;
        let end = self.ended_at.unwrap_or(now);
        Some((end - started).num_seconds() as f64 / 3600.0)
    }

    /// Percent change from the baseline; 100 when the baseline was zero
    pub fn percent_increase(&self) -> f64 {
        if self.baseline_value == 0.0 {
            return if self.current_value > 0.0 { 100.0 } else { 0.0 };
        }
        (self.current_value - self.baseline_value) / self.baseline_value * 100.0
    }

    /// Grouping key for repeat suppression
    pub fn dedup_key(&self) -> String {
        if self.flow_key.is_empty() {
            self.source_service.clone()
        } else {
            self.flow_key.clone()
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalySummary {
    pub total_active: usize,
    pub total_resolved: usize,
    pub by_severity: HashMap<Severity, usize>,
    pub by_type: HashMap<AnomalyType, usize>,
    pub total_cost_impact_usd: f64,
    pub top_anomalies: Vec<Anomaly>,
}
