//! Cost calculation and attribution

use super::pricing::{bytes_to_gb, default_aws_rules, CostCategory, PricingRule};
use crate::models::{TransferFlow, TransferType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Number of attributions reported as top cost drivers
pub const TOP_COST_DRIVERS: usize = 10;

/// Priced transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<Uuid>,
    pub category: CostCategory,
    pub bytes_transferred: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_rule_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_service: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_region: String,
}

/// Cost attributed to one source workload over a period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAttribution {
    pub id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub team: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,
    pub total_bytes: u64,
    pub total_cost_usd: f64,
    pub breakdown: Vec<CostBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_delta_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_delta_percent: Option<f64>,
}

impl CostAttribution {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.service_name)
    }

    /// Average cost per GB, zero when nothing was transferred
    pub fn cost_per_gb(&self) -> f64 {
        let gb = bytes_to_gb(self.total_bytes);
        if gb == 0.0 {
            return 0.0;
        }
        self.total_cost_usd / gb
    }

    /// Record the cost delta against a reference cost
    pub fn with_baseline(mut self, baseline_cost_usd: f64) -> Self {
        let delta = self.total_cost_usd - baseline_cost_usd;
        self.baseline_cost_usd = Some(baseline_cost_usd);
        self.cost_delta_usd = Some(delta);
        self.cost_delta_percent = if baseline_cost_usd > 0.0 {
            Some(delta / baseline_cost_usd * 100.0)
        } else {
            None
        };
        self
    }

    /// More than 50% away from the baseline cost in either direction
    pub fn is_anomalous(&self) -> bool {
        self.cost_delta_percent.map_or(false, |d| d.abs() > 50.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_bytes: u64,
    pub egress_cost_usd: f64,
    pub cross_region_cost_usd: f64,
    pub cross_az_cost_usd: f64,
    pub by_namespace: HashMap<String, f64>,
    pub by_service: HashMap<String, f64>,
    pub by_category: HashMap<CostCategory, f64>,
    pub top_cost_drivers: Vec<CostAttribution>,
}

/// Prices flows against pricing rules and cumulative monthly usage
pub struct CostEngine {
    rules: RwLock<Vec<PricingRule>>,
    /// GB consumed per (YYYY-MM, category)
    monthly_usage: DashMap<(String, CostCategory), f64>,
}

impl CostEngine {
    /// Engine loaded with the default AWS rule set
    pub fn new() -> Self {
        Self::with_rules(default_aws_rules())
    }

    /// Engine with no rules; every flow uses fallback rates
    pub fn empty() -> Self {
        Self::with_rules(Vec::new())
    }

    pub fn with_rules(rules: Vec<PricingRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|mut r| {
                r.sort_tiers();
                r
            })
            .collect();
        Self {
            rules: RwLock::new(rules),
            monthly_usage: DashMap::new(),
        }
    }

    /// Append a rule; earlier rules win on overlap
    pub fn add_pricing_rule(&self, mut rule: PricingRule) {
        rule.sort_tiers();
        debug!(rule = %rule.name, category = %rule.category, "Pricing rule added");
        self.rules.write().push(rule);
    }

    pub fn pricing_rules(&self) -> Vec<PricingRule> {
        self.rules.read().clone()
    }

    /// GB already billed this month for a category
    pub fn monthly_usage_gb(&self, at: DateTime<Utc>, category: CostCategory) -> f64 {
        self.monthly_usage
            .get(&(month_key(at), category))
            .map_or(0.0, |v| *v)
    }

    pub fn calculate_cost(&self, flow: &TransferFlow) -> CostBreakdown {
        self.calculate_cost_at(flow, Utc::now())
    }

    /// Price a flow as of `now`
    ///
    /// The matching rule is priced against the month's cumulative usage for
    /// the flow's category, and the flow's GB are then added to that usage.
    pub fn calculate_cost_at(&self, flow: &TransferFlow, now: DateTime<Utc>) -> CostBreakdown {
        let category = classify_category(flow.transfer_type);
        let source_region = flow.source_identity.region.clone();
        let destination_region = destination_region(flow);

        let rule = {
            let rules = self.rules.read();
            rules
                .iter()
                .find(|r| {
                    r.category == category
                        && r.is_effective_at(now)
                        && r.matches_regions(&source_region, &destination_region)
                })
                .cloned()
        };

        let gb = bytes_to_gb(flow.total_bytes);
        let cost = match rule {
            Some(ref rule) => {
                let mut used = self
                    .monthly_usage
                    .entry((month_key(now), category))
                    .or_insert(0.0);
                let cost = rule.calculate_cost(flow.total_bytes, *used);
                *used += gb;
                cost
            }
            None => gb * fallback_rate(category),
        };

        CostBreakdown {
            flow_id: Some(flow.id),
            category,
            bytes_transferred: flow.total_bytes,
            cost_usd: cost,
            pricing_rule_id: rule.map(|r| r.id),
            source_service: flow.source_identity.full_name(),
            destination_service: match (&flow.destination_identity, &flow.destination_endpoint) {
                (Some(identity), _) => identity.full_name(),
                (None, Some(endpoint)) => endpoint.ip.clone(),
                (None, None) => String::new(),
            },
            source_region,
            destination_region,
        }
    }

    /// One attribution per source service, in first-seen order
    pub fn calculate_attribution(
        &self,
        flows: &[TransferFlow],
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Vec<CostAttribution> {
        let mut attributions: Vec<CostAttribution> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for flow in flows {
            let key = flow.source_identity.full_name();
            let slot = *index.entry(key).or_insert_with(|| {
                let identity = &flow.source_identity;
                attributions.push(CostAttribution {
                    id: Uuid::new_v4(),
                    period_start,
                    period_end,
                    namespace: identity.namespace.clone(),
                    service_name: identity.name.clone(),
                    deployment_version: identity.version.clone(),
                    team: identity.team.clone(),
                    environment: identity.environment.clone(),
                    total_bytes: 0,
                    total_cost_usd: 0.0,
                    breakdown: Vec::new(),
                    baseline_cost_usd: None,
                    cost_delta_usd: None,
                    cost_delta_percent: None,
                });
                attributions.len() - 1
            });

            let breakdown = self.calculate_cost(flow);
            let attribution = &mut attributions[slot];
            attribution.total_bytes += flow.total_bytes;
            attribution.total_cost_usd += breakdown.cost_usd;
            attribution.breakdown.push(breakdown);
        }

        for attribution in &attributions {
            debug!(
                service = %attribution.full_name(),
                bytes = attribution.total_bytes,
                cost_usd = attribution.total_cost_usd,
                "Cost attribution calculated"
            );
        }
        attributions
    }

    pub fn cost_summary(&self, attributions: &[CostAttribution]) -> CostSummary {
        summarize(attributions)
    }

    /// Scale a cost observed over `period_days` to 30 days
    pub fn estimate_monthly_projection(&self, cost_usd: f64, period_days: f64) -> f64 {
        if period_days <= 0.0 {
            return 0.0;
        }
        cost_usd / period_days * 30.0
    }
}

impl Default for CostEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn summarize(attributions: &[CostAttribution]) -> CostSummary {
    let mut summary = CostSummary::default();

    for attr in attributions {
        summary.total_cost_usd += attr.total_cost_usd;
        summary.total_bytes += attr.total_bytes;

        if !attr.namespace.is_empty() {
            *summary.by_namespace.entry(attr.namespace.clone()).or_default() += attr.total_cost_usd;
        }
        if !attr.service_name.is_empty() {
            *summary.by_service.entry(attr.full_name()).or_default() += attr.total_cost_usd;
        }

        for b in &attr.breakdown {
            *summary.by_category.entry(b.category).or_default() += b.cost_usd;
            match b.category {
                CostCategory::EgressInternet => summary.egress_cost_usd += b.cost_usd,
                CostCategory::CrossRegion => summary.cross_region_cost_usd += b.cost_usd,
                CostCategory::CrossAz => summary.cross_az_cost_usd += b.cost_usd,
                _ => {}
            }
        }
    }

    summary.top_cost_drivers = attributions.iter().take(TOP_COST_DRIVERS).cloned().collect();
    summary
}

/// Billing category for a transfer type; internal traffic bills as cross-AZ
pub fn classify_category(transfer_type: TransferType) -> CostCategory {
    match transfer_type {
        TransferType::Egress => CostCategory::EgressInternet,
        TransferType::CrossRegion => CostCategory::CrossRegion,
        _ => CostCategory::CrossAz,
    }
}

fn fallback_rate(category: CostCategory) -> f64 {
    match category {
        CostCategory::EgressInternet => 0.09,
        CostCategory::CrossAz => 0.01,
        CostCategory::CrossRegion => 0.02,
        _ => 0.0,
    }
}

fn destination_region(flow: &TransferFlow) -> String {
    if let Some(ref identity) = flow.destination_identity {
        if !identity.region.is_empty() {
            return identity.region.clone();
        }
    }
    flow.destination_endpoint
        .as_ref()
        .map(|e| e.effective_region().to_string())
        .unwrap_or_default()
}

fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}
