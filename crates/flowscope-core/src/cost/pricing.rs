//! Pricing rules and tiered billing

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bytes per billed gigabyte
pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudProvider {
    Aws,
    Gcp,
    Azure,
    Unknown,
}

impl Default for CloudProvider {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Billing category of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    EgressInternet,
    EgressRegion,
    CrossAz,
    CrossRegion,
    VpcPeering,
    NatGateway,
    LoadBalancer,
    PrivateLink,
}

impl CostCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EgressInternet => "egress_internet",
            Self::EgressRegion => "egress_region",
            Self::CrossAz => "cross_az",
            Self::CrossRegion => "cross_region",
            Self::VpcPeering => "vpc_peering",
            Self::NatGateway => "nat_gateway",
            Self::LoadBalancer => "load_balancer",
            Self::PrivateLink => "private_link",
        }
    }
}

impl fmt::Display for CostCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price applying up to a cumulative monthly threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingTier {
    pub threshold_gb: f64,
    pub cost_per_gb: f64,
}

impl PricingTier {
    pub fn new(threshold_gb: f64, cost_per_gb: f64) -> Self {
        Self {
            threshold_gb,
            cost_per_gb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub cloud_provider: CloudProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_region: Option<String>,
    pub category: CostCategory,
    pub cost_per_gb: f64,
    #[serde(default)]
    pub free_tier_gb: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<PricingTier>,
    #[serde(default = "epoch")]
    pub effective_from: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_until: Option<DateTime<Utc>>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl PricingRule {
    /// Flat-rate rule effective since the epoch
    pub fn new(name: impl Into<String>, category: CostCategory, cost_per_gb: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            cloud_provider: CloudProvider::Unknown,
            source_region: None,
            destination_region: None,
            category,
            cost_per_gb,
            free_tier_gb: 0.0,
            tiers: Vec::new(),
            effective_from: epoch(),
            effective_until: None,
        }
    }

    pub fn with_free_tier(mut self, free_tier_gb: f64) -> Self {
        self.free_tier_gb = free_tier_gb;
        self
    }

    pub fn with_tiers(mut self, tiers: Vec<PricingTier>) -> Self {
        self.tiers = tiers;
        self.sort_tiers();
        self
    }

    pub fn with_regions(
        mut self,
        source_region: Option<String>,
        destination_region: Option<String>,
    ) -> Self {
        self.source_region = source_region;
        self.destination_region = destination_region;
        self
    }

    pub fn with_effective_window(
        mut self,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.effective_from = from;
        self.effective_until = until;
        self
    }

    pub(crate) fn sort_tiers(&mut self) {
        self.tiers
            .sort_by(|a, b| a.threshold_gb.total_cmp(&b.threshold_gb));
    }

    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        if self.effective_from > at {
            return false;
        }
        !matches!(self.effective_until, Some(until) if until < at)
    }

    /// Region constraints, if any, match the given regions exactly
    pub fn matches_regions(&self, source_region: &str, destination_region: &str) -> bool {
        let matches = |constraint: &Option<String>, region: &str| {
            constraint
                .as_deref()
                .map_or(true, |c| c.is_empty() || c == region)
        };
        matches(&self.source_region, source_region)
            && matches(&self.destination_region, destination_region)
    }

    /// Price `bytes` given `already_used_gb` consumed earlier in the month
    ///
    /// Usage within the free tier is free. Billable usage walks the tiers in
    /// ascending threshold order from the current cumulative position, and
    /// anything beyond the last tier is billed at the base rate.
    pub fn calculate_cost(&self, bytes: u64, already_used_gb: f64) -> f64 {
        let gb = bytes_to_gb(bytes);
        let total_gb = already_used_gb + gb;

        if total_gb <= self.free_tier_gb {
            return 0.0;
        }

        let billable_start = already_used_gb.max(self.free_tier_gb);
        let billable_gb = total_gb - billable_start;

        if self.tiers.is_empty() {
            return billable_gb * self.cost_per_gb;
        }

        let mut cost = 0.0;
        let mut remaining = billable_gb;
        let mut position = billable_start;

        for tier in &self.tiers {
            if position >= tier.threshold_gb {
                continue;
            }
            let tier_gb = remaining.min(tier.threshold_gb - position);
            cost += tier_gb * tier.cost_per_gb;
            remaining -= tier_gb;
            position += tier_gb;
            if remaining <= 0.0 {
                break;
            }
        }

        if remaining > 0.0 {
            cost += remaining * self.cost_per_gb;
        }
        cost
    }
}

/// Published AWS data transfer prices
pub fn default_aws_rules() -> Vec<PricingRule> {
    let effective = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(epoch);

    let aws = |name: &str, description: &str, category, cost_per_gb| {
        let mut rule = PricingRule::new(name, category, cost_per_gb)
            .with_effective_window(effective, None);
        rule.description = description.to_string();
        rule.cloud_provider = CloudProvider::Aws;
        rule
    };

    vec![
        aws(
            "AWS Internet Egress",
            "Data transfer out to the internet",
            CostCategory::EgressInternet,
            0.09,
        )
        .with_free_tier(1.0)
        .with_tiers(vec![
            PricingTier::new(10.0 * 1024.0, 0.09),
            PricingTier::new(50.0 * 1024.0, 0.085),
            PricingTier::new(150.0 * 1024.0, 0.07),
        ]),
        aws(
            "AWS Cross-AZ Transfer",
            "Data transfer between availability zones",
            CostCategory::CrossAz,
            0.01,
        ),
        aws(
            "AWS Cross-Region US East to West",
            "Data transfer between US regions",
            CostCategory::CrossRegion,
            0.02,
        )
        .with_regions(Some("us-east-1".to_string()), Some("us-west-2".to_string())),
        aws(
            "AWS NAT Gateway Processing",
            "NAT gateway data processing",
            CostCategory::NatGateway,
            0.045,
        ),
        aws(
            "AWS VPC Peering Cross-Region",
            "VPC peering data transfer across regions",
            CostCategory::VpcPeering,
            0.01,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_zero_bytes_cost_nothing() {
        for rule in default_aws_rules() {
            assert_eq!(rule.calculate_cost(0, 0.0), 0.0);
            assert_eq!(rule.calculate_cost(0, 5000.0), 0.0);
        }
    }

    #[test]
    fn test_free_tier() {
        let rule = PricingRule::new("egress", CostCategory::EgressInternet, 0.09).with_free_tier(1.0);
        assert_eq!(rule.calculate_cost(GIB / 2, 0.0), 0.0);
        assert_eq!(rule.calculate_cost(GIB, 0.0), 0.0);
        assert_close(rule.calculate_cost(2 * GIB, 0.0), 0.09);
        assert_close(rule.calculate_cost(GIB, 1.0), 0.09);
    }

    #[test]
    fn test_split_flow_never_costs_more() {
        let rule = default_aws_rules().remove(0);
        let bytes = 3 * GIB;

        let single = rule.calculate_cost(bytes, 0.0);
        let first = rule.calculate_cost(bytes / 3, 0.0);
        let second = rule.calculate_cost(bytes / 3, bytes_to_gb(bytes / 3));
        let third = rule.calculate_cost(bytes / 3, bytes_to_gb(2 * bytes / 3));

        assert!(first + second + third <= single + 1e-9);
    }

    #[test]
    fn test_tiers_cross_boundary() {
        let rule = PricingRule::new("tiered", CostCategory::EgressInternet, 0.05).with_tiers(vec![
            PricingTier::new(20.0, 0.5),
            PricingTier::new(10.0, 1.0),
        ]);

        // 8 GB already used: 2 GB at 1.0, 10 GB at 0.5, 3 GB beyond at 0.05
        assert_close(rule.calculate_cost(15 * GIB, 8.0), 2.0 + 5.0 + 0.15);
        assert_eq!(rule.tiers[0].threshold_gb, 10.0);
    }

    #[test]
    fn test_effective_window_and_regions() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let rule = PricingRule::new("x", CostCategory::CrossRegion, 0.02)
            .with_effective_window(from, Some(until))
            .with_regions(Some("us-east-1".to_string()), None);

        assert!(!rule.is_effective_at(from - chrono::Duration::days(1)));
        assert!(rule.is_effective_at(from));
        assert!(!rule.is_effective_at(until + chrono::Duration::days(1)));

        assert!(rule.matches_regions("us-east-1", "eu-west-1"));
        assert!(!rule.matches_regions("us-west-2", "eu-west-1"));
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: PricingRule = serde_json::from_str(
            r#"{"name": "custom", "category": "nat_gateway", "cost_per_gb": 0.05}"#,
        )
        .unwrap();
        assert_eq!(rule.category, CostCategory::NatGateway);
        assert_eq!(rule.cloud_provider, CloudProvider::Unknown);
        assert!(rule.tiers.is_empty());
        assert!(rule.is_effective_at(Utc::now()));
    }
}
