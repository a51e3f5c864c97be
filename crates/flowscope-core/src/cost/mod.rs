//! Tiered transfer cost model
//!
//! Flows are classified into billing categories and priced against the
//! first matching rule, taking cumulative monthly usage into account so
//! free tiers and volume tiers apply across flows.

mod engine;
mod ledger;
mod pricing;

pub use engine::{
    classify_category, CostAttribution, CostBreakdown, CostEngine, CostSummary, TOP_COST_DRIVERS,
};
pub use ledger::CostLedger;
pub use pricing::{
    bytes_to_gb, default_aws_rules, CloudProvider, CostCategory, PricingRule, PricingTier,
    BYTES_PER_GB,
};
