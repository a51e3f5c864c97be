//! FlowScope analytics core
//!
//! This crate provides the core functionality for:
//! - Ingesting transfer events through a bounded, batching pipeline
//! - Maintaining a concurrent service-to-service transfer graph
//! - Pricing transfers against tiered cloud pricing rules
//! - Hourly baselines and anomaly detection per flow
//! - Health checks and observability

pub mod anomaly;
pub mod collector;
pub mod cost;
pub mod graph;
pub mod health;
pub mod models;
pub mod observability;
pub mod storage;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
