//! Durable storage seam for transfer events
//!
//! The pipeline writes raw event batches through [`FlowStore::insert_events`]
//! and reads hourly aggregates back through [`FlowStore::query_flows`] for
//! graph replay and baseline training.

mod identity;
mod jsonl;
mod memory;

pub use identity::{enrich_event, IdentityResolver, StaticIdentityResolver};
pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

use crate::models::{TransferEvent, TransferType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors returned by storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode event: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Filter for aggregated flow queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_type: Option<TransferType>,
    pub limit: usize,
}

impl FlowQuery {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, limit: usize) -> Self {
        Self {
            start,
            end,
            src_namespace: None,
            src_service: None,
            dst_namespace: None,
            dst_service: None,
            transfer_type: None,
            limit,
        }
    }

    pub fn with_transfer_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = Some(transfer_type);
        self
    }

    fn matches(&self, row: &FlowRow<'_>, event: &TransferEvent) -> bool {
        if event.timestamp < self.start || event.timestamp >= self.end {
            return false;
        }
        let field_matches =
            |filter: &Option<String>, value: &str| filter.as_deref().map_or(true, |f| f == value);

        field_matches(&self.src_namespace, row.src_namespace)
            && field_matches(&self.src_service, row.src_service)
            && field_matches(&self.dst_namespace, row.dst_namespace)
            && field_matches(&self.dst_service, row.dst_service)
            && self.transfer_type.map_or(true, |t| t == row.transfer_type)
    }
}

/// One aggregated row of a flow query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    pub src_namespace: String,
    pub src_service: String,
    pub dst_namespace: String,
    pub dst_service: String,
    pub dst_external: String,
    pub transfer_type: TransferType,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub event_count: u64,
}

impl FlowResult {
    /// Whether the row's events carried a resolved source service
    pub fn has_source(&self) -> bool {
        !self.src_service.is_empty()
    }
}

/// Durable event store
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Persist a batch of raw events
    async fn insert_events(&self, events: &[TransferEvent]) -> Result<(), StorageError>;

    /// Aggregate stored events matching the query, largest first
    async fn query_flows(&self, query: &FlowQuery) -> Result<Vec<FlowResult>, StorageError>;
}

/// Grouping columns of an event, borrowed from the event itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowRow<'a> {
    src_namespace: &'a str,
    src_service: &'a str,
    dst_namespace: &'a str,
    dst_service: &'a str,
    dst_external: &'a str,
    transfer_type: TransferType,
}

impl<'a> FlowRow<'a> {
    fn from_event(event: &'a TransferEvent) -> Self {
        let (src_namespace, src_service) = event
            .source
            .identity
            .as_ref()
            .map(|i| (i.namespace.as_str(), i.name.as_str()))
            .unwrap_or(("", ""));

        let (dst_namespace, dst_service, dst_external) = match event.destination.identity {
            Some(ref identity) => (identity.namespace.as_str(), identity.name.as_str(), ""),
            None => ("", "", event.destination.ip.as_str()),
        };

        Self {
            src_namespace,
            src_service,
            dst_namespace,
            dst_service,
            dst_external,
            transfer_type: event.effective_transfer_type(),
        }
    }
}

/// Group events into flow rows the way the hourly rollup does
pub(crate) fn aggregate_events<'a, I>(events: I, query: &FlowQuery) -> Vec<FlowResult>
where
    I: IntoIterator<Item = &'a TransferEvent>,
{
    let mut grouped: HashMap<FlowRow<'a>, FlowResult> = HashMap::new();

    for event in events {
        let row = FlowRow::from_event(event);
        if !query.matches(&row, event) {
            continue;
        }

        let entry = grouped.entry(row).or_insert_with(|| FlowResult {
            src_namespace: row.src_namespace.to_string(),
            src_service: row.src_service.to_string(),
            dst_namespace: row.dst_namespace.to_string(),
            dst_service: row.dst_service.to_string(),
            dst_external: row.dst_external.to_string(),
            transfer_type: row.transfer_type,
            total_bytes: 0,
            total_packets: 0,
            event_count: 0,
        });
        entry.total_bytes += event.total_bytes();
        entry.total_packets += event.total_packets();
        entry.event_count += 1;
    }

    let mut results: Vec<FlowResult> = grouped.into_values().collect();
    results.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
    results.truncate(query.limit);
    results
}
