//! Graph replay from durable storage

use super::TransferGraph;
use crate::models::{Endpoint, ServiceIdentity, TransferFlow, TransferType};
use crate::storage::{FlowQuery, FlowResult, FlowStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// Maximum number of aggregated rows replayed per load
const REPLAY_LIMIT: usize = 100_000;

/// Owns the shared transfer graph and rebuilds it from stored events
pub struct GraphEngine {
    graph: Arc<TransferGraph>,
}

impl GraphEngine {
    pub fn new() -> Self {
        Self::with_graph(Arc::new(TransferGraph::new()))
    }

    pub fn with_graph(graph: Arc<TransferGraph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> Arc<TransferGraph> {
        self.graph.clone()
    }

    /// Replay aggregated flows stored in `[start, end)` into the graph
    ///
    /// Rows without a source service are skipped, as live aggregation skips
    /// their events. Returns the number of replayed rows.
    pub async fn load_from_storage(
        &self,
        store: &dyn FlowStore,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let rows = store
            .query_flows(&FlowQuery::new(start, end, REPLAY_LIMIT))
            .await
            .context("Failed to query stored flows for graph replay")?;

        let mut replayed = 0;
        for row in rows.iter().filter(|r| r.has_source()) {
            self.graph.add_flow(&flow_from_row(row, start, end));
            replayed += 1;
        }

        info!(
            rows = replayed,
            skipped = rows.len() - replayed,
            start = %start,
            end = %end,
            "Graph replayed from storage"
        );
        Ok(replayed)
    }
}

impl Default for GraphEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn flow_from_row(row: &FlowResult, start: DateTime<Utc>, end: DateTime<Utc>) -> TransferFlow {
    let mut flow = TransferFlow::new(
        ServiceIdentity::new(&row.src_namespace, &row.src_service),
        row.transfer_type,
        row.total_bytes,
        start,
        end,
    );
    flow.total_packets = row.total_packets;
    flow.event_count = row.event_count;

    if !row.dst_service.is_empty() {
        flow.to_service(ServiceIdentity::new(&row.dst_namespace, &row.dst_service))
    } else if !row.dst_external.is_empty() {
        let endpoint = if row.transfer_type == TransferType::Egress {
            Endpoint::internet(&row.dst_external, 0)
        } else {
            Endpoint::new(&row.dst_external, 0)
        };
        flow.to_endpoint(endpoint)
    } else {
        flow
    }
}
