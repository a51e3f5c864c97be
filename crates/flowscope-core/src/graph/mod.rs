//! Live service dependency graph built from transfer flows
//!
//! Nodes are workloads (and external addresses), edges are directed
//! transfer relationships. The graph only ever grows: repeated flows
//! between the same pair accumulate into the same edge.

mod engine;
mod transfer_graph;

pub use engine::GraphEngine;
pub use transfer_graph::{
    Edge, EdgeView, GraphSnapshot, GraphStats, NodeView, ServiceNode, TransferGraph,
    EXTERNAL_PREFIX, UNKNOWN_NODE,
};

/// Edge id for an ordered node pair
pub fn edge_id(source_id: &str, destination_id: &str) -> String {
    format!("{}→{}", source_id, destination_id)
}
