//! Transfer graph storage and queries
//!
//! The whole graph sits behind a single reader/writer lock. Flows arrive at
//! window granularity rather than per packet, so one lock over the node,
//! edge and external-node maps is enough.

use super::edge_id;
use crate::models::{ServiceIdentity, TransferFlow, TransferType};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Prefix of external node ids
pub const EXTERNAL_PREFIX: &str = "external:";

/// Destination id used when a flow names neither a service nor an endpoint
pub const UNKNOWN_NODE: &str = "unknown";

/// Graph vertex
#[derive(Debug, Clone)]
pub struct ServiceNode {
    pub id: String,
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub team: String,
    pub region: String,
    pub external: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_connections: u64,
    pub total_cost_usd: f64,
    /// Outgoing neighbor id -> edge id
    pub neighbors: HashMap<String, String>,
}

impl ServiceNode {
    fn from_identity(id: String, identity: &ServiceIdentity, seen: DateTime<Utc>) -> Self {
        Self {
            id,
            namespace: identity.namespace.clone(),
            name: identity.name.clone(),
            kind: identity.kind.clone(),
            team: identity.team.clone(),
            region: identity.region.clone(),
            external: false,
            first_seen: seen,
            last_seen: seen,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            total_connections: 0,
            total_cost_usd: 0.0,
            neighbors: HashMap::new(),
        }
    }

    fn external(id: String, ip: &str, seen: DateTime<Utc>) -> Self {
        Self {
            id,
            namespace: "external".to_string(),
            name: ip.to_string(),
            kind: String::new(),
            team: String::new(),
            region: String::new(),
            external: true,
            first_seen: seen,
            last_seen: seen,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            total_connections: 0,
            total_cost_usd: 0.0,
            neighbors: HashMap::new(),
        }
    }

    fn touch(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        if start < self.first_seen {
            self.first_seen = start;
        }
        if end > self.last_seen {
            self.last_seen = end;
        }
    }
}

/// Directed transfer relationship
#[derive(Debug, Clone)]
pub struct Edge {
    pub source_id: String,
    pub destination_id: String,
    pub transfer_type: TransferType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub total_events: u64,
    pub total_cost_usd: f64,
}

impl Edge {
    pub fn id(&self) -> String {
        edge_id(&self.source_id, &self.destination_id)
    }
}

/// Serializable node view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub external: bool,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_connections: u64,
    pub total_cost_usd: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl From<&ServiceNode> for NodeView {
    fn from(n: &ServiceNode) -> Self {
        Self {
            id: n.id.clone(),
            namespace: n.namespace.clone(),
            name: n.name.clone(),
            kind: n.kind.clone(),
            external: n.external,
            total_bytes_sent: n.total_bytes_sent,
            total_bytes_received: n.total_bytes_received,
            total_connections: n.total_connections,
            total_cost_usd: n.total_cost_usd,
            first_seen: n.first_seen,
            last_seen: n.last_seen,
        }
    }
}

/// Serializable edge view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeView {
    pub source: String,
    pub target: String,
    pub transfer_type: TransferType,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub total_events: u64,
    pub cost_usd: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl From<&Edge> for EdgeView {
    fn from(e: &Edge) -> Self {
        Self {
            source: e.source_id.clone(),
            target: e.destination_id.clone(),
            transfer_type: e.transfer_type,
            total_bytes: e.total_bytes,
            total_packets: e.total_packets,
            total_events: e.total_events,
            cost_usd: e.total_cost_usd,
            first_seen: e.first_seen,
            last_seen: e.last_seen,
        }
    }
}

/// Aggregate graph statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_external_nodes: usize,
    pub total_edges: usize,
    pub total_bytes: u64,
    pub egress_bytes: u64,
    pub cross_region_bytes: u64,
    pub total_cost_usd: f64,
}

impl GraphStats {
    /// Internal and external nodes together
    pub fn all_nodes(&self) -> usize {
        self.total_nodes + self.total_external_nodes
    }
}

/// Point-in-time copy of a graph or subgraph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeView>,
    pub edges: Vec<EdgeView>,
    pub stats: GraphStats,
}

impl GraphSnapshot {
    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn contains_edge(&self, source: &str, target: &str) -> bool {
        self.edges.iter().any(|e| e.source == source && e.target == target)
    }
}

#[derive(Debug, Default)]
struct GraphInner {
    nodes: HashMap<String, ServiceNode>,
    edges: HashMap<String, Edge>,
    external_nodes: HashMap<String, ServiceNode>,
}

impl GraphInner {
    fn node(&self, id: &str) -> Option<&ServiceNode> {
        self.nodes.get(id).or_else(|| self.external_nodes.get(id))
    }

    fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            total_nodes: self.nodes.len(),
            total_external_nodes: self.external_nodes.len(),
            total_edges: self.edges.len(),
            ..Default::default()
        };

        for edge in self.edges.values() {
            stats.total_bytes += edge.total_bytes;
            stats.total_cost_usd += edge.total_cost_usd;
            match edge.transfer_type {
                TransferType::Egress => stats.egress_bytes += edge.total_bytes,
                TransferType::CrossRegion => stats.cross_region_bytes += edge.total_bytes,
                _ => {}
            }
        }
        stats
    }

    fn node_entry<'a>(
        nodes: &'a mut HashMap<String, ServiceNode>,
        identity: &ServiceIdentity,
        seen: DateTime<Utc>,
    ) -> (String, &'a mut ServiceNode) {
        let id = identity.full_name();
        let node = nodes
            .entry(id.clone())
            .or_insert_with(|| ServiceNode::from_identity(id.clone(), identity, seen));
        (id, node)
    }
}

/// Concurrently readable transfer graph
#[derive(Debug, Default)]
pub struct TransferGraph {
    inner: RwLock<GraphInner>,
}

impl TransferGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate a flow with no attributed cost
    pub fn add_flow(&self, flow: &TransferFlow) {
        self.add_flow_with_cost(flow, 0.0);
    }

    /// Accumulate a flow and its attributed cost into nodes and edge
    pub fn add_flow_with_cost(&self, flow: &TransferFlow, cost_usd: f64) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let (src_id, src_node) =
            GraphInner::node_entry(&mut inner.nodes, &flow.source_identity, flow.window_start);
        src_node.total_bytes_sent += flow.total_bytes;
        src_node.total_connections += flow.event_count;
        src_node.total_cost_usd += cost_usd;
        src_node.touch(flow.window_start, flow.window_end);

        let dst_id = if let Some(ref identity) = flow.destination_identity {
            let (dst_id, dst_node) =
                GraphInner::node_entry(&mut inner.nodes, identity, flow.window_start);
            dst_node.total_bytes_received += flow.total_bytes;
            dst_node.touch(flow.window_start, flow.window_end);
            dst_id
        } else if let Some(ref endpoint) = flow.destination_endpoint {
            let dst_id = format!("{}{}", EXTERNAL_PREFIX, endpoint.ip);
            let dst_node = inner
                .external_nodes
                .entry(dst_id.clone())
                .or_insert_with(|| {
                    ServiceNode::external(dst_id.clone(), &endpoint.ip, flow.window_start)
                });
            dst_node.total_bytes_received += flow.total_bytes;
            dst_node.touch(flow.window_start, flow.window_end);
            dst_id
        } else {
            UNKNOWN_NODE.to_string()
        };

        let id = edge_id(&src_id, &dst_id);
        let edge = inner.edges.entry(id.clone()).or_insert_with(|| Edge {
            source_id: src_id.clone(),
            destination_id: dst_id.clone(),
            transfer_type: flow.transfer_type,
            first_seen: flow.window_start,
            last_seen: flow.window_end,
            total_bytes: 0,
            total_packets: 0,
            total_events: 0,
            total_cost_usd: 0.0,
        });
        edge.total_bytes += flow.total_bytes;
        edge.total_packets += flow.total_packets;
        edge.total_events += flow.event_count;
        edge.total_cost_usd += cost_usd;
        if flow.window_start < edge.first_seen {
            edge.first_seen = flow.window_start;
        }
        if flow.window_end > edge.last_seen {
            edge.last_seen = flow.window_end;
        }

        // Re-borrow: the destination insert above may have reallocated the map.
        if let Some(src_node) = inner.nodes.get_mut(&src_id) {
            src_node.neighbors.insert(dst_id, id);
        }
    }

    /// Internal or external node by id
    pub fn node(&self, id: &str) -> Option<NodeView> {
        self.inner.read().node(id).map(NodeView::from)
    }

    pub fn edge(&self, source_id: &str, destination_id: &str) -> Option<EdgeView> {
        self.inner
            .read()
            .edges
            .get(&edge_id(source_id, destination_id))
            .map(EdgeView::from)
    }

    /// Internal nodes with the most bytes sent
    pub fn top_talkers(&self, n: usize) -> Vec<NodeView> {
        let inner = self.inner.read();
        let mut nodes: Vec<&ServiceNode> = inner.nodes.values().collect();
        nodes.sort_by(|a, b| b.total_bytes_sent.cmp(&a.total_bytes_sent));
        nodes.into_iter().take(n).map(NodeView::from).collect()
    }

    /// Edges with the most bytes
    pub fn top_edges(&self, n: usize) -> Vec<EdgeView> {
        let inner = self.inner.read();
        let mut edges: Vec<&Edge> = inner.edges.values().collect();
        edges.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
        edges.into_iter().take(n).map(EdgeView::from).collect()
    }

    pub fn egress_edges(&self) -> Vec<EdgeView> {
        self.edges_of_type(TransferType::Egress)
    }

    pub fn cross_region_edges(&self) -> Vec<EdgeView> {
        self.edges_of_type(TransferType::CrossRegion)
    }

    fn edges_of_type(&self, transfer_type: TransferType) -> Vec<EdgeView> {
        self.inner
            .read()
            .edges
            .values()
            .filter(|e| e.transfer_type == transfer_type)
            .map(EdgeView::from)
            .collect()
    }

    /// Subgraph reachable from `service_id` within `depth` outgoing hops
    ///
    /// Nodes up to `depth` hops away are included, and an edge is included
    /// when its source is fewer than `depth` hops away. An unknown start id
    /// yields an empty snapshot.
    pub fn service_graph(&self, service_id: &str, depth: usize) -> GraphSnapshot {
        let inner = self.inner.read();
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&ServiceNode, usize)> = VecDeque::new();

        if let Some(start) = inner.node(service_id) {
            visited.insert(start.id.as_str());
            queue.push_back((start, 0));
        }

        while let Some((node, hops)) = queue.pop_front() {
            nodes.push(NodeView::from(node));
            if hops >= depth {
                continue;
            }

            for (neighbor_id, edge_key) in &node.neighbors {
                if let Some(edge) = inner.edges.get(edge_key) {
                    edges.push(EdgeView::from(edge));
                }
                if visited.contains(neighbor_id.as_str()) {
                    continue;
                }
                if let Some(neighbor) = inner.node(neighbor_id) {
                    visited.insert(neighbor.id.as_str());
                    queue.push_back((neighbor, hops + 1));
                }
            }
        }

        let stats = subgraph_stats(&nodes, &edges);
        GraphSnapshot { nodes, edges, stats }
    }

    pub fn stats(&self) -> GraphStats {
        self.inner.read().stats()
    }

    /// Full copy of nodes (internal and external), edges and stats
    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.read();
        let nodes = inner
            .nodes
            .values()
            .chain(inner.external_nodes.values())
            .map(NodeView::from)
            .collect();
        let edges = inner.edges.values().map(EdgeView::from).collect();
        GraphSnapshot {
            nodes,
            edges,
            stats: inner.stats(),
        }
    }
}

fn subgraph_stats(nodes: &[NodeView], edges: &[EdgeView]) -> GraphStats {
    let mut stats = GraphStats {
        total_nodes: nodes.iter().filter(|n| !n.external).count(),
        total_external_nodes: nodes.iter().filter(|n| n.external).count(),
        total_edges: edges.len(),
        ..Default::default()
    };
    for edge in edges {
        stats.total_bytes += edge.total_bytes;
        stats.total_cost_usd += edge.cost_usd;
        match edge.transfer_type {
            TransferType::Egress => stats.egress_bytes += edge.total_bytes,
            TransferType::CrossRegion => stats.cross_region_bytes += edge.total_bytes,
            _ => {}
        }
    }
    stats
}
