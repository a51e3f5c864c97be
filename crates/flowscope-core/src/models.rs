//! Core data models for transfer events, identities and flows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Classification of a network endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Pod,
    Service,
    Node,
    External,
    #[default]
    Unknown,
}

/// Classification of a data transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    PodToPod,
    PodToService,
    ServiceToService,
    Egress,
    Ingress,
    CrossAz,
    CrossRegion,
    CrossCluster,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::PodToPod => "pod_to_pod",
            TransferType::PodToService => "pod_to_service",
            TransferType::ServiceToService => "service_to_service",
            TransferType::Egress => "egress",
            TransferType::Ingress => "ingress",
            TransferType::CrossAz => "cross_az",
            TransferType::CrossRegion => "cross_region",
            TransferType::CrossCluster => "cross_cluster",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pod_to_pod" => Some(TransferType::PodToPod),
            "pod_to_service" => Some(TransferType::PodToService),
            "service_to_service" => Some(TransferType::ServiceToService),
            "egress" => Some(TransferType::Egress),
            "ingress" => Some(TransferType::Ingress),
            "cross_az" => Some(TransferType::CrossAz),
            "cross_region" => Some(TransferType::CrossRegion),
            "cross_cluster" => Some(TransferType::CrossCluster),
            _ => None,
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic direction relative to the observing sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    #[default]
    Outbound,
}

/// Identity of a Kubernetes workload
///
/// Two identities are the same workload iff their `namespace/name` match;
/// that compound key is also the graph node id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub team: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl ServiceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fully qualified `namespace/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl PartialEq for ServiceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl Eq for ServiceIdentity {}

impl Hash for ServiceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

/// A network endpoint of a transfer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "type", default)]
    pub endpoint_type: EndpointType,
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ServiceIdentity>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_provider: String,
    #[serde(default)]
    pub is_internet: bool,
    #[serde(default)]
    pub is_cloud_service: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_service_name: String,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            ..Default::default()
        }
    }

    /// External endpoint on the public internet
    pub fn internet(ip: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint_type: EndpointType::External,
            is_internet: true,
            ..Self::new(ip, port)
        }
    }

    pub fn with_identity(mut self, identity: ServiceIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Region from the endpoint itself or its resolved identity
    pub fn effective_region(&self) -> &str {
        if !self.region.is_empty() {
            return &self.region;
        }
        self.identity.as_ref().map(|i| i.region.as_str()).unwrap_or("")
    }

    /// Availability zone from the endpoint itself or its resolved identity
    pub fn effective_zone(&self) -> &str {
        if !self.availability_zone.is_empty() {
            return &self.availability_zone;
        }
        self.identity
            .as_ref()
            .map(|i| i.availability_zone.as_str())
            .unwrap_or("")
    }

    pub fn is_external(&self) -> bool {
        self.endpoint_type == EndpointType::External || self.is_internet
    }
}

/// A single observed transfer between two endpoints
///
/// Produced by the node sensor, immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub source: Endpoint,
    pub destination: Endpoint,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transfer_type: Option<TransferType>,

    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub packets_sent: u64,
    #[serde(default)]
    pub packets_received: u64,

    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ns: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl TransferEvent {
    pub fn new(source: Endpoint, destination: Endpoint, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination,
            protocol: "TCP".to_string(),
            direction: Direction::Outbound,
            transfer_type: None,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            timestamp,
            duration_ns: 0,
            http_method: None,
            http_path: None,
            http_status_code: None,
            grpc_method: None,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }

    pub fn total_packets(&self) -> u64 {
        self.packets_sent.saturating_add(self.packets_received)
    }

    pub fn is_external(&self) -> bool {
        self.source.endpoint_type == EndpointType::External
            || self.destination.endpoint_type == EndpointType::External
    }

    /// Transfer type as reported, or inferred from the endpoints
    pub fn effective_transfer_type(&self) -> TransferType {
        self.transfer_type
            .unwrap_or_else(|| classify_transfer(&self.source, &self.destination))
    }
}

/// Infer a transfer type from the two endpoints of an event
pub fn classify_transfer(source: &Endpoint, destination: &Endpoint) -> TransferType {
    if destination.is_external() {
        return TransferType::Egress;
    }
    if source.is_external() {
        return TransferType::Ingress;
    }

    let (src_region, dst_region) = (source.effective_region(), destination.effective_region());
    if !src_region.is_empty() && !dst_region.is_empty() && src_region != dst_region {
        return TransferType::CrossRegion;
    }

    let (src_zone, dst_zone) = (source.effective_zone(), destination.effective_zone());
    if !src_zone.is_empty() && !dst_zone.is_empty() && src_zone != dst_zone {
        return TransferType::CrossAz;
    }

    match (source.endpoint_type, destination.endpoint_type) {
        (EndpointType::Service, EndpointType::Service) => TransferType::ServiceToService,
        (_, EndpointType::Service) => TransferType::PodToService,
        _ => TransferType::PodToPod,
    }
}

/// Time-windowed aggregate of events between one source and one destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferFlow {
    pub id: Uuid,
    pub source_identity: ServiceIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_identity: Option<ServiceIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_endpoint: Option<Endpoint>,
    #[serde(rename = "type")]
    pub transfer_type: TransferType,

    pub total_bytes: u64,
    pub total_packets: u64,
    pub event_count: u64,

    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,

    #[serde(default)]
    pub bytes_per_second_avg: f64,
    #[serde(default)]
    pub bytes_per_second_max: f64,
    #[serde(default)]
    pub bytes_per_second_p99: f64,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_http_path: HashMap<String, u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub by_grpc_method: HashMap<String, u64>,
}

impl TransferFlow {
    /// Flow with no rate statistics, mostly useful for replay and tests
    pub fn new(
        source_identity: ServiceIdentity,
        transfer_type: TransferType,
        total_bytes: u64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_identity,
            destination_identity: None,
            destination_endpoint: None,
            transfer_type,
            total_bytes,
            total_packets: 0,
            event_count: 1,
            window_start,
            window_end,
            bytes_per_second_avg: 0.0,
            bytes_per_second_max: 0.0,
            bytes_per_second_p99: 0.0,
            by_http_path: HashMap::new(),
            by_grpc_method: HashMap::new(),
        }
    }

    pub fn to_service(mut self, destination: ServiceIdentity) -> Self {
        self.destination_identity = Some(destination);
        self.destination_endpoint = None;
        self
    }

    pub fn to_endpoint(mut self, destination: Endpoint) -> Self {
        self.destination_identity = None;
        self.destination_endpoint = Some(destination);
        self
    }

    /// Destination full name, else endpoint IP, else `unknown`
    pub fn destination_label(&self) -> String {
        if let Some(ref identity) = self.destination_identity {
            identity.full_name()
        } else if let Some(ref endpoint) = self.destination_endpoint {
            endpoint.ip.clone()
        } else {
            "unknown".to_string()
        }
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(
            self.source_identity.full_name(),
            self.destination_label(),
            self.transfer_type,
        )
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.window_end - self.window_start).num_milliseconds() as f64 / 1000.0
    }
}

/// Key of a (source, destination, transfer type) pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub source: String,
    pub destination: String,
    pub transfer_type: TransferType,
}

impl FlowKey {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        transfer_type: TransferType,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            transfer_type,
        }
    }

    /// Parse the `source→destination#type` rendering
    pub fn parse(value: &str) -> Option<Self> {
        let (pair, transfer_type) = value.rsplit_once('#')?;
        let (source, destination) = pair.split_once('→')?;
        Some(Self::new(source, destination, TransferType::parse(transfer_type)?))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}#{}", self.source, self.destination, self.transfer_type)
    }
}
