//! Workload identity resolution
//!
//! Resolution runs upstream of the ingestion queue: events arrive with
//! endpoint identities already filled in where the resolver knows the IP.

use crate::models::{ServiceIdentity, TransferEvent};
use dashmap::DashMap;

/// Maps a network address to the workload that owns it
pub trait IdentityResolver: Send + Sync {
    fn lookup(&self, ip: &str) -> Option<ServiceIdentity>;
}

/// Resolver backed by an explicitly maintained IP table
#[derive(Default)]
pub struct StaticIdentityResolver {
    entries: DashMap<String, ServiceIdentity>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ip: impl Into<String>, identity: ServiceIdentity) {
        self.entries.insert(ip.into(), identity);
    }

    pub fn remove(&self, ip: &str) -> Option<ServiceIdentity> {
        self.entries.remove(ip).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn lookup(&self, ip: &str) -> Option<ServiceIdentity> {
        self.entries.get(ip).map(|r| r.clone())
    }
}

/// Fill in missing endpoint identities; existing identities are kept
pub fn enrich_event(event: &mut TransferEvent, resolver: &dyn IdentityResolver) {
    if event.source.identity.is_none() {
        event.source.identity = resolver.lookup(&event.source.ip);
    }
    if event.destination.identity.is_none() && !event.destination.is_internet {
        event.destination.identity = resolver.lookup(&event.destination.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Endpoint;
    use chrono::Utc;

    #[test]
    fn test_enrich_fills_missing_identities() {
        let resolver = StaticIdentityResolver::new();
        resolver.insert("10.0.0.1", ServiceIdentity::new("prod", "orders"));
        resolver.insert("10.0.0.2", ServiceIdentity::new("prod", "db"));

        let mut event = TransferEvent::new(
            Endpoint::new("10.0.0.1", 40000),
            Endpoint::new("10.0.0.2", 5432),
            Utc::now(),
        );
        enrich_event(&mut event, &resolver);

        assert_eq!(event.source.identity.unwrap().full_name(), "prod/orders");
        assert_eq!(event.destination.identity.unwrap().full_name(), "prod/db");
    }

    #[test]
    fn test_enrich_skips_internet_and_unknown() {
        let resolver = StaticIdentityResolver::new();
        resolver.insert("52.1.1.1", ServiceIdentity::new("prod", "should-not-match"));

        let mut event = TransferEvent::new(
            Endpoint::new("10.9.9.9", 40000),
            Endpoint::internet("52.1.1.1", 443),
            Utc::now(),
        );
        enrich_event(&mut event, &resolver);

        assert!(event.source.identity.is_none());
        assert!(event.destination.identity.is_none());
    }
}
