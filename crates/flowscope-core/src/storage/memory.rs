//! In-memory event store

use super::{aggregate_events, FlowQuery, FlowResult, FlowStore, StorageError};
use crate::models::TransferEvent;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Default maximum number of retained events
const DEFAULT_MAX_EVENTS: usize = 1_000_000;

/// Event store backed by a bounded vector
///
/// Oldest events are evicted first once `max_events` is reached.
pub struct MemoryStore {
    events: RwLock<Vec<TransferEvent>>,
    max_events: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events,
        }
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn insert_events(&self, events: &[TransferEvent]) -> Result<(), StorageError> {
        let mut stored = self.events.write().await;
        stored.extend_from_slice(events);

        if stored.len() > self.max_events {
            let overflow = stored.len() - self.max_events;
            stored.drain(..overflow);
        }
        Ok(())
    }

    async fn query_flows(&self, query: &FlowQuery) -> Result<Vec<FlowResult>, StorageError> {
        let stored = self.events.read().await;
        Ok(aggregate_events(stored.iter(), query))
    }
}
