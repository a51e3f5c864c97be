//! Append-only JSON-lines event store
//!
//! Each inserted event becomes one line of JSON. Queries rescan the file,
//! which keeps the format trivially inspectable and is adequate for
//! single-node deployments and replay after restart.

use super::{aggregate_events, FlowQuery, FlowResult, FlowStore, StorageError};
use crate::models::TransferEvent;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Event store persisting to a JSON-lines file
pub struct JsonlStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    /// Open (or lazily create) the store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_events(&self) -> Result<Vec<TransferEvent>, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransferEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping malformed stored event"
                    );
                }
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl FlowStore for JsonlStore {
    async fn insert_events(&self, events: &[TransferEvent]) -> Result<(), StorageError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut payload = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut payload, event)?;
            payload.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&payload).await?;
        file.sync_data().await?;

        debug!(path = %self.path.display(), count = events.len(), "Events appended");
        Ok(())
    }

    async fn query_flows(&self, query: &FlowQuery) -> Result<Vec<FlowResult>, StorageError> {
        let events = self.load_events().await?;
        Ok(aggregate_events(events.iter(), query))
    }
}
