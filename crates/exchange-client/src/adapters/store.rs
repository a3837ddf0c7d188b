//! Event stores.
//!
//! The file store appends each payload as a newline-terminated fragment.
//! Nothing is ever rewritten or compacted.

use crate::error::PersistenceError;
use crate::ports::EventStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Appends payloads to a local file.
#[derive(Debug, Clone)]
pub struct FileEventStore {
    path: PathBuf,
}

impl FileEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, payload: &[u8]) -> Result<(), PersistenceError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        let mut fragment = Vec::with_capacity(payload.len() + 1);
        fragment.extend_from_slice(payload);
        fragment.push(b'\n');

        file.write_all(&fragment).await.map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;

        debug!(path = %self.path.display(), bytes = payload.len(), "Payload appended to store");
        Ok(())
    }
}

/// Keeps appended payloads in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    entries: Arc<Mutex<Vec<Vec<u8>>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of appended payloads, oldest first.
    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Make subsequent appends fail.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, payload: &[u8]) -> Result<(), PersistenceError> {
        if *self.failing.lock() {
            return Err(PersistenceError::Unavailable("store marked failing".into()));
        }
        self.entries.lock().push(payload.to_vec());
        Ok(())
    }
}
