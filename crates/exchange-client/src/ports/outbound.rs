//! Outbound ports (driven side - SPI)

use crate::error::PersistenceError;
use async_trait::async_trait;
use thiserror::Error;

/// Port: append event payloads to local storage
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one payload fragment
    async fn append(&self, payload: &[u8]) -> Result<(), PersistenceError>;
}

/// Business processing failure reported by a [`Processor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProcessorError(pub String);

impl ProcessorError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Port: business processing of a received event
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handle a new event. An error leaves the delivery unacknowledged.
    async fn process(&self, message_id: &str, payload: &[u8]) -> Result<(), ProcessorError>;
}
