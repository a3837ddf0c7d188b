//! Processor that only logs what it receives.

use crate::ports::{Processor, ProcessorError};
use async_trait::async_trait;
use tracing::info;

/// Logs each event and accepts it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProcessor;

#[async_trait]
impl Processor for LoggingProcessor {
    async fn process(&self, message_id: &str, payload: &[u8]) -> Result<(), ProcessorError> {
        info!(
            message_id,
            payload = %String::from_utf8_lossy(payload),
            "Received event"
        );
        Ok(())
    }
}
