//! Processed message ledger.
//!
//! In-memory, append-only set of business message ids that have been
//! handed to the processor successfully. Not durable and never evicted.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Shared set of processed business message ids.
#[derive(Debug, Clone, Default)]
pub struct ProcessedMessageLedger {
    seen: Arc<Mutex<HashSet<String>>>,
}

impl ProcessedMessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `message_id` was already processed.
    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.lock().contains(message_id)
    }

    /// Record `message_id`. Returns false if it was already present.
    pub fn mark_processed(&self, message_id: &str) -> bool {
        self.seen.lock().insert(message_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}
