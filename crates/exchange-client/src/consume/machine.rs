//! Consume slot state machine and delivery classification.
//!
//! One slot is one message the consumer intends to handle. A slot waits for
//! a delivery, classifies it, and ends once the delivery is acknowledged or
//! rejected. Timeouts, malformed deliveries and transport failures each use
//! one attempt of the slot budget.

use crate::ledger::ProcessedMessageLedger;
use exchange_bus::TransportError;
use exchange_types::{Delivery, DeliveryTag};
use tracing::debug;

/// How a received delivery must be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// No properties at all; retried within the slot budget
    Malformed,
    /// Properties without a business message id; nack without requeue
    Reject,
    /// Already processed; acknowledge again without processing
    Reacknowledge { message_id: String },
    /// New id; persist, process, record, acknowledge
    Process { message_id: String },
}

/// Classify `delivery` against the ledger.
pub fn classify(delivery: &Delivery, ledger: &ProcessedMessageLedger) -> Disposition {
    let Some(properties) = delivery.properties.as_ref() else {
        return Disposition::Malformed;
    };
    match properties.business_id() {
        None => Disposition::Reject,
        Some(id) if ledger.contains(id) => Disposition::Reacknowledge {
            message_id: id.to_string(),
        },
        Some(id) => Disposition::Process {
            message_id: id.to_string(),
        },
    }
}

/// How a slot ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// New event processed and acknowledged
    Processed { message_id: String },
    /// Known event acknowledged again
    Duplicate { message_id: String },
    /// Delivery without business id, nacked without requeue
    Rejected { delivery_tag: DeliveryTag },
}

/// Slot state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    WaitMessage { attempt: u32 },
    Reconnect { attempt: u32 },
    Done(SlotOutcome),
    Exhausted { attempts: u32 },
}

impl SlotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Exhausted { .. })
    }
}

/// What happened during one wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    TimedOut,
    Malformed,
    TransportFailed(TransportError),
    Handled(SlotOutcome),
}

/// State machine for one message slot.
#[derive(Debug, Clone)]
pub struct SlotMachine {
    slot: u32,
    budget: u32,
    state: SlotState,
}

impl SlotMachine {
    /// `budget` must be at least 1.
    pub fn new(slot: u32, budget: u32) -> Self {
        Self {
            slot,
            budget: budget.max(1),
            state: SlotState::WaitMessage { attempt: 1 },
        }
    }

    pub fn state(&self) -> &SlotState {
        &self.state
    }

    /// Result of waiting in `WaitMessage`.
    pub fn record(&mut self, event: SlotEvent) {
        let SlotState::WaitMessage { attempt } = self.state else {
            debug!(slot = self.slot, state = ?self.state, "Slot event outside WaitMessage ignored");
            return;
        };

        self.state = match event {
            SlotEvent::Handled(outcome) => SlotState::Done(outcome),
            SlotEvent::TimedOut | SlotEvent::Malformed => self.next_wait(attempt),
            SlotEvent::TransportFailed(_) if attempt >= self.budget => {
                SlotState::Exhausted { attempts: attempt }
            }
            SlotEvent::TransportFailed(_) => SlotState::Reconnect { attempt },
        };
        debug!(slot = self.slot, state = ?self.state, "Slot transition");
    }

    /// Session reopened.
    pub fn record_reconnected(&mut self) {
        if let SlotState::Reconnect { attempt } = self.state {
            self.state = SlotState::WaitMessage {
                attempt: attempt + 1,
            };
        }
    }

    /// Reopen failed; counts as a failure of the next attempt.
    pub fn record_reconnect_failure(&mut self) {
        if let SlotState::Reconnect { attempt } = self.state {
            let next = attempt + 1;
            self.state = if next >= self.budget {
                SlotState::Exhausted { attempts: next }
            } else {
                SlotState::Reconnect { attempt: next }
            };
        }
    }

    fn next_wait(&self, attempt: u32) -> SlotState {
        if attempt >= self.budget {
            SlotState::Exhausted { attempts: attempt }
        } else {
            SlotState::WaitMessage {
                attempt: attempt + 1,
            }
        }
    }
}
