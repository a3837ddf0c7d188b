//! Publish State Machine
//!
//! Pure transitions of one logical publish. No I/O happens here; the
//! workflow performs the action a state asks for and reports the result.
//!
//! ## States
//!
//! - **Build**: transaction id assigned, no session yet
//! - **Send**: publish attempt `n` on the open session
//! - **AwaitReply**: waiting for the reply correlated with attempt `n`
//! - **Persist**: status 20 received, sent event must be recorded
//! - **RenewToken**: status 41 received, token must be renewed
//! - **Retry**: timeout or transport failure, reconnect before attempt `n + 1`
//! - **Success** / **Fail**: terminal
//!
//! Every 41 is answered with one renewal, even on the last attempt. The
//! renewed token then waits in `Retry` for the next attempt if the shared
//! budget still has one.
//!
//! ## Usage
//!
//! ```ignore
//! let mut machine = PublishMachine::new(TransactionId::new(), 3);
//! machine.record_opened();
//! loop {
//!     match machine.state().clone() {
//!         PublishState::Send { attempt } => { /* publish */ machine.record_sent(correlation_id); }
//!         PublishState::AwaitReply { .. } => { /* wait */ machine.record_timeout(timeout_ms); }
//!         PublishState::Success | PublishState::Fail(_) => break,
//!         _ => { /* reconnect, persist */ }
//!     }
//! }
//! ```

use crate::error::AttemptFailure;
use crate::reply::ReplyOutcome;
use exchange_bus::TransportError;
use exchange_types::{CorrelationId, ReplyStatus, TransactionId};
use tracing::{debug, warn};

/// Publish state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    Build,
    Send { attempt: u32 },
    AwaitReply { attempt: u32, correlation_id: CorrelationId },
    Persist { attempt: u32 },
    RenewToken { attempt: u32 },
    Retry { attempt: u32, reason: AttemptFailure },
    Success { attempt: u32 },
    Fail(PublishFailure),
}

impl PublishState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Fail(_))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Send { .. } => "send",
            Self::AwaitReply { .. } => "await_reply",
            Self::Persist { .. } => "persist",
            Self::RenewToken { .. } => "renew_token",
            Self::Retry { .. } => "retry",
            Self::Success { .. } => "success",
            Self::Fail(_) => "fail",
        }
    }
}

/// Terminal failure of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishFailure {
    /// Budget spent on retryable outcomes
    RetryExhausted { attempts: u32, last: AttemptFailure },
    /// Non-success status from the exchange
    Business { status: i64, message: String },
    /// Reply without a readable status
    MalformedReply(String),
}

/// State machine for one logical publish.
#[derive(Debug, Clone)]
pub struct PublishMachine {
    transaction_id: TransactionId,
    attempt_budget: u32,
    renewals: u32,
    state: PublishState,
}

impl PublishMachine {
    /// `attempt_budget` must be at least 1.
    pub fn new(transaction_id: TransactionId, attempt_budget: u32) -> Self {
        Self {
            transaction_id,
            attempt_budget: attempt_budget.max(1),
            renewals: 0,
            state: PublishState::Build,
        }
    }

    pub fn state(&self) -> &PublishState {
        &self.state
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Token renewals requested so far.
    pub fn renewals(&self) -> u32 {
        self.renewals
    }

    /// Attempt number of the current state; 0 before the first send.
    pub fn attempt(&self) -> u32 {
        match &self.state {
            PublishState::Build => 0,
            PublishState::Send { attempt }
            | PublishState::AwaitReply { attempt, .. }
            | PublishState::Persist { attempt }
            | PublishState::RenewToken { attempt }
            | PublishState::Retry { attempt, .. }
            | PublishState::Success { attempt } => *attempt,
            PublishState::Fail(PublishFailure::RetryExhausted { attempts, .. }) => *attempts,
            PublishState::Fail(_) => 0,
        }
    }

    /// Initial session is open.
    pub fn record_opened(&mut self) {
        match self.state {
            PublishState::Build => self.transition(PublishState::Send { attempt: 1 }),
            _ => self.unexpected("opened"),
        }
    }

    /// Request published with `correlation_id`.
    pub fn record_sent(&mut self, correlation_id: CorrelationId) {
        match self.state {
            PublishState::Send { attempt } => self.transition(PublishState::AwaitReply {
                attempt,
                correlation_id,
            }),
            _ => self.unexpected("sent"),
        }
    }

    /// Open, send or receive failed.
    pub fn record_transport_failure(&mut self, error: TransportError) {
        let attempt = match self.state {
            PublishState::Build => 1,
            PublishState::Send { attempt } | PublishState::AwaitReply { attempt, .. } => attempt,
            _ => return self.unexpected("transport_failure"),
        };
        self.attempt_failed(attempt, AttemptFailure::Transport(error));
    }

    /// No correlated reply before the deadline.
    pub fn record_timeout(&mut self, timeout_ms: u64) {
        match self.state {
            PublishState::AwaitReply { attempt, .. } => {
                self.attempt_failed(attempt, AttemptFailure::ReplyTimeout { timeout_ms })
            }
            _ => self.unexpected("timeout"),
        }
    }

    /// Correlated reply decoded.
    pub fn record_reply(&mut self, outcome: ReplyOutcome) {
        let attempt = match self.state {
            PublishState::AwaitReply { attempt, .. } => attempt,
            _ => return self.unexpected("reply"),
        };
        match outcome.status {
            ReplyStatus::Success => self.transition(PublishState::Persist { attempt }),
            ReplyStatus::TokenExpired => self.attempt_failed(attempt, AttemptFailure::AuthExpired),
            ReplyStatus::Other(status) => {
                self.transition(PublishState::Fail(PublishFailure::Business {
                    status,
                    message: outcome.message,
                }))
            }
        }
    }

    /// Correlated reply could not be decoded.
    pub fn record_malformed_reply(&mut self, reason: impl Into<String>) {
        match self.state {
            PublishState::AwaitReply { .. } => {
                self.transition(PublishState::Fail(PublishFailure::MalformedReply(reason.into())))
            }
            _ => self.unexpected("malformed_reply"),
        }
    }

    /// Sent event recorded.
    pub fn record_persisted(&mut self) {
        match self.state {
            PublishState::Persist { attempt } => self.transition(PublishState::Success { attempt }),
            _ => self.unexpected("persisted"),
        }
    }

    /// Fresh token obtained after a 41.
    pub fn record_renewed(&mut self) {
        match self.state {
            PublishState::RenewToken { attempt } => {
                self.renewals += 1;
                self.exhaust_or(attempt, AttemptFailure::AuthExpired);
            }
            _ => self.unexpected("renewed"),
        }
    }

    /// Session reopened after a retry or renewal.
    pub fn record_reconnected(&mut self) {
        match self.state {
            PublishState::Retry { attempt, .. } => self.transition(PublishState::Send {
                attempt: attempt + 1,
            }),
            _ => self.unexpected("reconnected"),
        }
    }

    /// Reopen failed; counts as a failure of the next attempt.
    pub fn record_reconnect_failure(&mut self, error: TransportError) {
        match self.state {
            PublishState::Retry { attempt, .. } => {
                self.attempt_failed(attempt + 1, AttemptFailure::Transport(error))
            }
            _ => self.unexpected("reconnect_failure"),
        }
    }

    fn attempt_failed(&mut self, attempt: u32, reason: AttemptFailure) {
        if reason == AttemptFailure::AuthExpired {
            self.transition(PublishState::RenewToken { attempt });
        } else {
            self.exhaust_or(attempt, reason);
        }
    }

    /// `Retry` while attempts remain, `RetryExhausted` otherwise.
    fn exhaust_or(&mut self, attempt: u32, reason: AttemptFailure) {
        if attempt >= self.attempt_budget {
            self.transition(PublishState::Fail(PublishFailure::RetryExhausted {
                attempts: attempt,
                last: reason,
            }));
        } else {
            self.transition(PublishState::Retry { attempt, reason });
        }
    }

    fn transition(&mut self, next: PublishState) {
        debug!(
            transaction_id = %self.transaction_id,
            from = self.state.name(),
            to = next.name(),
            "Publish transition"
        );
        self.state = next;
    }

    fn unexpected(&self, event: &'static str) {
        warn!(
            transaction_id = %self.transaction_id,
            state = self.state.name(),
            event,
            "Ignoring event not valid in current state"
        );
    }
}
