//! # Exchange Client
//!
//! Authenticated publish/consume client for a message distributor reached
//! through an AMQP-style broker.
//!
//! ## Purpose
//!
//! - Acquire short-lived bearer tokens and keep them cached per resource
//! - Open broker sessions authenticated by the current token (SASL EXTERNAL)
//! - Publish events and wait for a correlated reply, retrying, reconnecting
//!   and renewing the token within one attempt budget
//! - Consume events from a mailbox, skipping already processed ids and
//!   acknowledging explicitly
//!
//! ## Architecture Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Adapters (Outer)                                   │
//! │  - FileEventStore / InMemoryEventStore              │
//! │  - LoggingProcessor                                 │
//! │  - Broker connectors (exchange-bus)                 │
//! └─────────────────────────────────────────────────────┘
//!                         │
//! ┌─────────────────────────────────────────────────────┐
//! │  Workflows (Middle)                                 │
//! │  - PublishWorkflow   drives PublishMachine          │
//! │  - ConsumeWorkflow   drives SlotMachine             │
//! │  - ConnectionManager owns the session               │
//! └─────────────────────────────────────────────────────┘
//!                         │
//! ┌─────────────────────────────────────────────────────┐
//! │  Pure Logic (Inner)                                 │
//! │  - State transitions, delivery classification       │
//! │  - Reply decoding, processed message ledger         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! 1. **One Transaction**: all attempts of a publish share a transaction id
//! 2. **Fresh Correlation**: each attempt has its own correlation id and
//!    only the matching reply is accepted
//! 3. **Persist Once**: an accepted event is recorded exactly once
//! 4. **Bounded Retries**: timeouts, transport failures and renewals all
//!    draw from the same budget
//! 5. **Idempotent Consume**: a ledger id is acknowledged again, never
//!    reprocessed
//! 6. **Closed On Exit**: every workflow run closes its session
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! let issuer = Arc::new(RestTokenIssuer::new(&config.identity.token_service_url)?);
//! let context = ExchangeContext::new(config, Arc::new(TokenCache::new(issuer)));
//! let workflow = PublishWorkflow::new(context, connector, Arc::new(store));
//! let receipt = workflow.publish(Event::new(id, payload), PublishOptions::default()).await?;
//! ```

#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adapters;
pub mod config;
pub mod connection;
pub mod consume;
pub mod context;
pub mod error;
pub mod ledger;
pub mod ports;
pub mod publish;
pub mod reply;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use adapters::{FileEventStore, InMemoryEventStore, LoggingProcessor};
pub use config::{
    BrokerConfig, ConfigError, ConsumeConfig, ExchangeConfig, IdentityConfig, PublishConfig,
    StoreConfig,
};
pub use connection::{ConnectionManager, ConsumerSetup};
pub use consume::{
    classify, ConsumeReport, ConsumeWorkflow, Disposition, SlotMachine, SlotOutcome, SlotState,
    StopReason,
};
pub use context::{ExchangeContext, TokenSource};
pub use error::{
    AttemptFailure, ConsumeError, ConsumeResult, PersistenceError, PublishError, PublishResult,
};
pub use ledger::ProcessedMessageLedger;
pub use ports::{EventStore, Processor, ProcessorError};
pub use publish::{
    PublishFailure, PublishMachine, PublishOptions, PublishReceipt, PublishState, PublishWorkflow,
    UndeliverableLogger,
};
pub use reply::{ReplyDecodeError, ReplyOutcome};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
