//! # Exchange Types Crate
//!
//! Value types shared by every layer of the exchange client:
//!
//! - **Identifiers**: `CorrelationId` (per attempt), `TransactionId` (per
//!   logical publish), `DeliveryTag` (per broker delivery).
//! - **Envelope**: `MessageProperties` and `Delivery` as they travel over the
//!   broker, plus `ReturnedMessage` for mandatory publishes the broker could
//!   not route.
//! - **Events**: the outbound `Event` handed to the publish workflow.
//! - **Status**: `ReplyStatus`, the decoded status code of a broker reply.
//!
//! ## Envelope Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ correlation_id   fresh per attempt                   │
//! │ message_id       business message id                 │
//! │ reply_to         direct-reply pseudo-queue           │
//! │ headers.token    decoded bearer assertion            │
//! │ headers.transaction_id  stable across retries        │
//! ├──────────────────────────────────────────────────────┤
//! │ body             opaque payload bytes                │
//! └──────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod envelope;
pub mod event;
pub mod ids;
pub mod status;

pub use envelope::{Delivery, MessageProperties, ReturnedMessage};
pub use event::Event;
pub use ids::{CorrelationId, DeliveryTag, TransactionId};
pub use status::ReplyStatus;

/// Header carrying the decoded bearer assertion on every published message.
pub const TOKEN_HEADER: &str = "token";

/// Header carrying the transaction id shared by all attempts of one publish.
pub const TRANSACTION_HEADER: &str = "transaction_id";

/// Broker-provided pseudo-queue for synchronous reply correlation.
pub const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_names() {
        assert_eq!(TOKEN_HEADER, "token");
        assert_eq!(TRANSACTION_HEADER, "transaction_id");
        assert!(DIRECT_REPLY_QUEUE.starts_with("amq."));
    }
}
