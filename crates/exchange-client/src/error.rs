//! Error types for the exchange client

use crate::config::ConfigError;
use exchange_bus::TransportError;
use exchange_types::TransactionId;
use std::path::PathBuf;
use thiserror::Error;
use token_cache::{TokenAcquisitionError, TokenDecodeError};

/// Result type alias for publish operations
pub type PublishResult<T> = std::result::Result<T, PublishError>;

/// Result type alias for consume operations
pub type ConsumeResult<T> = std::result::Result<T, ConsumeError>;

/// Failures of one logical publish.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The token service could not supply a token
    #[error("Token acquisition failed: {0}")]
    TokenAcquisition(#[from] TokenAcquisitionError),

    /// The cached token could not be presented to the broker
    #[error("Token could not be decoded: {0}")]
    TokenDecode(#[from] TokenDecodeError),

    /// Every attempt timed out, failed in transport, or needed renewal
    #[error("Publish {transaction_id} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Transaction shared by all attempts
        transaction_id: TransactionId,
        /// Attempts made
        attempts: u32,
        /// Outcome of the final attempt
        last: String,
    },

    /// The exchange answered with a terminal status
    #[error("Publish rejected with status {status}: {message}")]
    BusinessFailure {
        /// Status code from the reply
        status: i64,
        /// Free text from the reply
        message: String,
    },

    /// The reply payload carried no readable status
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// The sent event could not be recorded
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PublishError {
    /// Check if a later publish of the same event may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RetryExhausted { .. }
                | Self::TokenAcquisition(TokenAcquisitionError::Unreachable { .. })
        )
    }
}

/// Failures of a consume run.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The token service could not supply a token
    #[error("Token acquisition failed: {0}")]
    TokenAcquisition(#[from] TokenAcquisitionError),

    /// The cached token could not be presented to the broker
    #[error("Token could not be decoded: {0}")]
    TokenDecode(#[from] TokenDecodeError),

    /// The processor failed; the delivery stays unacknowledged
    #[error("Processor failed for message {message_id}: {reason}")]
    Processor {
        /// Business id of the delivery
        message_id: String,
        /// Processor error text
        reason: String,
    },

    /// A received payload could not be recorded
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConsumeError {
    /// Check if rerunning the consumer may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Processor { .. }
                | Self::TokenAcquisition(TokenAcquisitionError::Unreachable { .. })
        )
    }
}

/// Store append failure
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to append to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one publish attempt that did not produce a usable reply.
///
/// Internal to the publish loop; every variant is retried within the
/// attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// No correlated reply before the deadline
    #[error("No reply within {timeout_ms} ms")]
    ReplyTimeout { timeout_ms: u64 },

    /// Status 41
    #[error("Token expired")]
    AuthExpired,

    /// Send or receive failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}
