//! Transport errors.

use thiserror::Error;

/// Connection or channel failure.
///
/// Every variant is recovered the same way by the workflows: tear the
/// connection down and open a new one, within the attempt budget.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// TCP/TLS connection could not be established.
    #[error("Connection refused by {endpoint}: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    /// The broker rejected the SASL exchange or the virtual host.
    #[error("Access refused: {0}")]
    AccessRefused(String),

    /// TLS negotiation failed or was required but not offered.
    #[error("TLS error: {0}")]
    Tls(String),

    /// An established connection dropped.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The broker closed the channel (unknown queue, bad ack, ...).
    #[error("Channel closed by broker: {0}")]
    ChannelClosed(String),

    /// No connection is open.
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether the failure happened before any session existed.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. } | Self::AccessRefused(_) | Self::Tls(_)
        )
    }
}
