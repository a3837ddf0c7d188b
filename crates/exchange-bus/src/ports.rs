//! # Transport Ports
//!
//! The broker seam used by the connection manager. A `BrokerConnector`
//! opens an authenticated session and hands back its single
//! `BrokerChannel`; closing the channel closes the session.

use crate::error::TransportError;
use async_trait::async_trait;
use exchange_types::{Delivery, DeliveryTag, MessageProperties, ReturnedMessage};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// SASL mechanism presenting an externally established identity.
pub const SASL_EXTERNAL: &str = "EXTERNAL";

/// TLS settings for the broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Negotiate TLS.
    pub enabled: bool,
    /// Server name to verify; defaults to the host.
    pub server_name: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            server_name: None,
        }
    }
}

/// SASL response handed to the broker's authentication challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub mechanism: String,
    pub response: String,
}

impl SaslCredentials {
    /// EXTERNAL mechanism whose response is the decoded bearer assertion.
    pub fn external(decoded_token: impl Into<String>) -> Self {
        Self {
            mechanism: SASL_EXTERNAL.to_string(),
            response: decoded_token.into(),
        }
    }
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("mechanism", &self.mechanism)
            .field("response", &format_args!("<{} bytes>", self.response.len()))
            .finish()
    }
}

/// Everything needed to open one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub tls: TlsSettings,
    pub sasl: SaslCredentials,
    pub connection_timeout: Duration,
}

impl ConnectParams {
    /// Endpoint for logs; never includes credentials.
    pub fn endpoint(&self) -> String {
        let scheme = if self.tls.enabled { "amqps" } else { "amqp" };
        format!("{}://{}:{}/{}", scheme, self.host, self.port, self.virtual_host)
    }
}

/// Receives mandatory publishes the broker could not route.
pub trait ReturnListener: Send + Sync {
    fn on_return(&self, returned: &ReturnedMessage);
}

/// Port: open authenticated broker sessions
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams)
        -> Result<Box<dyn BrokerChannel>, TransportError>;
}

/// An open channel on an authenticated session.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Publish a message. `mandatory` asks the broker to return it to the
    /// return listener when no queue accepts it.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Start consuming `queue` with manual acknowledgement. The direct-reply
    /// pseudo-queue is consumed without acknowledgement.
    async fn consume(&mut self, queue: &str) -> Result<(), TransportError>;

    /// Wait for the next delivery on any consumer of this channel.
    ///
    /// Cancel safe: dropping the future loses no delivery. Fails with a
    /// transport error once the channel is gone.
    async fn next_delivery(&mut self) -> Result<Delivery, TransportError>;

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), TransportError>;

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    fn set_return_listener(&mut self, listener: Arc<dyn ReturnListener>);

    /// Close the channel and its session.
    async fn close(&mut self) -> Result<(), TransportError>;
}
