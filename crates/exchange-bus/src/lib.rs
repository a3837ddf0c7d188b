//! # Exchange Bus - Broker Transport
//!
//! The seam between the exchange client and the message broker.
//!
//! ## Ports
//!
//! - `BrokerConnector`: opens a TLS session authenticated with SASL
//!   `EXTERNAL`, presenting the decoded bearer assertion as the response.
//! - `BrokerChannel`: publish, consume, ack/nack and close on that session.
//! - `ReturnListener`: side channel for unroutable mandatory publishes.
//!
//! ## Adapters
//!
//! - `AmqpConnector`: AMQP 0-9-1 over rustls against a RabbitMQ style
//!   broker. The direct-reply pseudo-queue is consumed without
//!   acknowledgement.
//! - `InMemoryBroker`: in-process broker with a virtual host, bound
//!   exchanges, mailbox queues with manual acknowledgement and redelivery,
//!   the direct-reply pseudo-queue, and fault injection.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod amqp;
pub mod error;
pub mod memory;
pub mod ports;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use error::TransportError;
pub use memory::{
    AckRecord, ExchangeResponder, InMemoryBroker, InMemoryChannel, PublishedMessage,
    QueuedMessage, Reply, ScriptedResponder, DEFAULT_VIRTUAL_HOST,
};
pub use ports::{
    BrokerChannel, BrokerConnector, ConnectParams, ReturnListener, SaslCredentials, TlsSettings,
    SASL_EXTERNAL,
};
