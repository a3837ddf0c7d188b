//! # Broker Envelope
//!
//! Message properties and deliveries as they cross the broker boundary.
//!
//! A `Delivery` may arrive without properties at all; consumers treat that
//! as malformed framing rather than as an empty message.

use crate::ids::{CorrelationId, DeliveryTag, TransactionId};
use crate::{TOKEN_HEADER, TRANSACTION_HEADER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transport-level properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Correlation id as carried on the wire.
    pub correlation_id: Option<String>,

    /// Business message id, carried as the transport message id.
    pub message_id: Option<String>,

    /// Reply address for request/reply exchanges.
    pub reply_to: Option<String>,

    /// String headers (`token`, `transaction_id`, ...).
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Properties for an outbound request of one publish attempt.
    pub fn for_request(
        correlation_id: CorrelationId,
        transaction_id: TransactionId,
        message_id: &str,
        reply_to: &str,
        decoded_token: &str,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(TOKEN_HEADER.to_string(), decoded_token.to_string());
        headers.insert(TRANSACTION_HEADER.to_string(), transaction_id.to_string());

        Self {
            correlation_id: Some(correlation_id.to_string()),
            message_id: Some(message_id.to_string()),
            reply_to: Some(reply_to.to_string()),
            headers,
        }
    }

    /// Properties for a reply to the given request.
    pub fn reply_to_request(request: &MessageProperties) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            message_id: request.message_id.clone(),
            reply_to: None,
            headers: BTreeMap::new(),
        }
    }

    /// Get a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Business message id, treating an empty string as absent.
    pub fn business_id(&self) -> Option<&str> {
        self.message_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Whether the carried correlation id equals `expected`.
    pub fn correlates_with(&self, expected: CorrelationId) -> bool {
        self.correlation_id
            .as_deref()
            .and_then(|raw| CorrelationId::parse(raw).ok())
            .is_some_and(|id| id == expected)
    }
}

/// One message handed to a consumer by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag used to ack or nack this delivery on its channel.
    pub delivery_tag: DeliveryTag,

    /// Message properties; `None` when the frame carried none.
    pub properties: Option<MessageProperties>,

    /// Raw payload.
    pub body: Vec<u8>,

    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
}

/// A mandatory publish the broker could not route to any queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    /// AMQP reply code (312 = NO_ROUTE).
    pub reply_code: u16,

    /// Broker reply text.
    pub reply_text: String,

    /// Target exchange.
    pub exchange: String,

    /// Routing key used.
    pub routing_key: String,

    /// Properties of the returned message.
    pub properties: MessageProperties,

    /// Returned payload.
    pub body: Vec<u8>,
}
