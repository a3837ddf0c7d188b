//! Publish workflow: drives a `PublishMachine` against the broker.

use super::machine::{PublishFailure, PublishMachine, PublishState};
use crate::connection::{ConnectionManager, ConsumerSetup};
use crate::context::ExchangeContext;
use crate::error::{PublishError, PublishResult};
use crate::ports::EventStore;
use crate::reply;
use exchange_bus::{BrokerConnector, ReturnListener};
use exchange_types::{
    CorrelationId, Event, MessageProperties, ReplyStatus, ReturnedMessage, TransactionId,
};
use std::sync::Arc;
use tokio::time::Instant;
use token_cache::Token;
use tracing::{debug, error, info, warn};

/// Per-call publish options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Replace the event's business message id with a new UUID before sending
    pub fresh_message_id: bool,
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub transaction_id: TransactionId,
    /// Business message id actually sent
    pub message_id: String,
    pub attempts: u32,
    pub renewals: u32,
    pub reconnects: u32,
}

/// Logs mandatory publishes the broker could not route.
///
/// The attempt is not failed; it runs into the reply timeout instead.
#[derive(Debug, Default)]
pub struct UndeliverableLogger;

impl ReturnListener for UndeliverableLogger {
    fn on_return(&self, returned: &ReturnedMessage) {
        error!(
            reply_code = returned.reply_code,
            reply_text = %returned.reply_text,
            exchange = %returned.exchange,
            routing_key = %returned.routing_key,
            message_id = returned.properties.message_id.as_deref().unwrap_or(""),
            "Message silently dropped by broker: no queue accepted it"
        );
    }
}

/// Publishes events with reply-correlated confirmation.
pub struct PublishWorkflow {
    context: ExchangeContext,
    connector: Arc<dyn BrokerConnector>,
    store: Arc<dyn EventStore>,
}

impl PublishWorkflow {
    pub fn new(
        context: ExchangeContext,
        connector: Arc<dyn BrokerConnector>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            context,
            connector,
            store,
        }
    }

    /// Publish `event` and wait for the exchange to accept it.
    ///
    /// Opens a session of its own and closes it before returning, whatever
    /// the outcome.
    ///
    /// # Errors
    ///
    /// - `TokenAcquisition` when no token can be obtained (not retried)
    /// - `RetryExhausted` when every attempt timed out, failed in transport
    ///   or needed a renewal
    /// - `BusinessFailure` / `MalformedReply` on a terminal reply
    /// - `Persistence` when the accepted event cannot be recorded
    pub async fn publish(
        &self,
        event: Event,
        options: PublishOptions,
    ) -> PublishResult<PublishReceipt> {
        let config = self.context.config();
        config.validate_publish()?;

        let event = if options.fresh_message_id {
            event.with_fresh_message_id()
        } else {
            event
        };

        let mut machine = PublishMachine::new(TransactionId::new(), config.publish.attempt_budget);
        let mut connection = ConnectionManager::new(
            Arc::clone(&self.connector),
            config.broker.clone(),
            ConsumerSetup::ReplyQueue(config.publish.reply_queue.clone()),
        )
        .with_return_listener(Arc::new(UndeliverableLogger));

        info!(
            transaction_id = %machine.transaction_id(),
            message_id = %event.message_id,
            exchange = %config.publish.exchange,
            "Publishing event"
        );

        let outcome = self.drive(&mut machine, &mut connection, &event).await;
        connection.close().await;

        let transaction_id = machine.transaction_id();
        match outcome {
            Ok(attempts) => {
                let receipt = PublishReceipt {
                    transaction_id,
                    message_id: event.message_id,
                    attempts,
                    renewals: machine.renewals(),
                    reconnects: connection.reconnects(),
                };
                info!(
                    transaction_id = %transaction_id,
                    message_id = %receipt.message_id,
                    attempts,
                    renewals = receipt.renewals,
                    reconnects = receipt.reconnects,
                    "Event published"
                );
                Ok(receipt)
            }
            Err(e) => {
                error!(transaction_id = %transaction_id, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Run the machine to a terminal state. Returns the successful attempt.
    async fn drive(
        &self,
        machine: &mut PublishMachine,
        connection: &mut ConnectionManager,
        event: &Event,
    ) -> PublishResult<u32> {
        let config = self.context.config();
        let tokens = self.context.publish_tokens();
        let transaction_id = machine.transaction_id();
        let mut deadline = Instant::now();

        loop {
            match machine.state().clone() {
                PublishState::Build => {
                    let token = tokens.current().await?;
                    match connection.open(&token).await {
                        Ok(()) => machine.record_opened(),
                        Err(e) => {
                            warn!(transaction_id = %transaction_id, error = %e, "Initial connect failed");
                            machine.record_transport_failure(e);
                        }
                    }
                }
                PublishState::Send { attempt } => {
                    let token = tokens.current().await?;
                    let decoded = token.decoded()?;
                    let correlation_id = CorrelationId::new();
                    let properties = MessageProperties::for_request(
                        correlation_id,
                        transaction_id,
                        &event.message_id,
                        &config.publish.reply_queue,
                        &decoded,
                    );

                    debug!(
                        transaction_id = %transaction_id,
                        correlation_id = %correlation_id,
                        attempt,
                        "Sending request"
                    );

                    let sent = match connection.channel() {
                        Ok(channel) => {
                            channel
                                .publish(
                                    &config.publish.exchange,
                                    &config.publish.routing_key,
                                    true,
                                    properties,
                                    event.payload.clone(),
                                )
                                .await
                        }
                        Err(e) => Err(e),
                    };

                    match sent {
                        Ok(()) => {
                            deadline = Instant::now() + config.publish.reply_timeout();
                            machine.record_sent(correlation_id);
                        }
                        Err(e) => {
                            warn!(transaction_id = %transaction_id, attempt, error = %e, "Send failed");
                            machine.record_transport_failure(e);
                        }
                    }
                }
                PublishState::AwaitReply {
                    attempt,
                    correlation_id,
                } => {
                    self.await_reply(machine, connection, attempt, correlation_id, deadline)
                        .await;
                }
                PublishState::Persist { attempt } => {
                    self.store.append(&event.payload).await?;
                    debug!(transaction_id = %transaction_id, attempt, "Sent event persisted");
                    machine.record_persisted();
                }
                PublishState::RenewToken { attempt } => {
                    warn!(transaction_id = %transaction_id, attempt, "Token expired, renewing");
                    tokens.renew().await?;
                    machine.record_renewed();
                }
                PublishState::Retry { attempt, reason } => {
                    warn!(
                        transaction_id = %transaction_id,
                        attempt,
                        reason = %reason,
                        "Attempt failed, reconnecting"
                    );
                    let token = tokens.current().await?;
                    Self::reconnect(machine, connection, &token).await;
                }
                PublishState::Success { attempt } => return Ok(attempt),
                PublishState::Fail(failure) => return Err(into_error(failure, transaction_id)),
            }
        }
    }

    async fn await_reply(
        &self,
        machine: &mut PublishMachine,
        connection: &mut ConnectionManager,
        attempt: u32,
        correlation_id: CorrelationId,
        deadline: Instant,
    ) {
        let timeout_ms = self.context.config().publish.reply_timeout_ms;

        loop {
            let channel = match connection.channel() {
                Ok(channel) => channel,
                Err(e) => return machine.record_transport_failure(e),
            };

            let delivery = match tokio::time::timeout_at(deadline, channel.next_delivery()).await {
                Err(_) => {
                    warn!(
                        correlation_id = %correlation_id,
                        attempt,
                        timeout_ms,
                        "No reply within timeout"
                    );
                    return machine.record_timeout(timeout_ms);
                }
                Ok(Err(e)) => {
                    warn!(correlation_id = %correlation_id, attempt, error = %e, "Receive failed");
                    return machine.record_transport_failure(e);
                }
                Ok(Ok(delivery)) => delivery,
            };

            let correlated = delivery
                .properties
                .as_ref()
                .is_some_and(|p| p.correlates_with(correlation_id));
            if !correlated {
                debug!(
                    expected = %correlation_id,
                    received = delivery
                        .properties
                        .as_ref()
                        .and_then(|p| p.correlation_id.as_deref())
                        .unwrap_or(""),
                    "Skipping reply for another attempt"
                );
                continue;
            }

            return match reply::decode(&delivery.body) {
                Ok(outcome) => {
                    if outcome.status != ReplyStatus::Success {
                        warn!(
                            correlation_id = %correlation_id,
                            status = outcome.status.code(),
                            message = %outcome.message,
                            "Exchange returned status"
                        );
                    }
                    machine.record_reply(outcome)
                }
                Err(e) => {
                    error!(correlation_id = %correlation_id, error = %e, "Undecodable reply");
                    machine.record_malformed_reply(e.to_string())
                }
            };
        }
    }

    async fn reconnect(machine: &mut PublishMachine, connection: &mut ConnectionManager, token: &Token) {
        match connection.reopen(token).await {
            Ok(()) => machine.record_reconnected(),
            Err(e) => {
                warn!(error = %e, "Reconnect failed");
                machine.record_reconnect_failure(e);
            }
        }
    }
}

fn into_error(failure: PublishFailure, transaction_id: TransactionId) -> PublishError {
    match failure {
        PublishFailure::RetryExhausted { attempts, last } => PublishError::RetryExhausted {
            transaction_id,
            attempts,
            last: last.to_string(),
        },
        PublishFailure::Business { status, message } => {
            PublishError::BusinessFailure { status, message }
        }
        PublishFailure::MalformedReply(reason) => PublishError::MalformedReply(reason),
    }
}
