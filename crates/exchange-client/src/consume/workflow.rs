//! Consume workflow: slot loop over a mailbox.

use super::machine::{classify, Disposition, SlotEvent, SlotMachine, SlotOutcome, SlotState};
use crate::connection::{ConnectionManager, ConsumerSetup};
use crate::context::ExchangeContext;
use crate::error::{ConsumeError, ConsumeResult};
use crate::ports::{EventStore, Processor};
use exchange_bus::{BrokerChannel, BrokerConnector};
use exchange_types::Delivery;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why the slot loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Every requested slot was handled
    Completed,
    /// A slot used its whole attempt budget without handling a delivery
    SlotBudgetExhausted { slot: u32, attempts: u32 },
}

/// Summary of a consume run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeReport {
    pub requested: u32,
    pub slots: Vec<SlotOutcome>,
    pub processed: u32,
    pub duplicates: u32,
    pub rejected: u32,
    pub stop_reason: StopReason,
}

impl ConsumeReport {
    fn new(requested: u32) -> Self {
        Self {
            requested,
            slots: Vec::new(),
            processed: 0,
            duplicates: 0,
            rejected: 0,
            stop_reason: StopReason::Completed,
        }
    }
}

/// Consumes events from the configured mailbox.
pub struct ConsumeWorkflow {
    context: ExchangeContext,
    connector: Arc<dyn BrokerConnector>,
    store: Arc<dyn EventStore>,
    processor: Arc<dyn Processor>,
}

impl ConsumeWorkflow {
    pub fn new(
        context: ExchangeContext,
        connector: Arc<dyn BrokerConnector>,
        store: Arc<dyn EventStore>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            context,
            connector,
            store,
            processor,
        }
    }

    /// Handle the configured number of messages.
    pub async fn run(&self) -> ConsumeResult<ConsumeReport> {
        self.consume(self.context.config().consume.messages).await
    }

    /// Handle up to `messages` deliveries.
    ///
    /// Stops early, with `Ok`, when a slot exhausts its attempt budget.
    ///
    /// # Errors
    ///
    /// - `Processor` when business processing fails; the delivery is left
    ///   unacknowledged and returns to the mailbox
    /// - `Persistence` when the payload cannot be recorded
    /// - `TokenAcquisition` when no token can be obtained
    pub async fn consume(&self, messages: u32) -> ConsumeResult<ConsumeReport> {
        let config = self.context.config();
        config.validate_consume()?;

        let mut connection = ConnectionManager::new(
            Arc::clone(&self.connector),
            config.broker.clone(),
            ConsumerSetup::Mailbox(config.consume.mailbox.clone()),
        );
        let mut report = ConsumeReport::new(messages);

        info!(mailbox = %config.consume.mailbox, messages, "Consuming events");

        let outcome = self.drive(&mut connection, &mut report).await;
        connection.close().await;

        match outcome {
            Ok(()) => {
                info!(
                    mailbox = %config.consume.mailbox,
                    processed = report.processed,
                    duplicates = report.duplicates,
                    rejected = report.rejected,
                    stop_reason = ?report.stop_reason,
                    "Consume finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(mailbox = %config.consume.mailbox, error = %e, "Consume aborted");
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        connection: &mut ConnectionManager,
        report: &mut ConsumeReport,
    ) -> ConsumeResult<()> {
        let config = self.context.config();
        let tokens = self.context.consume_tokens();

        let token = tokens.current().await?;
        if let Err(e) = connection.open(&token).await {
            warn!(mailbox = %config.consume.mailbox, error = %e, "Initial connect failed");
        }

        for slot in 1..=report.requested {
            let mut machine = SlotMachine::new(slot, config.consume.slot_attempt_budget);

            loop {
                match machine.state().clone() {
                    SlotState::WaitMessage { attempt } => {
                        debug!(slot, attempt, "Waiting for message");
                        let event = self.wait_once(connection, report).await?;
                        machine.record(event);
                    }
                    SlotState::Reconnect { attempt } => {
                        warn!(slot, attempt, "Reconnecting to mailbox");
                        let token = tokens.current().await?;
                        match connection.reopen(&token).await {
                            Ok(()) => machine.record_reconnected(),
                            Err(e) => {
                                warn!(slot, attempt, error = %e, "Reconnect failed");
                                machine.record_reconnect_failure();
                            }
                        }
                    }
                    SlotState::Done(outcome) => {
                        report.slots.push(outcome);
                        break;
                    }
                    SlotState::Exhausted { attempts } => {
                        warn!(slot, attempts, "Slot attempt budget exhausted, stopping");
                        report.stop_reason = StopReason::SlotBudgetExhausted { slot, attempts };
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    /// One bounded wait, plus handling of whatever arrived.
    async fn wait_once(
        &self,
        connection: &mut ConnectionManager,
        report: &mut ConsumeReport,
    ) -> ConsumeResult<SlotEvent> {
        let consume = &self.context.config().consume;

        let channel = match connection.channel() {
            Ok(channel) => channel,
            Err(e) => return Ok(SlotEvent::TransportFailed(e)),
        };

        match tokio::time::timeout(consume.wait_timeout(), channel.next_delivery()).await {
            Err(_) => {
                info!(
                    mailbox = %consume.mailbox,
                    timeout_ms = consume.wait_timeout_ms,
                    "No message within timeout"
                );
                Ok(SlotEvent::TimedOut)
            }
            Ok(Err(e)) => {
                warn!(mailbox = %consume.mailbox, error = %e, "Receive failed");
                Ok(SlotEvent::TransportFailed(e))
            }
            Ok(Ok(delivery)) => self.handle(channel, delivery, report).await,
        }
    }

    async fn handle(
        &self,
        channel: &mut dyn BrokerChannel,
        delivery: Delivery,
        report: &mut ConsumeReport,
    ) -> ConsumeResult<SlotEvent> {
        let tag = delivery.delivery_tag;
        let ledger = self.context.ledger();

        match classify(&delivery, ledger) {
            Disposition::Malformed => {
                warn!(delivery_tag = %tag, "Delivery without properties, retrying");
                Ok(SlotEvent::Malformed)
            }
            Disposition::Reject => {
                warn!(delivery_tag = %tag, "Delivery without business id, rejecting");
                if let Err(e) = channel.nack(tag, false).await {
                    return Ok(SlotEvent::TransportFailed(e));
                }
                report.rejected += 1;
                Ok(SlotEvent::Handled(SlotOutcome::Rejected { delivery_tag: tag }))
            }
            Disposition::Reacknowledge { message_id } => {
                debug!(
                    message_id = %message_id,
                    delivery_tag = %tag,
                    redelivered = delivery.redelivered,
                    "Already processed, acknowledging again"
                );
                if let Err(e) = channel.ack(tag).await {
                    return Ok(SlotEvent::TransportFailed(e));
                }
                report.duplicates += 1;
                Ok(SlotEvent::Handled(SlotOutcome::Duplicate { message_id }))
            }
            Disposition::Process { message_id } => {
                debug!(message_id = %message_id, delivery_tag = %tag, "New message");
                self.store.append(&delivery.body).await?;

                if let Err(e) = self.processor.process(&message_id, &delivery.body).await {
                    error!(
                        message_id = %message_id,
                        error = %e,
                        "Processing failed, message will not be acknowledged"
                    );
                    return Err(ConsumeError::Processor {
                        message_id,
                        reason: e.to_string(),
                    });
                }

                ledger.mark_processed(&message_id);

                info!(message_id = %message_id, delivery_tag = %tag, "Acknowledging message");
                if let Err(e) = channel.ack(tag).await {
                    // the redelivery is settled as a duplicate
                    return Ok(SlotEvent::TransportFailed(e));
                }
                report.processed += 1;
                Ok(SlotEvent::Handled(SlotOutcome::Processed { message_id }))
            }
        }
    }
}
