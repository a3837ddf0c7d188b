//! Channel handed out by `InMemoryBroker::connect`.

use super::{AckRecord, BrokerState, ExchangeBinding, PublishedMessage, QueuedMessage, Reply};
use crate::error::TransportError;
use crate::ports::{BrokerChannel, ReturnListener};
use async_trait::async_trait;
use exchange_types::{
    Delivery, DeliveryTag, MessageProperties, ReturnedMessage, DIRECT_REPLY_QUEUE,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// AMQP reply code for an unroutable mandatory message.
const NO_ROUTE: u16 = 312;

/// One session plus its channel on an `InMemoryBroker`.
///
/// Dropping the channel without closing it behaves like a dropped TCP
/// connection: unacknowledged deliveries go back to their queues.
pub struct InMemoryChannel {
    id: u64,
    broker: Arc<Mutex<BrokerState>>,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    return_listener: Option<Arc<dyn ReturnListener>>,
    closed: bool,
}

impl InMemoryChannel {
    pub(crate) fn new(
        id: u64,
        broker: Arc<Mutex<BrokerState>>,
        receiver: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            id,
            broker,
            receiver,
            return_listener: None,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }

    /// Broker-side channel error: the channel is torn down and the error returned.
    fn fail(&self, state: &mut BrokerState, error: TransportError) -> TransportError {
        warn!(channel = self.id, error = %error, "Channel closed by broker");
        state.release_channel(self.id);
        error
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let binding = {
            let mut state = self.broker.lock();
            let Some(channel) = state.channels.get(&self.id) else {
                return Err(TransportError::ConnectionLost("session is gone".to_string()));
            };
            let reply_consumer = channel.reply_consumer;

            if state.faults.publish > 0 {
                state.faults.publish -= 1;
                let error = TransportError::ConnectionLost("injected publish fault".to_string());
                return Err(self.fail(&mut state, error));
            }
            if properties.reply_to.as_deref() == Some(DIRECT_REPLY_QUEUE) && !reply_consumer {
                let error = TransportError::ChannelClosed(
                    "PRECONDITION_FAILED - fast reply consumer does not exist".to_string(),
                );
                return Err(self.fail(&mut state, error));
            }
            let binding = state.exchanges.get(exchange).cloned();
            match binding {
                Some(binding) => binding,
                None => {
                    let error = TransportError::ChannelClosed(format!(
                        "NOT_FOUND - no exchange '{}'",
                        exchange
                    ));
                    return Err(self.fail(&mut state, error));
                }
            }
        };

        let message = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
        };

        let responder = match binding {
            ExchangeBinding::Routed(responder) => responder,
            ExchangeBinding::Unrouted => {
                if mandatory {
                    let returned = ReturnedMessage {
                        reply_code: NO_ROUTE,
                        reply_text: "NO_ROUTE".to_string(),
                        exchange: message.exchange,
                        routing_key: message.routing_key,
                        properties: message.properties,
                        body: message.body,
                    };
                    self.broker.lock().log.returned.push(returned.clone());
                    if let Some(listener) = &self.return_listener {
                        listener.on_return(&returned);
                    }
                }
                return Ok(());
            }
        };

        self.broker.lock().log.published.push(message.clone());
        let replies = responder.respond(&message);

        let reply_to = message.properties.reply_to.clone();
        let mut state = self.broker.lock();
        for reply in replies {
            let (properties, body) = match reply {
                Reply::Correlated(body) => {
                    (MessageProperties::reply_to_request(&message.properties), body)
                }
                Reply::Stale(body) => {
                    let mut properties = MessageProperties::reply_to_request(&message.properties);
                    properties.correlation_id = Some(Uuid::new_v4().to_string());
                    (properties, body)
                }
            };

            match reply_to.as_deref() {
                Some(DIRECT_REPLY_QUEUE) => state.deliver_to_channel(self.id, properties, body),
                Some(queue) if state.queues.contains_key(queue) => {
                    if let Some(target) = state.queues.get_mut(queue) {
                        target.ready.push_back(QueuedMessage {
                            properties: Some(properties),
                            body,
                            redelivered: false,
                        });
                    }
                    state.dispatch(queue);
                }
                _ => debug!(exchange, "Reply dropped, no reply address"),
            }
        }

        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(TransportError::ConnectionLost("session is gone".to_string()));
        }

        if queue == DIRECT_REPLY_QUEUE {
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.reply_consumer = true;
            }
            return Ok(());
        }

        let declared = state.queues.get(queue).map(|target| target.consumer);
        let consumer = match declared {
            Some(consumer) => consumer,
            None => {
                let error =
                    TransportError::ChannelClosed(format!("NOT_FOUND - no queue '{}'", queue));
                return Err(self.fail(&mut state, error));
            }
        };
        if consumer.is_some_and(|id| id != self.id) {
            let error = TransportError::ChannelClosed(format!(
                "ACCESS_REFUSED - queue '{}' in exclusive use",
                queue
            ));
            return Err(self.fail(&mut state, error));
        }

        if let Some(target) = state.queues.get_mut(queue) {
            target.consumer = Some(self.id);
        }
        debug!(channel = self.id, queue, "Consumer registered");
        state.dispatch(queue);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Delivery, TransportError> {
        self.ensure_open()?;
        {
            let mut state = self.broker.lock();
            if state.faults.receive > 0 && state.channels.contains_key(&self.id) {
                state.faults.receive -= 1;
                let error = TransportError::ConnectionLost("injected receive fault".to_string());
                return Err(self.fail(&mut state, error));
            }
        }

        self.receiver
            .recv()
            .await
            .ok_or_else(|| TransportError::ConnectionLost("session is gone".to_string()))
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(TransportError::ConnectionLost("session is gone".to_string()));
        }
        if state.faults.ack > 0 {
            state.faults.ack -= 1;
            let error = TransportError::ConnectionLost("injected ack fault".to_string());
            return Err(self.fail(&mut state, error));
        }
        let Some(channel) = state.channels.get_mut(&self.id) else {
            return Err(TransportError::ConnectionLost("session is gone".to_string()));
        };

        match channel.unacked.remove(&tag) {
            Some((queue, message)) => {
                state.log.acks.push(AckRecord {
                    queue,
                    delivery_tag: tag,
                    message_id: message.properties.and_then(|p| p.message_id),
                    requeue: false,
                });
                Ok(())
            }
            None => {
                let error = TransportError::ChannelClosed(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    tag
                ));
                Err(self.fail(&mut state, error))
            }
        }
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let Some(channel) = state.channels.get_mut(&self.id) else {
            return Err(TransportError::ConnectionLost("session is gone".to_string()));
        };

        let Some((queue, mut message)) = channel.unacked.remove(&tag) else {
            let error = TransportError::ChannelClosed(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                tag
            ));
            return Err(self.fail(&mut state, error));
        };

        state.log.nacks.push(AckRecord {
            queue: queue.clone(),
            delivery_tag: tag,
            message_id: message.properties.as_ref().and_then(|p| p.message_id.clone()),
            requeue,
        });

        if requeue {
            message.redelivered = true;
            if let Some(target) = state.queues.get_mut(&queue) {
                target.ready.push_front(message);
            }
            state.dispatch(&queue);
        } else {
            state.log.dead_letters.push(message);
        }
        Ok(())
    }

    fn set_return_listener(&mut self, listener: Arc<dyn ReturnListener>) {
        self.return_listener = Some(listener);
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.broker.lock();
        state.release_channel(self.id);
        if state.faults.close > 0 {
            state.faults.close -= 1;
            return Err(TransportError::ConnectionLost(
                "injected close fault".to_string(),
            ));
        }
        debug!(channel = self.id, "Session closed");
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        if !self.closed {
            self.broker.lock().release_channel(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{InMemoryBroker, ScriptedResponder};
    use super::*;
    use crate::ports::{BrokerConnector, ConnectParams, SaslCredentials, TlsSettings};
    use exchange_types::{CorrelationId, TransactionId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn params() -> ConnectParams {
        ConnectParams {
            host: "localhost".into(),
            port: 5671,
            virtual_host: "BF".into(),
            tls: TlsSettings::default(),
            sasl: SaslCredentials::external("<Assertion/>"),
            connection_timeout: Duration::from_secs(1),
        }
    }

    fn request(corr: CorrelationId) -> MessageProperties {
        MessageProperties::for_request(corr, TransactionId::new(), "MSG-1", DIRECT_REPLY_QUEUE, "t")
    }

    fn with_id(id: &str) -> Option<MessageProperties> {
        Some(MessageProperties {
            message_id: Some(id.into()),
            ..Default::default()
        })
    }

    struct CountingListener(AtomicUsize);

    impl ReturnListener for CountingListener {
        fn on_return(&self, _returned: &ReturnedMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_direct_reply_round_trip() {
        let broker = InMemoryBroker::default();
        broker.bind_exchange("X", Arc::new(ScriptedResponder::always(b"ok".to_vec())));
        let mut channel = broker.connect(&params()).await.unwrap();

        channel.consume(DIRECT_REPLY_QUEUE).await.unwrap();
        let corr = CorrelationId::new();
        channel.publish("X", "", true, request(corr), b"hi".to_vec()).await.unwrap();

        let reply = channel.next_delivery().await.unwrap();
        assert!(reply.properties.unwrap().correlates_with(corr));
        assert_eq!(reply.body, b"ok");
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_to_without_reply_consumer_closes_channel() {
        let broker = InMemoryBroker::default();
        broker.bind_exchange("X", Arc::new(ScriptedResponder::silent()));
        let mut channel = broker.connect(&params()).await.unwrap();

        let err = channel
            .publish("X", "", true, request(CorrelationId::new()), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed(_)));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_unroutable_mandatory_message_is_returned() {
        let broker = InMemoryBroker::default();
        broker.declare_unrouted_exchange("X");
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        let mut channel = broker.connect(&params()).await.unwrap();
        channel.set_return_listener(listener.clone());

        channel
            .publish("X", "", true, MessageProperties::default(), b"lost".to_vec())
            .await
            .unwrap();

        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert_eq!(broker.returned()[0].reply_code, NO_ROUTE);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered_after_close() {
        let broker = InMemoryBroker::default();
        broker.declare_queue("mailbox");
        broker.enqueue("mailbox", with_id("A"), b"a".to_vec()).unwrap();

        let mut first = broker.connect(&params()).await.unwrap();
        first.consume("mailbox").await.unwrap();
        let delivery = first.next_delivery().await.unwrap();
        assert!(!delivery.redelivered);
        first.close().await.unwrap();

        assert_eq!(broker.queue_depth("mailbox"), 1);
        let mut second = broker.connect(&params()).await.unwrap();
        second.consume("mailbox").await.unwrap();
        let again = second.next_delivery().await.unwrap();
        assert!(again.redelivered);
        second.ack(again.delivery_tag).await.unwrap();

        assert_eq!(broker.acks().len(), 1);
        assert_eq!(broker.acks()[0].message_id.as_deref(), Some("A"));
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = InMemoryBroker::default();
        broker.declare_queue("mailbox");
        broker.enqueue("mailbox", with_id(""), b"poison".to_vec()).unwrap();

        let mut channel = broker.connect(&params()).await.unwrap();
        channel.consume("mailbox").await.unwrap();
        let delivery = channel.next_delivery().await.unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.queue_depth("mailbox"), 0);
        assert!(!broker.nacks()[0].requeue);
    }

    #[tokio::test]
    async fn test_receive_fault_kills_session() {
        let broker = InMemoryBroker::default();
        broker.declare_queue("mailbox");
        broker.fail_next_receives(1);

        let mut channel = broker.connect(&params()).await.unwrap();
        channel.consume("mailbox").await.unwrap();
        assert!(matches!(
            channel.next_delivery().await,
            Err(TransportError::ConnectionLost(_))
        ));
        assert!(channel.next_delivery().await.is_err());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_operations() {
        let broker = InMemoryBroker::default();
        let mut channel = broker.connect(&params()).await.unwrap();
        channel.close().await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(
            channel.consume("mailbox").await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(broker.channels_closed(), 1);
    }
}
