//! # In-Memory Broker
//!
//! In-process broker honouring the wire contract the exchange client relies
//! on. Suitable for tests and local runs; production deployments plug a
//! network connector into the same ports.
//!
//! ## Model
//!
//! ```text
//!            connect(EXTERNAL token)
//!  client ─────────────────────────────▶ virtual host
//!                                          │
//!    publish ─▶ exchange ─┬─ bound ──▶ ExchangeResponder ──▶ replies ─▶ direct-reply consumer
//!                         └─ unrouted ─▶ returned to ReturnListener (mandatory)
//!
//!    consume ◀─ queue ◀── enqueue()       manual ack / nack, redelivery on close
//! ```
//!
//! Fault injection (`fail_next_*`) turns the next connect, publish, receive
//! or close into a transport error so recovery paths can be exercised.

mod channel;
mod responder;

pub use channel::InMemoryChannel;
pub use responder::{ExchangeResponder, PublishedMessage, Reply, ScriptedResponder};

use crate::error::TransportError;
use crate::ports::{BrokerChannel, BrokerConnector, ConnectParams, SASL_EXTERNAL};
use async_trait::async_trait;
use exchange_types::{Delivery, DeliveryTag, MessageProperties, ReturnedMessage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default virtual host of the message distributor.
pub const DEFAULT_VIRTUAL_HOST: &str = "BF";

type Authenticator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A message waiting in (or redelivered from) a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub properties: Option<MessageProperties>,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// An ack or nack observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub queue: String,
    pub delivery_tag: DeliveryTag,
    pub message_id: Option<String>,
    pub requeue: bool,
}

#[derive(Clone)]
enum ExchangeBinding {
    Routed(Arc<dyn ExchangeResponder>),
    Unrouted,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    consumer: Option<u64>,
}

struct ChannelState {
    sender: mpsc::UnboundedSender<Delivery>,
    reply_consumer: bool,
    unacked: BTreeMap<DeliveryTag, (String, QueuedMessage)>,
}

#[derive(Default)]
struct Faults {
    connect: u32,
    publish: u32,
    receive: u32,
    ack: u32,
    close: u32,
}

#[derive(Default)]
struct BrokerLog {
    connects: Vec<ConnectParams>,
    published: Vec<PublishedMessage>,
    returned: Vec<ReturnedMessage>,
    acks: Vec<AckRecord>,
    nacks: Vec<AckRecord>,
    dead_letters: Vec<QueuedMessage>,
    channels_opened: u64,
    channels_closed: u64,
}

pub(crate) struct BrokerState {
    virtual_host: String,
    require_tls: bool,
    authenticator: Option<Authenticator>,
    exchanges: HashMap<String, ExchangeBinding>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
    next_tag: u64,
    faults: Faults,
    log: BrokerLog,
}

impl BrokerState {
    fn next_tag(&mut self) -> DeliveryTag {
        self.next_tag += 1;
        DeliveryTag(self.next_tag)
    }

    /// Push ready messages of `queue` to its consumer.
    fn dispatch(&mut self, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(channel) = state.consumer.and_then(|id| self.channels.get_mut(&id)) else {
            return;
        };

        while let Some(message) = state.ready.pop_front() {
            self.next_tag += 1;
            let tag = DeliveryTag(self.next_tag);
            let delivery = Delivery {
                delivery_tag: tag,
                properties: message.properties.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };
            if channel.sender.send(delivery).is_err() {
                state.ready.push_front(message);
                break;
            }
            channel.unacked.insert(tag, (queue.to_string(), message));
        }
    }

    /// Forget a channel, returning its unacknowledged deliveries to their queues.
    fn release_channel(&mut self, id: u64) -> bool {
        let Some(channel) = self.channels.remove(&id) else {
            return false;
        };
        self.log.channels_closed += 1;

        let mut touched = Vec::new();
        for (_, (queue, mut message)) in channel.unacked.into_iter().rev() {
            message.redelivered = true;
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_front(message);
            }
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }

        for state in self.queues.values_mut() {
            if state.consumer == Some(id) {
                state.consumer = None;
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
        true
    }

    fn deliver_to_channel(&mut self, id: u64, properties: MessageProperties, body: Vec<u8>) {
        let tag = self.next_tag();
        if let Some(channel) = self.channels.get(&id) {
            let delivery = Delivery {
                delivery_tag: tag,
                properties: Some(properties),
                body,
                redelivered: false,
            };
            if channel.sender.send(delivery).is_err() {
                debug!(channel = id, "Reply dropped, channel receiver gone");
            }
        }
    }
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create a broker serving `virtual_host`.
    pub fn new(virtual_host: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                virtual_host: virtual_host.into(),
                require_tls: true,
                authenticator: None,
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                channels: HashMap::new(),
                next_channel: 0,
                next_tag: 0,
                faults: Faults::default(),
                log: BrokerLog::default(),
            })),
        }
    }

    // =========================================================================
    // TOPOLOGY
    // =========================================================================

    /// Reject sessions that do not negotiate TLS (default: true).
    pub fn set_require_tls(&self, required: bool) {
        self.state.lock().require_tls = required;
    }

    /// Accept a session only if `accept` returns true for the SASL response.
    pub fn set_authenticator<F>(&self, accept: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.state.lock().authenticator = Some(Arc::new(accept));
    }

    /// Declare an exchange whose published messages reach `responder`.
    pub fn bind_exchange(&self, name: impl Into<String>, responder: Arc<dyn ExchangeResponder>) {
        self.state
            .lock()
            .exchanges
            .insert(name.into(), ExchangeBinding::Routed(responder));
    }

    /// Declare an exchange with no bindings; mandatory publishes are returned.
    pub fn declare_unrouted_exchange(&self, name: impl Into<String>) {
        self.state
            .lock()
            .exchanges
            .insert(name.into(), ExchangeBinding::Unrouted);
    }

    pub fn declare_queue(&self, name: impl Into<String>) {
        self.state.lock().queues.entry(name.into()).or_default();
    }

    /// Append a message to a declared queue and deliver it if consumed.
    pub fn enqueue(
        &self,
        queue: &str,
        properties: Option<MessageProperties>,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(TransportError::ChannelClosed(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };
        target.ready.push_back(QueuedMessage {
            properties,
            body: body.into(),
            redelivered: false,
        });
        state.dispatch(queue);
        Ok(())
    }

    // =========================================================================
    // FAULT INJECTION
    // =========================================================================

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().faults.connect = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().faults.publish = count;
    }

    pub fn fail_next_receives(&self, count: u32) {
        self.state.lock().faults.receive = count;
    }

    /// Lose the session on the next `count` acks; the messages are redelivered.
    pub fn fail_next_acks(&self, count: u32) {
        self.state.lock().faults.ack = count;
    }

    pub fn fail_next_closes(&self, count: u32) {
        self.state.lock().faults.close = count;
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Every connect attempt, accepted or not.
    pub fn connect_log(&self) -> Vec<ConnectParams> {
        self.state.lock().log.connects.clone()
    }

    /// Sessions successfully opened.
    pub fn channels_opened(&self) -> u64 {
        self.state.lock().log.channels_opened
    }

    /// Sessions closed, by the client or by the broker.
    pub fn channels_closed(&self) -> u64 {
        self.state.lock().log.channels_closed
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Messages accepted by bound exchanges.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().log.published.clone()
    }

    /// Mandatory messages returned as unroutable.
    pub fn returned(&self) -> Vec<ReturnedMessage> {
        self.state.lock().log.returned.clone()
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.state.lock().log.acks.clone()
    }

    pub fn nacks(&self) -> Vec<AckRecord> {
        self.state.lock().log.nacks.clone()
    }

    /// Messages rejected without requeue.
    pub fn dead_letters(&self) -> Vec<QueuedMessage> {
        self.state.lock().log.dead_letters.clone()
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Delivered but unacknowledged messages across all channels.
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<BrokerState>> {
        Arc::clone(&self.state)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_HOST)
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let mut state = self.state.lock();
        state.log.connects.push(params.clone());
        let endpoint = params.endpoint();

        if state.faults.connect > 0 {
            state.faults.connect -= 1;
            warn!(endpoint = %endpoint, "Injected connect fault");
            return Err(TransportError::ConnectionRefused {
                endpoint,
                reason: "injected fault".to_string(),
            });
        }
        if state.require_tls && !params.tls.enabled {
            return Err(TransportError::Tls("broker requires TLS".to_string()));
        }
        if params.virtual_host != state.virtual_host {
            return Err(TransportError::AccessRefused(format!(
                "no access to virtual host '{}'",
                params.virtual_host
            )));
        }
        if params.sasl.mechanism != SASL_EXTERNAL {
            return Err(TransportError::AccessRefused(format!(
                "mechanism {} not offered",
                params.sasl.mechanism
            )));
        }
        if let Some(accept) = &state.authenticator {
            if !accept(&params.sasl.response) {
                return Err(TransportError::AccessRefused(
                    "EXTERNAL identity rejected".to_string(),
                ));
            }
        }

        state.next_channel += 1;
        let id = state.next_channel;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.channels.insert(
            id,
            ChannelState {
                sender,
                reply_consumer: false,
                unacked: BTreeMap::new(),
            },
        );
        state.log.channels_opened += 1;
        debug!(endpoint = %endpoint, channel = id, "Session opened");

        Ok(Box::new(InMemoryChannel::new(id, self.shared(), receiver)))
    }
}
