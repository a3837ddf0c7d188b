//! Channel handed out by `AmqpConnector::connect`.
//!
//! A reader task owns the socket's read half. It answers broker-initiated
//! closes, assembles `basic.deliver` and `basic.return` content, and routes
//! synchronous replies (`consume-ok`, `close-ok`) back to the caller.

use super::codec::{write_frames, CloseReason, CodecError, Frame, FrameReader, Method};
use super::{BoxedStream, Tuning, SESSION_CHANNEL};
use crate::error::TransportError;
use crate::ports::{BrokerChannel, ReturnListener};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use exchange_types::{
    Delivery, DeliveryTag, MessageProperties, ReturnedMessage, DIRECT_REPLY_QUEUE,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type SharedWriter = Arc<AsyncMutex<WriteHalf<BoxedStream>>>;
type SharedListener = Arc<Mutex<Option<Arc<dyn ReturnListener>>>>;
type SharedFailure = Arc<Mutex<Option<TransportError>>>;

/// One AMQP session plus its single channel.
///
/// Dropping the channel without closing it drops the socket; the broker
/// requeues anything left unacknowledged.
pub struct AmqpChannel {
    endpoint: String,
    writer: SharedWriter,
    frame_max: u32,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    replies: mpsc::UnboundedReceiver<Method>,
    return_listener: SharedListener,
    failure: SharedFailure,
    reply_timeout: Duration,
    reader: JoinHandle<()>,
    closed: bool,
}

impl AmqpChannel {
    /// Take over a session whose handshake has completed.
    pub(crate) fn start(
        endpoint: String,
        reader: FrameReader<BoxedStream>,
        tuning: Tuning,
        reply_timeout: Duration,
    ) -> Self {
        let (stream, buffered) = reader.into_parts();
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(AsyncMutex::new(write_half));
        let return_listener: SharedListener = Arc::new(Mutex::new(None));
        let failure: SharedFailure = Arc::new(Mutex::new(None));
        let (delivery_tx, deliveries) = mpsc::unbounded_channel();
        let (reply_tx, replies) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            endpoint: endpoint.clone(),
            reader: FrameReader::resume(read_half, buffered, tuning.frame_max as usize),
            writer: Arc::clone(&writer),
            deliveries: delivery_tx,
            replies: reply_tx,
            return_listener: Arc::clone(&return_listener),
            failure: Arc::clone(&failure),
            pending: None,
        };
        let reader = tokio::spawn(dispatcher.run());

        Self {
            endpoint,
            writer,
            frame_max: tuning.frame_max,
            deliveries,
            replies,
            return_listener,
            failure,
            reply_timeout,
            reader,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        match self.failure.lock().as_ref() {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    /// Why the reader stopped, or a generic loss when it has not said.
    fn failure(&self) -> TransportError {
        self.failure.lock().clone().unwrap_or_else(|| {
            TransportError::ConnectionLost(format!("{} session ended", self.endpoint))
        })
    }

    async fn send(&self, frames: &[Frame]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_frames(&mut *writer, frames).await.map_err(|e| {
            let error = TransportError::ConnectionLost(e.to_string());
            record_failure(&self.failure, error.clone());
            error
        })
    }

    /// Wait for the synchronous reply `matches` accepts.
    async fn await_reply<F>(&mut self, expected: &str, matches: F) -> Result<Method, TransportError>
    where
        F: Fn(&Method) -> bool,
    {
        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(method)) if matches(&method) => return Ok(method),
                Ok(Some(other)) => debug!(expected, received = ?other, "Skipping reply"),
                Ok(None) => return Err(self.failure()),
                Err(_) => {
                    return Err(TransportError::ConnectionLost(format!(
                        "no {} from {} within {} ms",
                        expected,
                        self.endpoint,
                        self.reply_timeout.as_millis()
                    )))
                }
            }
        }
    }

    /// Largest body slice per frame: frame size less framing overhead.
    fn body_chunk(&self) -> usize {
        (self.frame_max as usize).saturating_sub(8).max(1)
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.send(&[Frame::method(
            SESSION_CHANNEL,
            Method::ChannelClose(CloseReason::normal()),
        )])
        .await?;
        self.await_reply("channel.close-ok", |m| matches!(m, Method::ChannelCloseOk))
            .await?;

        self.send(&[Frame::method(0, Method::ConnectionClose(CloseReason::normal()))])
            .await?;
        self.await_reply("connection.close-ok", |m| {
            matches!(m, Method::ConnectionCloseOk)
        })
        .await?;

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let body = Bytes::from(body);
        let mut frames = vec![
            Frame::method(
                SESSION_CHANNEL,
                Method::BasicPublish {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    mandatory,
                },
            ),
            Frame::Header {
                channel: SESSION_CHANNEL,
                body_size: body.len() as u64,
                properties: Some(properties),
            },
        ];
        let chunk = self.body_chunk();
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk).min(body.len());
            frames.push(Frame::Body {
                channel: SESSION_CHANNEL,
                payload: body.slice(offset..end),
            });
            offset = end;
        }

        self.send(&frames).await
    }

    async fn consume(&mut self, queue: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let no_ack = queue == DIRECT_REPLY_QUEUE;

        self.send(&[Frame::method(
            SESSION_CHANNEL,
            Method::BasicConsume {
                queue: queue.to_string(),
                consumer_tag: String::new(),
                no_ack,
                exclusive: false,
            },
        )])
        .await?;

        let reply = self
            .await_reply("basic.consume-ok", |m| matches!(m, Method::BasicConsumeOk { .. }))
            .await?;
        if let Method::BasicConsumeOk { consumer_tag } = reply {
            debug!(queue, consumer_tag = %consumer_tag, no_ack, "Consumer registered");
        }
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Delivery, TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        match self.deliveries.recv().await {
            Some(delivery) => Ok(delivery),
            None => Err(self.failure()),
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.send(&[Frame::method(
            SESSION_CHANNEL,
            Method::BasicAck {
                delivery_tag: tag.0,
                multiple: false,
            },
        )])
        .await
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.send(&[Frame::method(
            SESSION_CHANNEL,
            Method::BasicNack {
                delivery_tag: tag.0,
                multiple: false,
                requeue,
            },
        )])
        .await
    }

    fn set_return_listener(&mut self, listener: Arc<dyn ReturnListener>) {
        *self.return_listener.lock() = Some(listener);
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let failed = self.failure.lock().is_some();
        let result = if failed {
            // broker side already gone
            Ok(())
        } else {
            self.shutdown().await
        };
        self.reader.abort();

        match &result {
            Ok(()) => debug!(endpoint = %self.endpoint, "Session closed"),
            Err(e) => warn!(endpoint = %self.endpoint, error = %e, "Session close failed"),
        }
        result
    }
}

impl Drop for AmqpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Keep the first failure; later ones are consequences of it.
fn record_failure(failure: &SharedFailure, error: TransportError) {
    let mut slot = failure.lock();
    if slot.is_none() {
        *slot = Some(error);
    }
}

// =============================================================================
// READER TASK
// =============================================================================

enum PendingKind {
    Deliver { delivery_tag: u64, redelivered: bool },
    Return(ReturnedMessage),
}

/// Content being assembled from header and body frames.
struct Pending {
    kind: PendingKind,
    properties: Option<MessageProperties>,
    body_size: Option<u64>,
    body: BytesMut,
}

struct Dispatcher {
    endpoint: String,
    reader: FrameReader<ReadHalf<BoxedStream>>,
    writer: SharedWriter,
    deliveries: mpsc::UnboundedSender<Delivery>,
    replies: mpsc::UnboundedSender<Method>,
    return_listener: SharedListener,
    failure: SharedFailure,
    pending: Option<Pending>,
}

impl Dispatcher {
    async fn run(mut self) {
        let reason = self.pump().await;
        debug!(endpoint = %self.endpoint, reason = %reason, "Session reader stopped");
        record_failure(&self.failure, reason);
        // dropping the senders wakes every waiter with the stored failure
    }

    /// Dispatch frames until the session ends; returns why it ended.
    async fn pump(&mut self) -> TransportError {
        loop {
            let frame = match self.reader.read_frame().await {
                Ok(frame) => frame,
                Err(CodecError::Eof) => {
                    return TransportError::ConnectionLost(format!(
                        "{} closed the connection",
                        self.endpoint
                    ))
                }
                Err(e) => return TransportError::ConnectionLost(e.to_string()),
            };

            match frame {
                Frame::Heartbeat => {}
                Frame::Method { channel, method } => {
                    if let Some(reason) = self.on_method(channel, method).await {
                        return reason;
                    }
                }
                Frame::Header {
                    body_size,
                    properties,
                    ..
                } => {
                    let Some(pending) = self.pending.as_mut() else {
                        return TransportError::ConnectionLost(
                            "content header without a method".to_string(),
                        );
                    };
                    pending.properties = properties;
                    pending.body_size = Some(body_size);
                    self.complete_if_ready();
                }
                Frame::Body { payload, .. } => {
                    let Some(pending) = self.pending.as_mut() else {
                        return TransportError::ConnectionLost(
                            "content body without a method".to_string(),
                        );
                    };
                    pending.body.extend_from_slice(&payload);
                    self.complete_if_ready();
                }
            }
        }
    }

    /// Handle one method frame. `Some` ends the session.
    async fn on_method(&mut self, channel: u16, method: Method) -> Option<TransportError> {
        match method {
            Method::BasicDeliver {
                delivery_tag,
                redelivered,
                ..
            } => {
                self.begin(PendingKind::Deliver {
                    delivery_tag,
                    redelivered,
                });
                None
            }
            Method::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                self.begin(PendingKind::Return(ReturnedMessage {
                    reply_code,
                    reply_text,
                    exchange,
                    routing_key,
                    properties: MessageProperties::default(),
                    body: Vec::new(),
                }));
                None
            }
            Method::ChannelClose(reason) => {
                self.reply(Frame::method(channel, Method::ChannelCloseOk)).await;
                error!(endpoint = %self.endpoint, reason = %reason, "Channel closed by broker");
                Some(TransportError::ChannelClosed(reason.to_string()))
            }
            Method::ConnectionClose(reason) => {
                self.reply(Frame::method(0, Method::ConnectionCloseOk)).await;
                error!(endpoint = %self.endpoint, reason = %reason, "Connection closed by broker");
                Some(TransportError::ConnectionLost(reason.to_string()))
            }
            Method::BasicCancel { consumer_tag } => {
                warn!(endpoint = %self.endpoint, consumer_tag = %consumer_tag, "Consumer cancelled by broker");
                Some(TransportError::ChannelClosed(format!(
                    "consumer {} cancelled by broker",
                    consumer_tag
                )))
            }
            Method::ConnectionCloseOk => {
                let _ = self.replies.send(Method::ConnectionCloseOk);
                Some(TransportError::NotConnected)
            }
            Method::ConnectionBlocked { reason } => {
                warn!(endpoint = %self.endpoint, reason = %reason, "Broker blocked publishing");
                None
            }
            Method::ConnectionUnblocked => {
                info!(endpoint = %self.endpoint, "Broker unblocked publishing");
                None
            }
            other => {
                let _ = self.replies.send(other);
                None
            }
        }
    }

    fn begin(&mut self, kind: PendingKind) {
        self.pending = Some(Pending {
            kind,
            properties: None,
            body_size: None,
            body: BytesMut::new(),
        });
    }

    fn complete_if_ready(&mut self) {
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|p| p.body_size.is_some_and(|size| p.body.len() as u64 >= size));
        if !ready {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        match pending.kind {
            PendingKind::Deliver {
                delivery_tag,
                redelivered,
            } => {
                let delivery = Delivery {
                    delivery_tag: DeliveryTag(delivery_tag),
                    properties: pending.properties,
                    body: pending.body.to_vec(),
                    redelivered,
                };
                // receiver gone means the channel is being dropped
                let _ = self.deliveries.send(delivery);
            }
            PendingKind::Return(mut returned) => {
                returned.properties = pending.properties.unwrap_or_default();
                returned.body = pending.body.to_vec();
                let listener = self.return_listener.lock().clone();
                match listener {
                    Some(listener) => listener.on_return(&returned),
                    None => warn!(
                        exchange = %returned.exchange,
                        reply_code = returned.reply_code,
                        "Returned message with no listener"
                    ),
                }
            }
        }
    }

    async fn reply(&self, frame: Frame) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frames(&mut *writer, &[frame]).await {
            debug!(endpoint = %self.endpoint, error = %e, "Could not answer broker close");
        }
    }
}
