//! Session tests against a scripted broker on a local socket.

use super::codec::{write_frames, CloseReason, Frame, FrameReader, Method, PROTOCOL_HEADER};
use super::AmqpConnector;
use crate::error::TransportError;
use crate::ports::{
    BrokerChannel, BrokerConnector, ConnectParams, ReturnListener, SaslCredentials, TlsSettings,
};
use bytes::Bytes;
use exchange_types::{
    CorrelationId, DeliveryTag, MessageProperties, ReturnedMessage, TransactionId,
    DIRECT_REPLY_QUEUE, TOKEN_HEADER,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

const TOKEN: &str = "<saml:Assertion>tok</saml:Assertion>";

fn params(port: u16) -> ConnectParams {
    ConnectParams {
        host: "127.0.0.1".into(),
        port,
        virtual_host: "BF".into(),
        tls: TlsSettings {
            enabled: false,
            server_name: None,
        },
        sasl: SaslCredentials::external(TOKEN),
        connection_timeout: Duration::from_secs(2),
    }
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[derive(Default)]
struct Collecting {
    returned: Mutex<Vec<ReturnedMessage>>,
}

impl ReturnListener for Collecting {
    fn on_return(&self, returned: &ReturnedMessage) {
        self.returned.lock().push(returned.clone());
    }
}

/// Broker side of one connection.
struct ScriptedBroker {
    reader: FrameReader<TcpStream>,
}

impl ScriptedBroker {
    async fn accept(listener: &TcpListener) -> Self {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 8];
        socket.read_exact(&mut header).await.unwrap();
        assert_eq!(&header, PROTOCOL_HEADER);
        Self {
            reader: FrameReader::new(socket, 1 << 20),
        }
    }

    async fn send(&mut self, frames: &[Frame]) {
        write_frames(self.reader.get_mut(), frames).await.unwrap();
    }

    async fn send_method(&mut self, channel: u16, method: Method) {
        self.send(&[Frame::method(channel, method)]).await;
    }

    async fn recv(&mut self) -> Frame {
        self.reader.read_frame().await.unwrap()
    }

    async fn recv_method(&mut self) -> Method {
        match self.recv().await {
            Frame::Method { method, .. } => method,
            other => panic!("expected method, got {:?}", other),
        }
    }

    async fn start(&mut self, mechanisms: &str) -> Method {
        self.send_method(
            0,
            Method::ConnectionStart {
                server_properties: Default::default(),
                mechanisms: mechanisms.to_string(),
                locales: "en_US".to_string(),
            },
        )
        .await;
        self.recv_method().await
    }

    /// Handshake through `channel.open-ok`; returns start-ok and the virtual host.
    async fn open_session(&mut self) -> (Method, String) {
        let start_ok = self.start("PLAIN AMQPLAIN EXTERNAL").await;
        self.send_method(
            0,
            Method::ConnectionTune {
                channel_max: 2047,
                frame_max: 4096,
                heartbeat: 60,
            },
        )
        .await;
        assert_eq!(
            self.recv_method().await,
            Method::ConnectionTuneOk {
                channel_max: 2047,
                frame_max: 4096,
                heartbeat: 0
            }
        );
        let Method::ConnectionOpen { virtual_host } = self.recv_method().await else {
            panic!("expected connection.open");
        };
        self.send_method(0, Method::ConnectionOpenOk).await;
        assert_eq!(self.recv_method().await, Method::ChannelOpen);
        self.send_method(1, Method::ChannelOpenOk).await;
        (start_ok, virtual_host)
    }

    async fn answer_close(&mut self) {
        assert!(matches!(self.recv_method().await, Method::ChannelClose(_)));
        self.send_method(1, Method::ChannelCloseOk).await;
        assert!(matches!(self.recv_method().await, Method::ConnectionClose(_)));
        self.send_method(0, Method::ConnectionCloseOk).await;
    }

    async fn deliver(&mut self, tag: u64, properties: Option<MessageProperties>, body: &'static [u8]) {
        self.send(&[
            Frame::method(
                1,
                Method::BasicDeliver {
                    consumer_tag: "amq.ctag-1".into(),
                    delivery_tag: tag,
                    redelivered: false,
                    exchange: String::new(),
                    routing_key: "mailbox-1".into(),
                },
            ),
            Frame::Header {
                channel: 1,
                body_size: body.len() as u64,
                properties,
            },
            Frame::Body {
                channel: 1,
                payload: Bytes::from_static(body),
            },
        ])
        .await;
    }
}

#[tokio::test]
async fn test_request_reply_session() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener).await;
        let (start_ok, virtual_host) = broker.open_session().await;

        let Method::BasicConsume { queue, no_ack, .. } = broker.recv_method().await else {
            panic!("expected basic.consume");
        };
        broker
            .send_method(
                1,
                Method::BasicConsumeOk {
                    consumer_tag: "amq.ctag-1".into(),
                },
            )
            .await;

        let Method::BasicPublish {
            exchange,
            mandatory,
            ..
        } = broker.recv_method().await
        else {
            panic!("expected basic.publish");
        };
        let Frame::Header {
            body_size,
            properties: Some(request),
            ..
        } = broker.recv().await
        else {
            panic!("expected content header");
        };
        let mut body = Vec::new();
        let mut body_frames = 0;
        while (body.len() as u64) < body_size {
            let Frame::Body { payload, .. } = broker.recv().await else {
                panic!("expected content body");
            };
            body.extend_from_slice(&payload);
            body_frames += 1;
        }

        // unroutable first, then the correlated reply
        broker
            .send(&[
                Frame::method(
                    1,
                    Method::BasicReturn {
                        reply_code: 312,
                        reply_text: "NO_ROUTE".into(),
                        exchange: exchange.clone(),
                        routing_key: String::new(),
                    },
                ),
                Frame::Header {
                    channel: 1,
                    body_size: 0,
                    properties: Some(request.clone()),
                },
            ])
            .await;
        broker
            .deliver(1, Some(MessageProperties::reply_to_request(&request)), b"ok")
            .await;

        broker.answer_close().await;
        (start_ok, virtual_host, queue, no_ack, exchange, mandatory, request, body, body_frames)
    });

    let returns = Arc::new(Collecting::default());
    let mut channel = AmqpConnector::new().unwrap().connect(&params(port)).await.unwrap();
    channel.set_return_listener(returns.clone());
    channel.consume(DIRECT_REPLY_QUEUE).await.unwrap();

    let correlation_id = CorrelationId::new();
    let properties = MessageProperties::for_request(
        correlation_id,
        TransactionId::new(),
        "MSG-1",
        DIRECT_REPLY_QUEUE,
        TOKEN,
    );
    channel
        .publish("AFSEND_BESKED_EXCHANGE", "", true, properties, vec![b'x'; 5000])
        .await
        .unwrap();

    let delivery = channel.next_delivery().await.unwrap();
    assert_eq!(delivery.delivery_tag, DeliveryTag(1));
    assert_eq!(delivery.body, b"ok");
    assert!(delivery.properties.unwrap().correlates_with(correlation_id));
    channel.close().await.unwrap();

    let (start_ok, virtual_host, queue, no_ack, exchange, mandatory, request, body, body_frames) =
        server.await.unwrap();
    match start_ok {
        Method::ConnectionStartOk {
            mechanism,
            response,
            ..
        } => {
            assert_eq!(mechanism, "EXTERNAL");
            assert_eq!(response, TOKEN);
        }
        other => panic!("expected start-ok, got {:?}", other),
    }
    assert_eq!(virtual_host, "BF");
    assert_eq!(queue, DIRECT_REPLY_QUEUE);
    assert!(no_ack);
    assert_eq!(exchange, "AFSEND_BESKED_EXCHANGE");
    assert!(mandatory);
    assert_eq!(request.header(TOKEN_HEADER), Some(TOKEN));
    assert_eq!(request.message_id.as_deref(), Some("MSG-1"));
    assert_eq!(body.len(), 5000);
    // 4096 byte frames carry at most 4088 body bytes
    assert_eq!(body_frames, 2);

    let returned = returns.returned.lock();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].reply_code, 312);
    assert_eq!(returned[0].properties.message_id.as_deref(), Some("MSG-1"));
}

#[tokio::test]
async fn test_mailbox_ack_and_reject() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener).await;
        broker.open_session().await;

        let Method::BasicConsume { queue, no_ack, .. } = broker.recv_method().await else {
            panic!("expected basic.consume");
        };
        assert_eq!(queue, "mailbox-1");
        assert!(!no_ack);
        broker
            .send_method(
                1,
                Method::BasicConsumeOk {
                    consumer_tag: "amq.ctag-1".into(),
                },
            )
            .await;

        let properties = MessageProperties {
            message_id: Some("EVT-1".into()),
            ..Default::default()
        };
        broker.deliver(7, Some(properties), b"<Haendelsesbesked/>").await;
        let ack = broker.recv_method().await;

        broker.deliver(8, None, b"?").await;
        let nack = broker.recv_method().await;

        broker.answer_close().await;
        (ack, nack)
    });

    let mut channel = AmqpConnector::new().unwrap().connect(&params(port)).await.unwrap();
    channel.consume("mailbox-1").await.unwrap();

    let first = channel.next_delivery().await.unwrap();
    assert_eq!(first.properties.unwrap().business_id(), Some("EVT-1"));
    channel.ack(first.delivery_tag).await.unwrap();

    let second = channel.next_delivery().await.unwrap();
    assert!(second.properties.is_none());
    channel.nack(second.delivery_tag, false).await.unwrap();
    channel.close().await.unwrap();

    let (ack, nack) = server.await.unwrap();
    assert_eq!(
        ack,
        Method::BasicAck {
            delivery_tag: 7,
            multiple: false
        }
    );
    assert_eq!(
        nack,
        Method::BasicNack {
            delivery_tag: 8,
            multiple: false,
            requeue: false
        }
    );
}

#[tokio::test]
async fn test_external_not_offered() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener).await;
        broker
            .send_method(
                0,
                Method::ConnectionStart {
                    server_properties: Default::default(),
                    mechanisms: "PLAIN AMQPLAIN".into(),
                    locales: "en_US".into(),
                },
            )
            .await;
        // client hangs up without answering
        assert!(broker.reader.read_frame().await.is_err());
    });

    let err = AmqpConnector::new()
        .unwrap()
        .connect(&params(port))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::AccessRefused(ref msg) if msg.contains("EXTERNAL")));
    assert!(err.is_connect_failure());
    server.await.unwrap();
}

#[tokio::test]
async fn test_rejected_token() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener).await;
        broker.start("EXTERNAL").await;
        broker
            .send_method(
                0,
                Method::ConnectionClose(CloseReason {
                    reply_code: 403,
                    reply_text: "ACCESS_REFUSED - Login was refused".into(),
                    class_id: 0,
                    method_id: 0,
                }),
            )
            .await;
        broker.recv_method().await
    });

    let err = AmqpConnector::new()
        .unwrap()
        .connect(&params(port))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::AccessRefused(ref msg) if msg.contains("403")));
    assert_eq!(server.await.unwrap(), Method::ConnectionCloseOk);
}

#[tokio::test]
async fn test_unknown_queue_closes_channel() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener).await;
        broker.open_session().await;
        assert!(matches!(broker.recv_method().await, Method::BasicConsume { .. }));
        broker
            .send_method(
                1,
                Method::ChannelClose(CloseReason {
                    reply_code: 404,
                    reply_text: "NOT_FOUND - no queue 'mailbox-9'".into(),
                    class_id: 60,
                    method_id: 20,
                }),
            )
            .await;
        broker.recv_method().await
    });

    let mut channel = AmqpConnector::new().unwrap().connect(&params(port)).await.unwrap();
    let err = channel.consume("mailbox-9").await.unwrap_err();
    assert!(matches!(err, TransportError::ChannelClosed(ref msg) if msg.contains("404")));

    let again = channel
        .publish("x", "", false, MessageProperties::default(), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(again, TransportError::ChannelClosed(_)));
    assert!(channel.close().await.is_ok());
    assert_eq!(server.await.unwrap(), Method::ChannelCloseOk);
}

#[tokio::test]
async fn test_dropped_socket_fails_waiting_consumer() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut broker = ScriptedBroker::accept(&listener).await;
        broker.open_session().await;
        // socket dropped here
    });

    let mut channel = AmqpConnector::new().unwrap().connect(&params(port)).await.unwrap();
    server.await.unwrap();

    let err = channel.next_delivery().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionLost(_)));
    assert!(channel.ack(DeliveryTag(1)).await.is_err());
}

#[tokio::test]
async fn test_nothing_listening() {
    let (listener, port) = listener().await;
    drop(listener);

    let err = AmqpConnector::new()
        .unwrap()
        .connect(&params(port))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::ConnectionRefused { .. }));
}
