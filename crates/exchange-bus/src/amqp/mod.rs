//! # AMQP Broker Adapter
//!
//! `BrokerConnector` speaking AMQP 0-9-1 to a RabbitMQ style broker.
//!
//! ## Session Setup
//!
//! 1. TCP connect, then TLS (rustls, Mozilla roots) when enabled
//! 2. `connection.start`: the broker must offer the requested SASL mechanism
//! 3. `connection.start-ok` with mechanism `EXTERNAL` and the decoded bearer
//!    assertion as the response
//! 4. `connection.tune` / `tune-ok` with heartbeats disabled
//! 5. `connection.open` on the virtual host, then `channel.open` on channel 1
//!
//! The whole setup is bounded by `ConnectParams::connection_timeout`.
//! Authentication failures surface as `TransportError::AccessRefused`.

mod channel;
pub mod codec;

pub use channel::AmqpChannel;

use crate::error::TransportError;
use crate::ports::{BrokerChannel, BrokerConnector, ConnectParams};
use async_trait::async_trait;
use codec::{write_frames, CloseReason, CodecError, FieldTable, FieldValue, Frame, FrameReader, Method};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Channel used for all traffic after the handshake.
pub(crate) const SESSION_CHANNEL: u16 = 1;

/// Largest frame we accept or send.
pub(crate) const MAX_FRAME_SIZE: u32 = 128 * 1024;

/// Socket carrying the session, plain or TLS.
pub(crate) trait SessionStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> SessionStream for T {}

pub(crate) type BoxedStream = Box<dyn SessionStream>;

/// Negotiated session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
}

/// Opens AMQP sessions over TCP, with TLS when the parameters ask for it.
#[derive(Clone)]
pub struct AmqpConnector {
    tls: Arc<ClientConfig>,
}

impl AmqpConnector {
    /// Connector trusting the Mozilla root set.
    pub fn new() -> Result<Self, TransportError> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self::with_tls_config(Arc::new(config)))
    }

    /// Connector with a caller supplied TLS configuration.
    pub fn with_tls_config(tls: Arc<ClientConfig>) -> Self {
        Self { tls }
    }

    async fn establish(&self, params: &ConnectParams) -> Result<AmqpChannel, TransportError> {
        let endpoint = params.endpoint();
        let tcp = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| TransportError::ConnectionRefused {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        // frames are written whole; no need to coalesce
        let _ = tcp.set_nodelay(true);

        let stream: BoxedStream = if params.tls.enabled {
            let name = params
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| params.host.clone());
            let server_name = ServerName::try_from(name.clone())
                .map_err(|e| TransportError::Tls(format!("invalid server name {}: {}", name, e)))?;
            let tls = TlsConnector::from(Arc::clone(&self.tls))
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let (reader, tuning) = handshake(stream, params).await?;
        info!(
            endpoint = %endpoint,
            frame_max = tuning.frame_max,
            "Broker session open"
        );
        Ok(AmqpChannel::start(
            endpoint,
            reader,
            tuning,
            params.connection_timeout,
        ))
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<Box<dyn BrokerChannel>, TransportError> {
        let endpoint = params.endpoint();
        debug!(endpoint = %endpoint, mechanism = %params.sasl.mechanism, "Connecting to broker");

        match tokio::time::timeout(params.connection_timeout, self.establish(params)).await {
            Ok(Ok(channel)) => Ok(Box::new(channel)),
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint, error = %e, "Broker connect failed");
                Err(e)
            }
            Err(_) => Err(TransportError::ConnectionRefused {
                endpoint,
                reason: format!(
                    "no session within {} ms",
                    params.connection_timeout.as_millis()
                ),
            }),
        }
    }
}

/// Client properties announced in `connection.start-ok`.
fn client_properties() -> FieldTable {
    let mut capabilities = FieldTable::new();
    for capability in [
        "authentication_failure_close",
        "basic.nack",
        "connection.blocked",
        "consumer_cancel_notify",
    ] {
        capabilities.insert(capability.to_string(), FieldValue::Bool(true));
    }

    let mut properties = FieldTable::new();
    properties.insert(
        "product".to_string(),
        FieldValue::Text(env!("CARGO_PKG_NAME").to_string()),
    );
    properties.insert(
        "version".to_string(),
        FieldValue::Text(env!("CARGO_PKG_VERSION").to_string()),
    );
    properties.insert("platform".to_string(), FieldValue::Text("Rust".to_string()));
    properties.insert("capabilities".to_string(), FieldValue::Table(capabilities));
    properties
}

fn protocol_error(endpoint: &str, error: CodecError) -> TransportError {
    match error {
        CodecError::Eof => TransportError::AccessRefused(format!(
            "{} closed the connection during the handshake",
            endpoint
        )),
        CodecError::ProtocolMismatch => TransportError::ConnectionRefused {
            endpoint: endpoint.to_string(),
            reason: error.to_string(),
        },
        other => TransportError::ConnectionLost(other.to_string()),
    }
}

/// Answer a broker `connection.close` during setup and turn it into an error.
async fn refused<S: SessionStream>(
    reader: &mut FrameReader<S>,
    endpoint: &str,
    reason: CloseReason,
) -> TransportError {
    let _ = write_frames(reader.get_mut(), &[Frame::method(0, Method::ConnectionCloseOk)]).await;
    warn!(endpoint = %endpoint, reason = %reason, "Broker refused session");
    TransportError::AccessRefused(reason.to_string())
}

/// Run connection setup through `channel.open-ok`.
async fn handshake(
    mut stream: BoxedStream,
    params: &ConnectParams,
) -> Result<(FrameReader<BoxedStream>, Tuning), TransportError> {
    let endpoint = params.endpoint();
    let lost = |e: CodecError| protocol_error(&endpoint, e);

    stream
        .write_all(codec::PROTOCOL_HEADER)
        .await
        .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
    let mut reader = FrameReader::new(stream, MAX_FRAME_SIZE as usize);

    // start
    let mechanisms = match reader.read_frame().await.map_err(lost)? {
        Frame::Method {
            method: Method::ConnectionStart { mechanisms, .. },
            ..
        } => mechanisms,
        other => return Err(unexpected(&endpoint, "connection.start", &other)),
    };
    if !mechanisms
        .split_whitespace()
        .any(|m| m == params.sasl.mechanism)
    {
        return Err(TransportError::AccessRefused(format!(
            "broker does not offer SASL {} (offers: {})",
            params.sasl.mechanism, mechanisms
        )));
    }

    write_frames(
        reader.get_mut(),
        &[Frame::method(
            0,
            Method::ConnectionStartOk {
                client_properties: client_properties(),
                mechanism: params.sasl.mechanism.clone(),
                response: params.sasl.response.clone(),
                locale: "en_US".to_string(),
            },
        )],
    )
    .await
    .map_err(lost)?;

    // secure* then tune
    let tuning = loop {
        match reader.read_frame().await.map_err(lost)? {
            Frame::Method {
                method: Method::ConnectionSecure { .. },
                ..
            } => {
                write_frames(
                    reader.get_mut(),
                    &[Frame::method(
                        0,
                        Method::ConnectionSecureOk {
                            response: params.sasl.response.clone(),
                        },
                    )],
                )
                .await
                .map_err(lost)?;
            }
            Frame::Method {
                method:
                    Method::ConnectionTune {
                        channel_max,
                        frame_max,
                        ..
                    },
                ..
            } => {
                break Tuning {
                    channel_max,
                    frame_max: negotiate_frame_max(frame_max),
                };
            }
            Frame::Method {
                method: Method::ConnectionClose(reason),
                ..
            } => return Err(refused(&mut reader, &endpoint, reason).await),
            other => return Err(unexpected(&endpoint, "connection.tune", &other)),
        }
    };

    write_frames(
        reader.get_mut(),
        &[
            Frame::method(
                0,
                Method::ConnectionTuneOk {
                    channel_max: tuning.channel_max,
                    frame_max: tuning.frame_max,
                    heartbeat: 0,
                },
            ),
            Frame::method(
                0,
                Method::ConnectionOpen {
                    virtual_host: params.virtual_host.clone(),
                },
            ),
        ],
    )
    .await
    .map_err(lost)?;
    reader.set_max_size(tuning.frame_max as usize);

    match reader.read_frame().await.map_err(lost)? {
        Frame::Method {
            method: Method::ConnectionOpenOk,
            ..
        } => {}
        Frame::Method {
            method: Method::ConnectionClose(reason),
            ..
        } => return Err(refused(&mut reader, &endpoint, reason).await),
        other => return Err(unexpected(&endpoint, "connection.open-ok", &other)),
    }

    write_frames(reader.get_mut(), &[Frame::method(SESSION_CHANNEL, Method::ChannelOpen)])
        .await
        .map_err(lost)?;
    match reader.read_frame().await.map_err(lost)? {
        Frame::Method {
            method: Method::ChannelOpenOk,
            ..
        } => {}
        Frame::Method {
            method: Method::ConnectionClose(reason),
            ..
        } => return Err(refused(&mut reader, &endpoint, reason).await),
        other => return Err(unexpected(&endpoint, "channel.open-ok", &other)),
    }

    Ok((reader, tuning))
}

/// Frame size we use: the broker's limit, capped by ours. 0 means unlimited.
fn negotiate_frame_max(offered: u32) -> u32 {
    if offered == 0 {
        MAX_FRAME_SIZE
    } else {
        offered.min(MAX_FRAME_SIZE)
    }
}

fn unexpected(endpoint: &str, expected: &str, frame: &Frame) -> TransportError {
    TransportError::ConnectionLost(format!(
        "{} sent {:?} while waiting for {}",
        endpoint, frame, expected
    ))
}

#[cfg(test)]
mod tests;
