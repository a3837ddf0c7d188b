//! Broker connection management.
//!
//! A `ConnectionManager` owns at most one session. Every open presents the
//! token it is given through SASL `EXTERNAL`, then re-installs the consumer
//! and return listener chosen at construction, so a reopened session looks
//! exactly like the first one to its workflow.

use crate::config::BrokerConfig;
use exchange_bus::{
    BrokerChannel, BrokerConnector, ConnectParams, ReturnListener, SaslCredentials, TlsSettings,
    TransportError,
};
use std::sync::Arc;
use token_cache::Token;
use tracing::{debug, info, warn};

/// Consumer installed on every freshly opened channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerSetup {
    /// Reply consumer on the given reply address (publishing side)
    ReplyQueue(String),
    /// Manual-ack consumer on a named mailbox (consuming side)
    Mailbox(String),
}

impl ConsumerSetup {
    pub fn queue(&self) -> &str {
        match self {
            Self::ReplyQueue(queue) | Self::Mailbox(queue) => queue,
        }
    }
}

/// Owns the broker session of one workflow.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    broker: BrokerConfig,
    setup: ConsumerSetup,
    return_listener: Option<Arc<dyn ReturnListener>>,
    channel: Option<Box<dyn BrokerChannel>>,
    reconnects: u32,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, broker: BrokerConfig, setup: ConsumerSetup) -> Self {
        Self {
            connector,
            broker,
            setup,
            return_listener: None,
            channel: None,
            reconnects: 0,
        }
    }

    /// Install `listener` on every channel this manager opens.
    pub fn with_return_listener(mut self, listener: Arc<dyn ReturnListener>) -> Self {
        self.return_listener = Some(listener);
        self
    }

    /// Session parameters authenticated by `token`.
    pub fn connect_params(&self, token: &Token) -> Result<ConnectParams, TransportError> {
        let decoded = token
            .decoded()
            .map_err(|e| TransportError::AccessRefused(format!("token cannot be presented: {}", e)))?;

        Ok(ConnectParams {
            host: self.broker.host.clone(),
            port: self.broker.port,
            virtual_host: self.broker.virtual_host.clone(),
            tls: TlsSettings {
                enabled: self.broker.tls,
                server_name: self.broker.tls_server_name.clone(),
            },
            sasl: SaslCredentials::external(decoded),
            connection_timeout: self.broker.connection_timeout(),
        })
    }

    /// Open a session authenticated by `token` and install the consumer.
    ///
    /// Any session already open is closed first.
    pub async fn open(&mut self, token: &Token) -> Result<(), TransportError> {
        if self.channel.is_some() {
            self.close().await;
        }

        let params = self.connect_params(token)?;
        let endpoint = params.endpoint();
        debug!(endpoint = %endpoint, "Opening broker session");

        let mut channel =
            match tokio::time::timeout(params.connection_timeout, self.connector.connect(&params))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(TransportError::ConnectionRefused {
                        endpoint,
                        reason: format!(
                            "no session within {} ms",
                            params.connection_timeout.as_millis()
                        ),
                    })
                }
            };

        if let Some(listener) = &self.return_listener {
            channel.set_return_listener(Arc::clone(listener));
        }

        if let Err(e) = channel.consume(self.setup.queue()).await {
            warn!(queue = self.setup.queue(), error = %e, "Consumer setup failed");
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "Close after failed consumer setup");
            }
            return Err(e);
        }

        info!(endpoint = %endpoint, queue = self.setup.queue(), "Connected to broker");
        self.channel = Some(channel);
        Ok(())
    }

    /// Close, then open with `token`.
    pub async fn reopen(&mut self, token: &Token) -> Result<(), TransportError> {
        self.close().await;
        self.reconnects += 1;
        debug!(reconnects = self.reconnects, "Reopening broker session");
        self.open(token).await
    }

    /// Close the session if open. Errors are logged, never returned.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            match channel.close().await {
                Ok(()) => debug!("Broker session closed"),
                Err(e) => warn!(error = %e, "Error closing broker session"),
            }
        }
    }

    /// The open channel.
    pub fn channel(&mut self) -> Result<&mut (dyn BrokerChannel + 'static), TransportError> {
        match self.channel.as_mut() {
            Some(channel) => Ok(&mut **channel),
            None => Err(TransportError::NotConnected),
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Number of `reopen` calls so far.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn setup(&self) -> &ConsumerSetup {
        &self.setup
    }
}
