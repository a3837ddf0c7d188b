//! Composition root: configuration in, ready workflows out.

use exchange_bus::{AmqpConnector, BrokerConnector, TransportError};
use exchange_client::{
    ConfigError, ConsumeError, ConsumeReport, ConsumeWorkflow, EventStore, ExchangeConfig,
    ExchangeContext, FileEventStore, LoggingProcessor, PublishError, PublishOptions,
    PublishReceipt, PublishWorkflow, TokenSource,
};
use exchange_types::Event;
use std::sync::Arc;
use thiserror::Error;
use token_cache::{RestTokenIssuer, TokenAcquisitionError, TokenCache, TokenIssuer};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Token(#[from] TokenAcquisitionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consume(#[from] ConsumeError),
}

/// Everything one process needs to publish or consume.
pub struct ExchangeRuntime {
    context: ExchangeContext,
    connector: Arc<dyn BrokerConnector>,
    outbound: Arc<dyn EventStore>,
    inbound: Arc<dyn EventStore>,
}

impl ExchangeRuntime {
    /// Production wiring: REST token service, AMQP over TLS, file stores.
    pub fn from_config(config: ExchangeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        if config.identity.token_service_url.trim().is_empty() {
            return Err(ConfigError::Missing("identity.token_service_url").into());
        }

        let issuer = RestTokenIssuer::new(config.identity.token_service_url.clone())?;
        info!(issue_url = %issuer.issue_url(), "Token service configured");
        let connector = AmqpConnector::new()?;

        Ok(Self::with_parts(config, Arc::new(issuer), Arc::new(connector)))
    }

    /// Wire the given issuer and connector; stores follow `config.store`.
    pub fn with_parts(
        config: ExchangeConfig,
        issuer: Arc<dyn TokenIssuer>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        debug!(
            outbound = %config.store.outbound_path.display(),
            inbound = %config.store.inbound_path.display(),
            "Event stores"
        );
        let outbound = Arc::new(FileEventStore::new(config.store.outbound_path.clone()));
        let inbound = Arc::new(FileEventStore::new(config.store.inbound_path.clone()));
        let context = ExchangeContext::new(config, Arc::new(TokenCache::new(issuer)));

        Self {
            context,
            connector,
            outbound,
            inbound,
        }
    }

    pub fn context(&self) -> &ExchangeContext {
        &self.context
    }

    /// Fetch the publish token, log its privileges, then publish `event`.
    pub async fn publish(
        &self,
        event: Event,
        options: PublishOptions,
    ) -> Result<PublishReceipt, RuntimeError> {
        log_privileges(&self.context.publish_tokens()).await?;

        let workflow = PublishWorkflow::new(
            self.context.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.outbound),
        );
        Ok(workflow.publish(event, options).await?)
    }

    /// Fetch the consume token, log its privileges, then drain the mailbox.
    ///
    /// `messages` overrides `consume.messages`.
    pub async fn consume(&self, messages: Option<u32>) -> Result<ConsumeReport, RuntimeError> {
        log_privileges(&self.context.consume_tokens()).await?;

        let workflow = ConsumeWorkflow::new(
            self.context.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.inbound),
            Arc::new(LoggingProcessor),
        );
        let report = match messages {
            Some(count) => workflow.consume(count).await?,
            None => workflow.run().await?,
        };
        Ok(report)
    }
}

/// Log the decoded privilege list of the current token.
///
/// A token without readable privileges is still usable; that only warns.
async fn log_privileges(tokens: &TokenSource) -> Result<(), RuntimeError> {
    let token = tokens.current().await?;
    match token_cache::privileges(&token) {
        Ok(privileges) => info!(
            principal = tokens.principal(),
            resource = tokens.resource(),
            %privileges,
            "Token privileges"
        ),
        Err(e) => warn!(
            resource = tokens.resource(),
            error = %e,
            "Token carries no readable privileges"
        ),
    }
    Ok(())
}
