//! Long-lived state shared by workflows.

use crate::config::ExchangeConfig;
use crate::ledger::ProcessedMessageLedger;
use std::sync::Arc;
use token_cache::{Credential, Token, TokenAcquisitionError, TokenCache};
use tracing::debug;

/// Owner of the configuration, token cache, ledger and credential.
///
/// Cheap to clone; clones share the cache and the ledger.
#[derive(Clone)]
pub struct ExchangeContext {
    config: Arc<ExchangeConfig>,
    tokens: Arc<TokenCache>,
    ledger: ProcessedMessageLedger,
    credential: Credential,
}

impl ExchangeContext {
    /// Credential is taken from `identity.certificate`.
    pub fn new(config: ExchangeConfig, tokens: Arc<TokenCache>) -> Self {
        let credential = Credential::new(config.identity.certificate.clone());
        Self {
            config: Arc::new(config),
            tokens,
            ledger: ProcessedMessageLedger::new(),
            credential,
        }
    }

    /// Share an existing ledger.
    pub fn with_ledger(mut self, ledger: ProcessedMessageLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    pub fn ledger(&self) -> &ProcessedMessageLedger {
        &self.ledger
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Token handle scoped to the publish service.
    pub fn publish_tokens(&self) -> TokenSource {
        self.token_source(&self.config.identity.publish_resource)
    }

    /// Token handle scoped to the consume service.
    pub fn consume_tokens(&self) -> TokenSource {
        self.token_source(&self.config.identity.consume_resource)
    }

    pub fn token_source(&self, resource: &str) -> TokenSource {
        TokenSource {
            cache: Arc::clone(&self.tokens),
            principal: self.config.identity.principal.clone(),
            resource: resource.to_string(),
            credential: self.credential.clone(),
        }
    }
}

/// Token acquisition bound to one (principal, resource).
#[derive(Clone)]
pub struct TokenSource {
    cache: Arc<TokenCache>,
    principal: String,
    resource: String,
    credential: Credential,
}

impl TokenSource {
    /// The live cached token, fetched if absent or expired.
    pub async fn current(&self) -> Result<Token, TokenAcquisitionError> {
        self.cache
            .get_token(&self.principal, &self.credential, &self.resource)
            .await
    }

    /// Discard the cached token and fetch a new one.
    pub async fn renew(&self) -> Result<Token, TokenAcquisitionError> {
        debug!(principal = %self.principal, resource = %self.resource, "Forcing token renewal");
        self.cache
            .renew_token(&self.principal, &self.credential, &self.resource)
            .await
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}
