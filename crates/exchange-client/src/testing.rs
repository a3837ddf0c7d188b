//! Shared fixtures for unit tests.

use crate::config::{BrokerConfig, ExchangeConfig};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use token_cache::{assertion_xml, Token, TokenAcquisitionError, TokenIssuer, TokenRequest};

pub const PRINCIPAL: &str = "29189846";
pub const PUBLISH_RESOURCE: &str = "http://entityid.example/afsend";
pub const CONSUME_RESOURCE: &str = "http://entityid.example/afhent";
pub const MAILBOX: &str = "mailbox-1";

/// A one-hour token for `resource`.
pub fn token_for(resource: &str) -> Token {
    let now = Utc::now();
    Token::from_assertion_xml(&assertion_xml(
        PRINCIPAL,
        resource,
        now - Duration::minutes(1),
        now + Duration::hours(1),
        "<Privileges/>",
    ))
}

pub fn broker_config() -> BrokerConfig {
    BrokerConfig {
        connection_timeout_ms: 1_000,
        ..BrokerConfig::default()
    }
}

pub fn configured() -> ExchangeConfig {
    let mut config = ExchangeConfig::default();
    config.broker = broker_config();
    config.identity.principal = PRINCIPAL.into();
    config.identity.certificate = "MIIBcert".into();
    config.identity.publish_resource = PUBLISH_RESOURCE.into();
    config.identity.consume_resource = CONSUME_RESOURCE.into();
    config.publish.reply_timeout_ms = 50;
    config.consume.mailbox = MAILBOX.into();
    config.consume.wait_timeout_ms = 50;
    config
}

/// Issues a distinct one-hour token per call.
#[derive(Default)]
pub struct MintingIssuer {
    calls: AtomicUsize,
    refuse: bool,
}

impl MintingIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            refuse: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for MintingIssuer {
    async fn issue(&self, request: TokenRequest) -> Result<Token, TokenAcquisitionError> {
        let serial = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(TokenAcquisitionError::Rejected {
                status: 403,
                detail: "principal not authorized".into(),
            });
        }
        let now = Utc::now();
        Ok(Token::from_assertion_xml(&assertion_xml(
            &request.principal,
            &request.resource,
            now - Duration::minutes(1),
            now + Duration::hours(1),
            &format!("<Privileges serial=\"{}\"/>", serial),
        )))
    }
}
