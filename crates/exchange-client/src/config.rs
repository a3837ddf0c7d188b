//! Exchange client configuration with validation.
//!
//! Immutable for the lifetime of a workflow run. Built from defaults, a
//! serialized document, or environment overrides.

use exchange_types::DIRECT_REPLY_QUEUE;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid broker settings: {0}")]
    InvalidBroker(String),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("Invalid attempt budget: {0}")]
    InvalidBudget(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

/// Main exchange client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Broker session settings
    pub broker: BrokerConfig,
    /// Outbound publish settings
    pub publish: PublishConfig,
    /// Inbound consume settings
    pub consume: ConsumeConfig,
    /// Principal, certificate and token scopes
    pub identity: IdentityConfig,
    /// Local payload stores
    pub store: StoreConfig,
}

impl ExchangeConfig {
    /// Defaults overlaid with `EXCHANGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values looked up by `lookup` (environment variable names).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EXCHANGE_BROKER_HOST") {
            self.broker.host = v;
        }
        if let Some(v) = lookup("EXCHANGE_BROKER_PORT") {
            self.broker.port = parse_env("EXCHANGE_BROKER_PORT", &v)?;
        }
        if let Some(v) = lookup("EXCHANGE_VIRTUAL_HOST") {
            self.broker.virtual_host = v;
        }
        if let Some(v) = lookup("EXCHANGE_TLS") {
            self.broker.tls = parse_env("EXCHANGE_TLS", &v)?;
        }
        if let Some(v) = lookup("EXCHANGE_PUBLISH_EXCHANGE") {
            self.publish.exchange = v;
        }
        if let Some(v) = lookup("EXCHANGE_ROUTING_KEY") {
            self.publish.routing_key = v;
        }
        if let Some(v) = lookup("EXCHANGE_REPLY_TIMEOUT_MS") {
            self.publish.reply_timeout_ms = parse_env("EXCHANGE_REPLY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("EXCHANGE_ATTEMPT_BUDGET") {
            self.publish.attempt_budget = parse_env("EXCHANGE_ATTEMPT_BUDGET", &v)?;
        }
        if let Some(v) = lookup("EXCHANGE_MAILBOX") {
            self.consume.mailbox = v;
        }
        if let Some(v) = lookup("EXCHANGE_WAIT_TIMEOUT_MS") {
            self.consume.wait_timeout_ms = parse_env("EXCHANGE_WAIT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("EXCHANGE_SLOT_BUDGET") {
            self.consume.slot_attempt_budget = parse_env("EXCHANGE_SLOT_BUDGET", &v)?;
        }
        if let Some(v) = lookup("EXCHANGE_MESSAGES") {
            self.consume.messages = parse_env("EXCHANGE_MESSAGES", &v)?;
        }
        if let Some(v) = lookup("EXCHANGE_PRINCIPAL") {
            self.identity.principal = v;
        }
        if let Some(v) = lookup("EXCHANGE_CERTIFICATE") {
            self.identity.certificate = v;
        }
        if let Some(v) = lookup("EXCHANGE_PUBLISH_RESOURCE") {
            self.identity.publish_resource = v;
        }
        if let Some(v) = lookup("EXCHANGE_CONSUME_RESOURCE") {
            self.identity.consume_resource = v;
        }
        if let Some(v) = lookup("EXCHANGE_TOKEN_SERVICE_URL") {
            self.identity.token_service_url = v;
        }
        if let Some(v) = lookup("EXCHANGE_OUTBOUND_STORE") {
            self.store.outbound_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("EXCHANGE_INBOUND_STORE") {
            self.store.inbound_path = PathBuf::from(v);
        }
        Ok(())
    }

    /// Validate configuration shared by both workflows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidBroker("host cannot be empty".into()));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::InvalidBroker("port cannot be 0".into()));
        }
        if self.broker.virtual_host.trim().is_empty() {
            return Err(ConfigError::InvalidBroker(
                "virtual_host cannot be empty".into(),
            ));
        }
        if self.broker.connection_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "connection timeout cannot be 0".into(),
            ));
        }
        if self.identity.principal.trim().is_empty() {
            return Err(ConfigError::Missing("identity.principal"));
        }
        Ok(())
    }

    /// Validate settings needed to publish.
    pub fn validate_publish(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.publish.exchange.trim().is_empty() {
            return Err(ConfigError::Missing("publish.exchange"));
        }
        if self.publish.reply_queue.trim().is_empty() {
            return Err(ConfigError::Missing("publish.reply_queue"));
        }
        if self.publish.reply_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "reply timeout cannot be 0".into(),
            ));
        }
        if self.publish.attempt_budget == 0 {
            return Err(ConfigError::InvalidBudget(
                "attempt_budget cannot be 0".into(),
            ));
        }
        if self.identity.publish_resource.trim().is_empty() {
            return Err(ConfigError::Missing("identity.publish_resource"));
        }
        Ok(())
    }

    /// Validate settings needed to consume.
    pub fn validate_consume(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.consume.mailbox.trim().is_empty() {
            return Err(ConfigError::Missing("consume.mailbox"));
        }
        if self.consume.wait_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("wait timeout cannot be 0".into()));
        }
        if self.consume.slot_attempt_budget == 0 {
            return Err(ConfigError::InvalidBudget(
                "slot_attempt_budget cannot be 0".into(),
            ));
        }
        if self.identity.consume_resource.trim().is_empty() {
            return Err(ConfigError::Missing("identity.consume_resource"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Broker session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host
    pub host: String,
    /// Port (default: 5671, AMQP over TLS)
    pub port: u16,
    /// Virtual host (default: BF)
    pub virtual_host: String,
    /// Negotiate TLS
    pub tls: bool,
    /// Server name to verify, when it differs from `host`
    pub tls_server_name: Option<String>,
    /// Session establishment timeout
    pub connection_timeout_ms: u64,
}

impl BrokerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5671,
            virtual_host: "BF".to_string(),
            tls: true,
            tls_server_name: None,
            connection_timeout_ms: 10_000,
        }
    }
}

/// Publish workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Exchange receiving outbound events
    pub exchange: String,
    /// Routing key (empty by default)
    pub routing_key: String,
    /// Reply address; the direct-reply pseudo-queue
    pub reply_queue: String,
    /// Deadline for a correlated reply, measured from send
    pub reply_timeout_ms: u64,
    /// Attempts per logical publish, shared by timeouts, transport
    /// errors and token renewals
    pub attempt_budget: u32,
}

impl PublishConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            exchange: "AFSEND_BESKED_EXCHANGE".to_string(),
            routing_key: String::new(),
            reply_queue: DIRECT_REPLY_QUEUE.to_string(),
            reply_timeout_ms: 10_000,
            attempt_budget: 3,
        }
    }
}

/// Consume workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeConfig {
    /// Mailbox queue to consume
    pub mailbox: String,
    /// Wait per delivery attempt
    pub wait_timeout_ms: u64,
    /// Attempts per message slot
    pub slot_attempt_budget: u32,
    /// Message slots per run
    pub messages: u32,
}

impl ConsumeConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            mailbox: String::new(),
            wait_timeout_ms: 15_000,
            slot_attempt_budget: 3,
            messages: 3,
        }
    }
}

/// Identity configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Requesting authority's business identifier
    pub principal: String,
    /// Base64 X.509 certificate bound into issued tokens
    pub certificate: String,
    /// Entity id of the publish service
    pub publish_resource: String,
    /// Entity id of the consume service
    pub consume_resource: String,
    /// Base URL of the token service
    pub token_service_url: String,
}

/// Local payload store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Sent events
    pub outbound_path: PathBuf,
    /// Received events
    pub inbound_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            outbound_path: PathBuf::from("haendelsesbesked-afsend.xml"),
            inbound_path: PathBuf::from("haendelsesbesked-afhent.xml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn configured() -> ExchangeConfig {
        let mut config = ExchangeConfig::default();
        config.identity.principal = "29189846".into();
        config.identity.publish_resource = "http://entityid/afsend".into();
        config.identity.consume_resource = "http://entityid/afhent".into();
        config.consume.mailbox = "mailbox-1".into();
        config
    }

    #[test]
    fn test_defaults() {
        let config = ExchangeConfig::default();
        assert_eq!(config.broker.port, 5671);
        assert_eq!(config.broker.virtual_host, "BF");
        assert_eq!(config.publish.exchange, "AFSEND_BESKED_EXCHANGE");
        assert_eq!(config.publish.reply_queue, DIRECT_REPLY_QUEUE);
        assert_eq!(config.publish.reply_timeout(), Duration::from_secs(10));
        assert_eq!(config.publish.attempt_budget, 3);
        assert_eq!(config.consume.wait_timeout(), Duration::from_secs(15));
        assert_eq!(config.consume.slot_attempt_budget, 3);
        assert_eq!(config.consume.messages, 3);
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            ExchangeConfig::default().validate(),
            Err(ConfigError::Missing("identity.principal"))
        );

        let config = configured();
        assert!(config.validate_publish().is_ok());
        assert!(config.validate_consume().is_ok());

        let mut zero_budget = configured();
        zero_budget.publish.attempt_budget = 0;
        assert!(matches!(
            zero_budget.validate_publish(),
            Err(ConfigError::InvalidBudget(_))
        ));

        let mut no_mailbox = configured();
        no_mailbox.consume.mailbox.clear();
        assert_eq!(
            no_mailbox.validate_consume(),
            Err(ConfigError::Missing("consume.mailbox"))
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("EXCHANGE_BROKER_HOST", "broker.example"),
            ("EXCHANGE_BROKER_PORT", "5672"),
            ("EXCHANGE_TLS", "false"),
            ("EXCHANGE_REPLY_TIMEOUT_MS", "250"),
            ("EXCHANGE_MAILBOX", "q1"),
        ]
        .into_iter()
        .collect();

        let mut config = ExchangeConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.broker.host, "broker.example");
        assert_eq!(config.broker.port, 5672);
        assert!(!config.broker.tls);
        assert_eq!(config.publish.reply_timeout_ms, 250);
        assert_eq!(config.consume.mailbox, "q1");
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = ExchangeConfig::default();
        let err = config
            .apply_env(|key| (key == "EXCHANGE_ATTEMPT_BUDGET").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let json = r#"{"broker":{"host":"mq"},"publish":{"attempt_budget":5}}"#;
        let config: ExchangeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.broker.host, "mq");
        assert_eq!(config.broker.port, 5671);
        assert_eq!(config.publish.attempt_budget, 5);
        assert_eq!(config.publish.reply_timeout_ms, 10_000);
    }
}
