//! Shared fixtures for the scenario suites.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use exchange_bus::{InMemoryBroker, Reply, ScriptedResponder};
use exchange_client::{
    reply, EventStore, ExchangeConfig, ExchangeContext, InMemoryEventStore, Processor,
    ProcessorError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use token_cache::{
    assertion_xml, ManualTimeSource, TimeSource, Token, TokenAcquisitionError, TokenCache,
    TokenIssuer, TokenRequest,
};

pub const PRINCIPAL: &str = "29189846";
pub const PUBLISH_RESOURCE: &str = "http://entityid.beskedfordeler.example/afsend";
pub const CONSUME_RESOURCE: &str = "http://entityid.beskedfordeler.example/afhent";
pub const EXCHANGE: &str = "AFSEND_BESKED_EXCHANGE";
pub const MAILBOX: &str = "8c1f7c2e-dueslag";

/// Fixed start instant for the manual clock.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Client configuration with short timeouts.
pub fn config() -> ExchangeConfig {
    let mut config = ExchangeConfig::default();
    config.broker.connection_timeout_ms = 1_000;
    config.identity.principal = PRINCIPAL.into();
    config.identity.certificate = "MIIC-test-certificate".into();
    config.identity.publish_resource = PUBLISH_RESOURCE.into();
    config.identity.consume_resource = CONSUME_RESOURCE.into();
    config.publish.reply_timeout_ms = 60;
    config.consume.mailbox = MAILBOX.into();
    config.consume.wait_timeout_ms = 60;
    config
}

/// Mock token service counting issue calls.
///
/// Tokens are valid from the clock's current instant for `lifetime`.
pub struct CountingIssuer {
    clock: Arc<ManualTimeSource>,
    lifetime: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<TokenRequest>>,
}

impl CountingIssuer {
    pub fn new(clock: Arc<ManualTimeSource>, lifetime: Duration) -> Self {
        Self {
            clock,
            lifetime,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TokenRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TokenIssuer for CountingIssuer {
    async fn issue(&self, request: TokenRequest) -> Result<Token, TokenAcquisitionError> {
        let serial = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now();
        let token = Token::from_assertion_xml(&assertion_xml(
            &request.principal,
            &request.resource,
            now,
            now + self.lifetime,
            &format!("<Privileges serial=\"{}\"/>", serial),
        ));
        self.requests.lock().push(request);
        Ok(token)
    }
}

/// Processor recording each processed id; optionally failing for one id.
#[derive(Default)]
pub struct RecordingProcessor {
    processed: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, message_id: &str) {
        *self.fail_on.lock() = Some(message_id.to_string());
    }

    pub fn heal(&self) {
        *self.fail_on.lock() = None;
    }

    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().clone()
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, message_id: &str, _payload: &[u8]) -> Result<(), ProcessorError> {
        if self.fail_on.lock().as_deref() == Some(message_id) {
            return Err(ProcessorError::new(format!("cannot handle {}", message_id)));
        }
        self.processed.lock().push(message_id.to_string());
        Ok(())
    }
}

/// Everything a scenario needs, wired together.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub clock: Arc<ManualTimeSource>,
    pub issuer: Arc<CountingIssuer>,
    pub context: ExchangeContext,
    pub outbound: InMemoryEventStore,
    pub inbound: InMemoryEventStore,
    pub processor: Arc<RecordingProcessor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: ExchangeConfig) -> Self {
        let clock = Arc::new(ManualTimeSource::new(epoch()));
        let issuer = Arc::new(CountingIssuer::new(Arc::clone(&clock), Duration::minutes(5)));
        let tokens = TokenCache::with_time_source(issuer.clone(), clock.clone());
        let broker = InMemoryBroker::default();
        broker.declare_queue(MAILBOX);

        Self {
            broker,
            clock,
            issuer,
            context: ExchangeContext::new(config, Arc::new(tokens)),
            outbound: InMemoryEventStore::new(),
            inbound: InMemoryEventStore::new(),
            processor: Arc::new(RecordingProcessor::new()),
        }
    }

    /// Bind the publish exchange to a scripted responder.
    pub fn script(&self, steps: Vec<Vec<Reply>>, fallback: Vec<Reply>) {
        self.broker
            .bind_exchange(EXCHANGE, Arc::new(ScriptedResponder::new(steps, fallback)));
    }

    pub fn outbound_store(&self) -> Arc<dyn EventStore> {
        Arc::new(self.outbound.clone())
    }

    pub fn inbound_store(&self) -> Arc<dyn EventStore> {
        Arc::new(self.inbound.clone())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// A correlated reply with `status`.
pub fn answer(status: i64) -> Reply {
    Reply::Correlated(reply::render(status, None))
}
