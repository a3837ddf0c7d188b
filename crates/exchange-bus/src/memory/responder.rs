//! Exchange responders: what the far side of a bound exchange answers.

use exchange_types::MessageProperties;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A message accepted by a bound exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// One reply sent back to the publisher's reply address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Reply carrying the request's correlation id.
    Correlated(Vec<u8>),
    /// Reply carrying some other correlation id (left over from an earlier request).
    Stale(Vec<u8>),
}

/// Decides the replies to a published request. An empty list means silence.
pub trait ExchangeResponder: Send + Sync {
    fn respond(&self, message: &PublishedMessage) -> Vec<Reply>;
}

impl<F> ExchangeResponder for F
where
    F: Fn(&PublishedMessage) -> Vec<Reply> + Send + Sync,
{
    fn respond(&self, message: &PublishedMessage) -> Vec<Reply> {
        self(message)
    }
}

/// Plays back a fixed script, one step per request, then repeats the fallback.
pub struct ScriptedResponder {
    script: Mutex<VecDeque<Vec<Reply>>>,
    fallback: Vec<Reply>,
}

impl ScriptedResponder {
    pub fn new(script: Vec<Vec<Reply>>, fallback: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
        }
    }

    /// Always answer with `body`.
    pub fn always(body: Vec<u8>) -> Self {
        Self::new(Vec::new(), vec![Reply::Correlated(body)])
    }

    /// Never answer.
    pub fn silent() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Steps not yet played.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl ExchangeResponder for ScriptedResponder {
    fn respond(&self, _message: &PublishedMessage) -> Vec<Reply> {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
