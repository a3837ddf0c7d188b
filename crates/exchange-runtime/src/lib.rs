//! # Exchange Runtime
//!
//! Composition root for the `exchange` binary.
//!
//! ## Startup Sequence
//!
//! 1. Load `ExchangeConfig` from `EXCHANGE_*` environment variables
//! 2. Install the tracing subscriber from `TelemetryConfig`
//! 3. Wire the REST token issuer, the AMQP connector and the file stores
//! 4. Fetch a token for the workflow's resource and log its privileges
//! 5. Run the publish or consume workflow and report the outcome

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod event_file;
pub mod wiring;

pub use event_file::{load_event, EventFileError};
pub use wiring::{ExchangeRuntime, RuntimeError};
