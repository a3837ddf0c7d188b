//! # Token Cache
//!
//! Acquires and caches the short-lived bearer assertions that authenticate
//! both the broker connection and every published message.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐  get_token / renew_token  ┌──────────────┐  issue()  ┌──────────────┐
//! │   Workflow   │ ────────────────────────▶ │  TokenCache  │ ────────▶ │ TokenIssuer  │
//! └──────────────┘                           └──────────────┘           └──────────────┘
//!                                              │ is_expired()                 │
//!                                              ▼                              ▼
//!                                        TimeSource                 token service REST API
//! ```
//!
//! - One live token per (principal, resource).
//! - Concurrent misses for one key share a single issuer call.
//! - Issuer failures surface as `TokenAcquisitionError` and are never retried here.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod cache;
pub mod issuer;
pub mod time;
pub mod token;

pub use cache::{CacheStatsSnapshot, TokenCache, TokenCacheKey};
pub use issuer::{Credential, RestTokenIssuer, TokenAcquisitionError, TokenIssuer, TokenRequest};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use token::{assertion_xml, is_expired, privileges, Assertion, Token, TokenDecodeError};
