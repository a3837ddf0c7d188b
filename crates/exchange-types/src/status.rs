//! Reply status codes returned by the distributor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decoded status of a publish reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// `20`: the event was accepted.
    Success,
    /// `41`: the bearer token presented on the message has expired.
    TokenExpired,
    /// Any other code: terminal business failure.
    Other(i64),
}

impl ReplyStatus {
    /// Status code for an accepted event.
    pub const SUCCESS_CODE: i64 = 20;

    /// Status code for an expired token.
    pub const TOKEN_EXPIRED_CODE: i64 = 41;

    /// Numeric wire code.
    pub fn code(&self) -> i64 {
        match self {
            Self::Success => Self::SUCCESS_CODE,
            Self::TokenExpired => Self::TOKEN_EXPIRED_CODE,
            Self::Other(code) => *code,
        }
    }
}

impl From<i64> for ReplyStatus {
    fn from(code: i64) -> Self {
        match code {
            Self::SUCCESS_CODE => Self::Success,
            Self::TOKEN_EXPIRED_CODE => Self::TokenExpired,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
