//! # Token Cache
//!
//! Keyed by (principal, resource). Holds at most one live token per key.
//!
//! ## Single Flight
//!
//! ```text
//!  caller A ──┐                    ┌──────────────┐
//!  caller B ──┼── lock ─ lookup ──▶│ Ready(token) │── expired? ─▶ evict
//!  caller C ──┘     │              ├──────────────┤
//!                   │              │ InFlight(f)  │◀── join shared fetch
//!                   │              └──────────────┘
//!                   └── vacant ──▶ start fetch, mark InFlight, unlock, await
//! ```
//!
//! The map lock is held only for the in-memory check/update, never across
//! the issuer call. A completed fetch is written back only if the slot still
//! belongs to that flight; a failed fetch clears the slot so the next caller
//! retries.

use crate::issuer::{Credential, TokenAcquisitionError, TokenIssuer, TokenRequest};
use crate::time::{SystemTimeSource, TimeSource};
use crate::token::{is_expired, Token};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type SharedFetch = Shared<BoxFuture<'static, Result<Token, TokenAcquisitionError>>>;

/// Cache key: one live token per (principal, resource).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenCacheKey {
    pub principal: String,
    pub resource: String,
}

impl TokenCacheKey {
    pub fn new(principal: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for TokenCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{principal:{},resource:{}}}", self.principal, self.resource)
    }
}

enum Slot {
    Ready(Token),
    InFlight { flight: u64, fetch: SharedFetch },
}

enum Lookup {
    Ready(Token),
    InFlight(u64, SharedFetch),
    Vacant,
}

/// Statistics for the token cache
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered from a live cached token
    pub hits: AtomicU64,
    /// Lookups that found no entry
    pub misses: AtomicU64,
    /// Cached tokens discarded because they were expired or undecodable
    pub evictions: AtomicU64,
    /// Issuer calls started
    pub fetches: AtomicU64,
    /// Callers that joined a fetch already in flight
    pub joined: AtomicU64,
    /// Forced renewals requested
    pub renewals: AtomicU64,
}

/// Point-in-time copy of `CacheStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub fetches: u64,
    pub joined: u64,
    pub renewals: u64,
}

/// Expiry-aware, single-flight token cache.
pub struct TokenCache {
    issuer: Arc<dyn TokenIssuer>,
    clock: Arc<dyn TimeSource>,
    slots: Mutex<HashMap<TokenCacheKey, Slot>>,
    next_flight: AtomicU64,
    stats: CacheStats,
}

impl TokenCache {
    /// Create a cache over `issuer` using the system clock.
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self::with_time_source(issuer, Arc::new(SystemTimeSource))
    }

    /// Create a cache with an explicit clock.
    pub fn with_time_source(issuer: Arc<dyn TokenIssuer>, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            issuer,
            clock,
            slots: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(1),
            stats: CacheStats::default(),
        }
    }

    /// Return the live token for (principal, resource), fetching one if the
    /// entry is absent or expired.
    ///
    /// # Errors
    ///
    /// `TokenAcquisitionError` when the issuer fails. Not retried here.
    pub async fn get_token(
        &self,
        principal: &str,
        credential: &Credential,
        resource: &str,
    ) -> Result<Token, TokenAcquisitionError> {
        let key = TokenCacheKey::new(principal, resource);
        debug!(key = %key, "Checking cache for token");

        let (flight, fetch) = {
            let mut slots = self.slots.lock();
            match Self::lookup(&slots, &key) {
                Lookup::Ready(token) => {
                    if self.is_live(&key, &token) {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %key, "Cache contains valid token");
                        return Ok(token);
                    }
                    debug!(key = %key, "Cache contains expired token");
                    slots.remove(&key);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    self.start_fetch(&mut slots, &key, credential)
                }
                Lookup::InFlight(flight, fetch) => {
                    self.stats.joined.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, flight, "Joining token fetch in flight");
                    (flight, fetch)
                }
                Lookup::Vacant => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Cache does not contain token");
                    self.start_fetch(&mut slots, &key, credential)
                }
            }
        };

        let result = fetch.await;
        self.settle(&key, flight, &result);
        result
    }

    /// Discard the cached token for (principal, resource) and fetch a new one.
    ///
    /// Performs exactly one issuer call, or joins the one already running.
    pub async fn renew_token(
        &self,
        principal: &str,
        credential: &Credential,
        resource: &str,
    ) -> Result<Token, TokenAcquisitionError> {
        let key = TokenCacheKey::new(principal, resource);
        self.stats.renewals.fetch_add(1, Ordering::Relaxed);

        let (flight, fetch) = {
            let mut slots = self.slots.lock();
            match Self::lookup(&slots, &key) {
                Lookup::InFlight(flight, fetch) => {
                    self.stats.joined.fetch_add(1, Ordering::Relaxed);
                    (flight, fetch)
                }
                Lookup::Ready(_) | Lookup::Vacant => {
                    debug!(key = %key, "Renewing token");
                    slots.remove(&key);
                    self.start_fetch(&mut slots, &key, credential)
                }
            }
        };

        let result = fetch.await;
        self.settle(&key, flight, &result);
        result
    }

    /// Drop any cached or pending entry for the key.
    pub fn invalidate(&self, principal: &str, resource: &str) {
        self.slots
            .lock()
            .remove(&TokenCacheKey::new(principal, resource));
    }

    /// Number of keys with a ready or pending token.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Snapshot of cache statistics.
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            joined: self.stats.joined.load(Ordering::Relaxed),
            renewals: self.stats.renewals.load(Ordering::Relaxed),
        }
    }

    fn lookup(slots: &HashMap<TokenCacheKey, Slot>, key: &TokenCacheKey) -> Lookup {
        match slots.get(key) {
            Some(Slot::Ready(token)) => Lookup::Ready(token.clone()),
            Some(Slot::InFlight { flight, fetch }) => Lookup::InFlight(*flight, fetch.clone()),
            None => Lookup::Vacant,
        }
    }

    fn is_live(&self, key: &TokenCacheKey, token: &Token) -> bool {
        match is_expired(token, self.clock.now()) {
            Ok(expired) => !expired,
            Err(e) => {
                warn!(key = %key, error = %e, "Cached token cannot be decoded, treating as expired");
                false
            }
        }
    }

    fn start_fetch(
        &self,
        slots: &mut HashMap<TokenCacheKey, Slot>,
        key: &TokenCacheKey,
        credential: &Credential,
    ) -> (u64, SharedFetch) {
        let flight = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let issuer = Arc::clone(&self.issuer);
        let request = TokenRequest {
            principal: key.principal.clone(),
            credential: credential.clone(),
            resource: key.resource.clone(),
        };

        let fetch = async move { issuer.issue(request).await }.boxed().shared();
        slots.insert(
            key.clone(),
            Slot::InFlight {
                flight,
                fetch: fetch.clone(),
            },
        );
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        (flight, fetch)
    }

    fn settle(
        &self,
        key: &TokenCacheKey,
        flight: u64,
        result: &Result<Token, TokenAcquisitionError>,
    ) {
        let mut slots = self.slots.lock();
        let owns_slot = matches!(
            slots.get(key),
            Some(Slot::InFlight { flight: current, .. }) if *current == flight
        );
        if !owns_slot {
            return;
        }

        match result {
            Ok(token) => {
                debug!(key = %key, "Adding token to cache");
                slots.insert(key.clone(), Slot::Ready(token.clone()));
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Token fetch failed");
                slots.remove(key);
            }
        }
    }
}
