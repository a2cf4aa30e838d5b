//! # Cache Policy Engine
//!
//! Tracks when each cache key was last refreshed from the network and decides
//! whether a cached read still satisfies a request.
//!
//! ## Freshness
//!
//! An entry recorded at `t0` with TTL `T` is valid iff `now - t0 < T`. The
//! injected [`Clock`] supplies `now`, so tests move time explicitly.
//!
//! ## Invalidation
//!
//! Every use case follows one contract: reads are TTL-gated by their cache key,
//! and mutations name the key prefixes they make stale. Those prefixes are
//! cleared with [`CachePolicy::invalidate_in`] inside the same transaction as
//! the mutation's write.
//!
//! ## Keys
//!
//! Keys follow `<feature>/<scope>?<param>=<value>&...`, for example
//! `inbox/inbox?contextCode=all` or plain `context_colors`. [`CacheKey`]
//! builds them with parameters in a canonical order.

use crate::record::Entity;
use crate::scope::{Predicate, Scope};
use crate::store::{LocalStore, ReadableExt, Transaction};
use crate::Result;
use bridge_traits::Clock;
use chrono::{DateTime, Utc};
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// TTL for use cases that do not declare one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Zero TTL: the entry is recorded but never valid.
pub const NO_CACHE: Duration = Duration::ZERO;

/// When a cache key was last refreshed and for how long that refresh holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub last_refresh: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl Entity for CacheEntry {
    const ENTITY_TYPE: &'static str = "cache_entry";

    fn key(&self) -> String {
        self.key.clone()
    }
}

impl CacheEntry {
    pub fn ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        chrono::Duration::seconds(secs.min(i64::MAX / 1000))
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_refresh
            .checked_add_signed(self.ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

pub struct CachePolicy {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    events: Option<EventBus>,
}

impl CachePolicy {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            events: None,
        }
    }

    /// Publishes `CacheEvent::Invalidated` for every prefix invalidation.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub async fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.store.get_entity::<CacheEntry>(key).await
    }

    /// True iff an entry exists for `key` and has not expired.
    pub async fn is_valid(&self, key: &str) -> Result<bool> {
        let valid = match self.entry(key).await? {
            Some(entry) => entry.is_valid_at(self.now()),
            None => false,
        };
        debug!(cache_key = %key, valid, "Checked cache entry");
        Ok(valid)
    }

    /// Records a successful fetch at the current time in its own transaction.
    pub async fn record_fetch(&self, key: &str, ttl: Duration) -> Result<CacheEntry> {
        let mut tx = self.store.begin().await?;
        let entry = self.record_fetch_in(&mut tx, key, ttl).await?;
        tx.save().await?;
        Ok(entry)
    }

    /// Records a successful fetch inside the caller's transaction.
    pub async fn record_fetch_in(
        &self,
        tx: &mut Transaction,
        key: &str,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let entry = CacheEntry {
            key: key.to_string(),
            last_refresh: self.now(),
            ttl_secs: ttl.as_secs(),
        };
        tx.upsert_entity(&entry).await?;
        debug!(cache_key = %key, ttl_secs = entry.ttl_secs, "Recorded fetch");
        Ok(entry)
    }

    /// Deletes every entry whose key starts with `prefix`.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, prefix: &str) -> Result<u64> {
        let mut tx = self.store.begin().await?;
        let removed = self.invalidate_in(&mut tx, prefix).await?;
        tx.save().await?;
        self.announce_invalidated(prefix, removed);
        Ok(removed)
    }

    /// Prefix invalidation inside the caller's transaction. Call
    /// [`announce_invalidated`](Self::announce_invalidated) once it commits.
    pub async fn invalidate_in(&self, tx: &mut Transaction, prefix: &str) -> Result<u64> {
        let scope = Scope::of::<CacheEntry>().filter(Predicate::key_prefix(prefix));
        let removed = tx.delete_matching(&scope).await?;
        debug!(prefix, removed, "Invalidated cache entries");
        Ok(removed)
    }

    /// Emits [`CacheEvent::Invalidated`] for a committed invalidation.
    pub fn announce_invalidated(&self, prefix: &str, removed: u64) {
        if let Some(events) = &self.events {
            events
                .emit(CoreEvent::Cache(CacheEvent::Invalidated {
                    prefix: prefix.to_string(),
                    removed,
                }))
                .ok();
        }
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("has_event_bus", &self.events.is_some())
            .finish()
    }
}

/// Builder for `<feature>/<scope>?<k>=<v>` cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    feature: String,
    scope: Option<String>,
    params: Vec<(String, String)>,
}

impl CacheKey {
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            scope: None,
            params: Vec::new(),
        }
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    /// Prefix matching every key of this feature.
    pub fn feature_prefix(&self) -> String {
        format!("{}/", self.feature)
    }

    pub fn build(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.feature)?;
        if let Some(scope) = &self.scope {
            write!(f, "/{}", scope)?;
        }

        let mut params = self.params.clone();
        params.sort();
        for (index, (name, value)) in params.iter().enumerate() {
            let separator = if index == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", separator, name, value)?;
        }
        Ok(())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}
