//! Handler-instance caches.
//!
//! Constructed handlers are cached by Resource uid so that every Datum of a
//! Resource reuses the same open file or connection. The cache itself is a
//! capability ([`HandlerCache`]) so callers can inject any eviction policy:
//!
//! - [`UnboundedCache`]: keeps every handler until the filler closes
//! - [`LruHandlerCache`]: keeps at most N handlers, evicting least recently used
//!
//! A [`HandlerPool`] wraps a cache with per-entry holder counts so that one
//! pool can be shared (as [`SharedHandlerPool`]) by several fillers. A
//! handler leaves the pool when the last filler holding it lets go, or when
//! the cache evicts it. Its `close` hook runs when the last reference to the
//! instance is dropped, so an instance evicted while another filler is still
//! resolving through it is closed once that filler is done with it.

use crate::handler::Handler;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A constructed handler that runs its close hook when dropped.
pub struct PooledHandler {
    resource_uid: String,
    handler: Box<dyn Handler>,
}

impl PooledHandler {
    /// Take ownership of `handler`, constructed for `resource_uid`.
    pub fn new(resource_uid: &str, handler: Box<dyn Handler>) -> Self {
        Self {
            resource_uid: resource_uid.to_string(),
            handler,
        }
    }

    /// Resource the handler reads from.
    pub fn resource_uid(&self) -> &str {
        &self.resource_uid
    }
}

impl Deref for PooledHandler {
    type Target = dyn Handler;

    fn deref(&self) -> &Self::Target {
        self.handler.as_ref()
    }
}

impl DerefMut for PooledHandler {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handler.as_mut()
    }
}

impl Drop for PooledHandler {
    fn drop(&mut self) {
        tracing::debug!(resource_uid = %self.resource_uid, "Closing handler");
        if let Err(e) = self.handler.close() {
            tracing::warn!(resource_uid = %self.resource_uid, error = %e, "Handler close hook failed");
        }
    }
}

impl fmt::Debug for PooledHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandler")
            .field("resource_uid", &self.resource_uid)
            .finish_non_exhaustive()
    }
}

/// A handler instance shared between the cache and its current users.
pub type SharedHandler = Arc<Mutex<PooledHandler>>;

/// Wrap a freshly constructed handler for the pool.
pub fn shared_handler(resource_uid: &str, handler: Box<dyn Handler>) -> SharedHandler {
    Arc::new(Mutex::new(PooledHandler::new(resource_uid, handler)))
}

/// Minimal cache capability: lookup, insert with eviction report, removal.
pub trait HandlerCache: Send {
    /// Look up the handler for a Resource, marking it recently used.
    fn get(&mut self, resource_uid: &str) -> Option<SharedHandler>;

    /// Insert a handler, returning every entry the insertion evicted.
    fn put(
        &mut self,
        resource_uid: String,
        handler: SharedHandler,
    ) -> Vec<(String, SharedHandler)>;

    /// Remove one entry.
    fn remove(&mut self, resource_uid: &str) -> Option<SharedHandler>;

    /// Remove and return every entry.
    fn drain(&mut self) -> Vec<(String, SharedHandler)>;

    /// Number of cached handlers.
    fn len(&self) -> usize;

    /// True when nothing is cached.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache without a size bound.
#[derive(Default)]
pub struct UnboundedCache {
    entries: HashMap<String, SharedHandler>,
}

impl UnboundedCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HandlerCache for UnboundedCache {
    fn get(&mut self, resource_uid: &str) -> Option<SharedHandler> {
        self.entries.get(resource_uid).cloned()
    }

    fn put(
        &mut self,
        resource_uid: String,
        handler: SharedHandler,
    ) -> Vec<(String, SharedHandler)> {
        match self.entries.insert(resource_uid.clone(), handler) {
            Some(previous) => vec![(resource_uid, previous)],
            None => Vec::new(),
        }
    }

    fn remove(&mut self, resource_uid: &str) -> Option<SharedHandler> {
        self.entries.remove(resource_uid)
    }

    fn drain(&mut self) -> Vec<(String, SharedHandler)> {
        self.entries.drain().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Least-recently-used cache holding at most `capacity` handlers.
pub struct LruHandlerCache {
    entries: LruCache<String, SharedHandler>,
}

impl LruHandlerCache {
    /// An empty cache that evicts beyond `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }
}

impl HandlerCache for LruHandlerCache {
    fn get(&mut self, resource_uid: &str) -> Option<SharedHandler> {
        self.entries.get(resource_uid).cloned()
    }

    fn put(
        &mut self,
        resource_uid: String,
        handler: SharedHandler,
    ) -> Vec<(String, SharedHandler)> {
        self.entries.push(resource_uid, handler).into_iter().collect()
    }

    fn remove(&mut self, resource_uid: &str) -> Option<SharedHandler> {
        self.entries.pop(resource_uid)
    }

    fn drain(&mut self) -> Vec<(String, SharedHandler)> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_lru() {
            drained.push(entry);
        }
        drained
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A handler cache plus the count of fillers holding each entry.
pub struct HandlerPool {
    cache: Box<dyn HandlerCache>,
    holders: HashMap<String, usize>,
    evictions: u64,
}

/// A pool shared by several fillers.
pub type SharedHandlerPool = Arc<Mutex<HandlerPool>>;

impl HandlerPool {
    /// Pool over any cache implementation.
    pub fn new(cache: Box<dyn HandlerCache>) -> Self {
        Self {
            cache,
            holders: HashMap::new(),
            evictions: 0,
        }
    }

    /// Pool over an [`UnboundedCache`].
    pub fn unbounded() -> Self {
        Self::new(Box::new(UnboundedCache::new()))
    }

    /// Pool over an [`LruHandlerCache`] of the given capacity.
    pub fn bounded(capacity: NonZeroUsize) -> Self {
        Self::new(Box::new(LruHandlerCache::new(capacity)))
    }

    /// Wrap into a [`SharedHandlerPool`].
    pub fn shared(self) -> SharedHandlerPool {
        Arc::new(Mutex::new(self))
    }

    /// The cached handler for `resource_uid`, if any.
    pub fn get(&mut self, resource_uid: &str) -> Option<SharedHandler> {
        let hit = self.cache.get(resource_uid);
        tracing::debug!(resource_uid, hit = hit.is_some(), "Handler cache lookup");
        hit
    }

    /// Cache a freshly constructed handler. Evicted handlers are released.
    pub fn insert(&mut self, resource_uid: &str, handler: SharedHandler) {
        for (evicted_uid, evicted) in self.cache.put(resource_uid.to_string(), handler) {
            if evicted_uid != resource_uid {
                self.evictions += 1;
            }
            tracing::debug!(resource_uid = %evicted_uid, "Evicted handler from cache");
            release(&evicted_uid, evicted);
        }
    }

    /// Record that one more filler holds `resource_uid`.
    pub fn retain(&mut self, resource_uid: &str) {
        *self.holders.entry(resource_uid.to_string()).or_default() += 1;
    }

    /// Drop one filler's hold on `resource_uid`, releasing the handler at zero.
    pub fn release(&mut self, resource_uid: &str) {
        let Some(count) = self.holders.get_mut(resource_uid) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.holders.remove(resource_uid);
            if let Some(handler) = self.cache.remove(resource_uid) {
                release(resource_uid, handler);
            }
        }
    }

    /// Remove a handler regardless of holders (e.g. its spec was re-registered).
    pub fn discard(&mut self, resource_uid: &str) {
        if let Some(handler) = self.cache.remove(resource_uid) {
            release(resource_uid, handler);
        }
    }

    /// Release every cached handler.
    pub fn clear(&mut self) {
        self.holders.clear();
        for (uid, handler) in self.cache.drain() {
            release(&uid, handler);
        }
    }

    /// Fillers currently holding `resource_uid`.
    pub fn holders(&self, resource_uid: &str) -> usize {
        self.holders.get(resource_uid).copied().unwrap_or(0)
    }

    /// Cached handlers.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True when no handler is cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Number of handlers pushed out by the cache's bound so far.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

impl Default for HandlerPool {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Debug for HandlerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerPool")
            .field("cached", &self.cache.len())
            .field("holders", &self.holders)
            .field("evictions", &self.evictions)
            .finish()
    }
}

/// Drop the pool's reference to a handler leaving the cache.
///
/// The close hook runs here unless another user still holds the instance,
/// in which case it runs when that user drops it.
fn release(resource_uid: &str, handler: SharedHandler) {
    if Arc::strong_count(&handler) > 1 {
        tracing::debug!(resource_uid, "Handler still in use, closing after its last user");
    }
}
