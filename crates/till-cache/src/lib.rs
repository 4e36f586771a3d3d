// TTL cache for billing responses: a pluggable backing store behind a
// thread-safety decorator and a fault-isolation decorator.
//
// # Design notes
// Expiration is lazy: a read of an expired entry evicts it as a side
// effect, so no background sweeper is needed. The backing store is assumed
// neither thread-safe nor panic-free; `SharedStore` adds the lock and
// `FaultIsolated` turns any panic into a miss/no-op, because a broken cache
// implementation must never break request delivery.
use bytes::Bytes;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Cache key: kind ordinal plus an opaque token (product id, query digest).
///
/// The ordinal is part of the key so a token can never collide across kinds.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey {
    kind_ordinal: u8,
    token: String,
}

impl CacheKey {
    pub fn new(kind_ordinal: u8, token: impl Into<String>) -> Self {
        Self {
            kind_ordinal,
            token: token.into(),
        }
    }

    pub fn kind_ordinal(&self) -> u8 {
        self.kind_ordinal
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Stored response plus its absolute expiration timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub value: Bytes,
    pub expires_at_ms: u64,
}

impl CacheEntry {
    // Compute expiry once so reads only compare integers.
    pub fn with_ttl(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at_ms: now_epoch_ms().saturating_add(ttl.as_millis() as u64),
        }
    }

    /// Entry with an explicit absolute expiry, mainly for tests and stores
    /// that persist entries across processes.
    pub fn expiring_at(value: Bytes, expires_at_ms: u64) -> Self {
        Self {
            value,
            expires_at_ms,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Backing-store boundary. Implementations need not be thread-safe or
/// panic-free; the decorators in this crate add both guarantees.
pub trait CacheStore: Send {
    /// Called once, before first use.
    fn init(&mut self) {}

    /// Lookup. An expired entry is a miss and must be evicted as a side
    /// effect of the read.
    fn get(&mut self, key: &CacheKey) -> Option<CacheEntry>;

    fn put(&mut self, key: CacheKey, entry: CacheEntry);

    /// Store only if no live entry exists. Used for write-after-read
    /// results so a racing populate does not clobber a slightly earlier
    /// populate of the same key. An expired entry counts as absent.
    fn put_if_absent(&mut self, key: CacheKey, entry: CacheEntry);

    fn remove(&mut self, key: &CacheKey);

    /// Drop every entry of one kind, e.g. after a mutating call diverged
    /// the remote state from the cached list results.
    fn remove_kind(&mut self, kind_ordinal: u8);

    fn clear(&mut self);
}

impl CacheStore for Box<dyn CacheStore> {
    fn init(&mut self) {
        self.as_mut().init()
    }

    fn get(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.as_mut().get(key)
    }

    fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.as_mut().put(key, entry)
    }

    fn put_if_absent(&mut self, key: CacheKey, entry: CacheEntry) {
        self.as_mut().put_if_absent(key, entry)
    }

    fn remove(&mut self, key: &CacheKey) {
        self.as_mut().remove(key)
    }

    fn remove_kind(&mut self, kind_ordinal: u8) {
        self.as_mut().remove_kind(kind_ordinal)
    }

    fn clear(&mut self) {
        self.as_mut().clear()
    }
}

/// In-memory backing store with lazy expiry on read.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for MemoryStore {
    fn get(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        match self.entries.get(key) {
            // Lazy-expire on read to avoid a background sweeper.
            Some(entry) if entry.is_expired(now_epoch_ms()) => {
                self.entries.remove(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    fn put_if_absent(&mut self, key: CacheKey, entry: CacheEntry) {
        let live = self
            .entries
            .get(&key)
            .is_some_and(|existing| !existing.is_expired(now_epoch_ms()));
        if !live {
            self.entries.insert(key, entry);
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        self.entries.remove(key);
    }

    fn remove_kind(&mut self, kind_ordinal: u8) {
        self.entries.retain(|key, _| key.kind_ordinal != kind_ordinal);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fault-isolation decorator: a panicking backing store degrades to a
/// cache miss (reads) or a no-op (writes), logged and never propagated.
pub struct FaultIsolated<S> {
    inner: S,
}

impl<S: CacheStore> FaultIsolated<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: CacheStore> CacheStore for FaultIsolated<S> {
    fn init(&mut self) {
        if catch_unwind(AssertUnwindSafe(|| self.inner.init())).is_err() {
            warn!("cache backing store panicked in init; cache disabled until it recovers");
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        match catch_unwind(AssertUnwindSafe(|| self.inner.get(key))) {
            Ok(entry) => entry,
            Err(_) => {
                warn!(?key, "cache backing store panicked in get; treating as miss");
                None
            }
        }
    }

    fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        if catch_unwind(AssertUnwindSafe(|| self.inner.put(key, entry))).is_err() {
            warn!("cache backing store panicked in put; entry dropped");
        }
    }

    fn put_if_absent(&mut self, key: CacheKey, entry: CacheEntry) {
        if catch_unwind(AssertUnwindSafe(|| self.inner.put_if_absent(key, entry))).is_err() {
            warn!("cache backing store panicked in put_if_absent; entry dropped");
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if catch_unwind(AssertUnwindSafe(|| self.inner.remove(key))).is_err() {
            warn!(?key, "cache backing store panicked in remove");
        }
    }

    fn remove_kind(&mut self, kind_ordinal: u8) {
        if catch_unwind(AssertUnwindSafe(|| self.inner.remove_kind(kind_ordinal))).is_err() {
            warn!(kind_ordinal, "cache backing store panicked in remove_kind");
        }
    }

    fn clear(&mut self) {
        if catch_unwind(AssertUnwindSafe(|| self.inner.clear())).is_err() {
            warn!("cache backing store panicked in clear");
        }
    }
}

/// Thread-safety decorator: serializes every operation behind one lock and
/// makes the store cheaply cloneable for sharing across tasks.
pub struct SharedStore<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CacheStore> SharedStore<S> {
    pub fn new(mut store: S) -> Self {
        store.init();
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    fn with_locked<T>(&self, op: impl FnOnce(&mut S) -> T) -> T {
        // The fault-isolation layer sits inside the lock, so a poisoned
        // mutex can only come from a panic in this crate; recover anyway.
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        op(&mut guard)
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.with_locked(|store| store.get(key))
    }

    pub fn put(&self, key: CacheKey, entry: CacheEntry) {
        self.with_locked(|store| store.put(key, entry))
    }

    pub fn put_if_absent(&self, key: CacheKey, entry: CacheEntry) {
        self.with_locked(|store| store.put_if_absent(key, entry))
    }

    pub fn remove(&self, key: &CacheKey) {
        self.with_locked(|store| store.remove(key))
    }

    pub fn remove_kind(&self, kind_ordinal: u8) {
        self.with_locked(|store| store.remove_kind(kind_ordinal))
    }

    pub fn clear(&self) {
        self.with_locked(|store| store.clear())
    }
}

/// The composed stack the orchestrator consumes: an arbitrary backing
/// store, fault-isolated, behind one lock.
pub type BillingCache = SharedStore<FaultIsolated<Box<dyn CacheStore>>>;

impl BillingCache {
    pub fn with_store(store: impl CacheStore + 'static) -> BillingCache {
        SharedStore::new(FaultIsolated::new(Box::new(store) as Box<dyn CacheStore>))
    }

    pub fn in_memory() -> BillingCache {
        Self::with_store(MemoryStore::new())
    }
}
