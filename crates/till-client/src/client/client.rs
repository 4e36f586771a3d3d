//! The billing façade: request submission, caching policy, cancellation.
//!
//! # Purpose
//! Wires the connection state machine, pending queue, and cache together.
//! Submission probes the cache first; a miss wraps the caller's listener in
//! the caching decorator, queues the request, and (idempotently) connects,
//! so a currently-disconnected client self-heals.
use std::sync::Arc;
use std::time::Duration;
use till_cache::{BillingCache, CacheEntry, CacheKey};
use till_common::{Error, RequestKind, Response, ResponseCode, Tag};
use tracing::debug;

use crate::client::connection::{
    Connection, ConnectionState, Connector, NoopPurchaseEvents, PurchaseEvents,
};
use crate::client::context::{Delivery, ExecutionContext};
use crate::client::oneshot::{OneShotListener, SlotRegistry};
use crate::client::queue::PendingQueue;
use crate::client::request::{BillingRequest, Listener, Request};
use crate::config::ClientConfig;

pub struct BillingClient {
    connection: Arc<Connection>,
    queue: Arc<PendingQueue>,
    cache: Option<BillingCache>,
    config: ClientConfig,
    worker: ExecutionContext,
    main: ExecutionContext,
    slots: SlotRegistry,
}

pub struct BillingClientBuilder {
    connector: Arc<dyn Connector>,
    purchase_events: Arc<dyn PurchaseEvents>,
    cache: Option<BillingCache>,
    config: ClientConfig,
}

impl BillingClientBuilder {
    pub fn cache(mut self, cache: BillingCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn purchase_events(mut self, events: Arc<dyn PurchaseEvents>) -> Self {
        self.purchase_events = events;
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the worker and main contexts and assemble the client.
    /// Requires a running tokio runtime.
    pub fn build(self) -> BillingClient {
        let worker = ExecutionContext::spawn("till-worker");
        let main = ExecutionContext::spawn("till-main");
        let queue = Arc::new(PendingQueue::new());
        let connection = Connection::new(
            self.connector,
            self.purchase_events,
            Arc::clone(&queue),
            worker.clone(),
            main.clone(),
        );
        BillingClient {
            connection,
            queue,
            cache: self.cache,
            config: self.config,
            worker,
            main,
            slots: SlotRegistry::new(),
        }
    }
}

impl BillingClient {
    pub fn builder(connector: Arc<dyn Connector>) -> BillingClientBuilder {
        BillingClientBuilder {
            connector,
            purchase_events: Arc::new(NoopPurchaseEvents),
            cache: None,
            config: ClientConfig::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn pending_requests(&self) -> usize {
        self.queue.len()
    }

    /// Submit one operation. Returns the request id immediately so callers
    /// can cancel later. Cache hits resolve at submission time and never
    /// enter the queue; everything else drains in FIFO order once the
    /// connection is usable.
    pub fn submit(
        &self,
        request: BillingRequest,
        listener: Box<dyn Listener>,
        tag: Option<Tag>,
    ) -> u64 {
        let deliver_on = self.delivery_context();
        let cache_key = self.cache_key_for(&request);

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key)
            && let Some(entry) = cache.get(key)
        {
            debug!(kind = %request.kind, "cache hit; resolving at submission");
            let resolved = Request::new(request, self.config.api_version, tag, deliver_on, listener);
            resolved.deliver_success(Response::ok(entry.value));
            return resolved.id();
        }

        let kind = request.kind;
        let listener: Box<dyn Listener> = match &self.cache {
            Some(cache) => Box::new(CachingListener {
                inner: listener,
                cache: cache.clone(),
                kind,
                key: cache_key,
                ttl: self.config.ttl_for(kind),
            }),
            None => listener,
        };

        let queued = Arc::new(Request::new(
            request,
            self.config.api_version,
            tag,
            deliver_on,
            listener,
        ));
        let id = queued.id();
        self.queue.add(queued);
        // Unconditional and idempotent: a disconnected client self-heals.
        self.connection.connect();
        id
    }

    /// Submit a single-use purchase-flow operation occupying the slot for
    /// `request_code`. Returns `None` when the slot is already busy; the
    /// slot is released automatically on the first terminal event.
    pub fn submit_one_shot(
        &self,
        request: BillingRequest,
        listener: Box<dyn Listener>,
        tag: Option<Tag>,
        request_code: i32,
    ) -> Option<u64> {
        if !self.slots.acquire(request_code) {
            debug!(request_code, "purchase-flow slot busy");
            return None;
        }
        let listener = Box::new(OneShotListener::new(listener, self.slots.clone(), request_code));
        Some(self.submit(request, listener, tag))
    }

    /// Cancel one request by id. True when a still-pending entry was found.
    pub fn cancel(&self, id: u64) -> bool {
        self.queue.cancel(id)
    }

    /// Cancel every pending request whose tag matches. `None` cancels only
    /// untagged requests.
    pub fn cancel_tagged(&self, tag: Option<&Tag>) -> usize {
        self.queue.cancel_tagged(tag)
    }

    /// Cancel every pending request unconditionally.
    pub fn cancel_all(&self) -> usize {
        self.queue.cancel_all()
    }

    pub fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    fn delivery_context(&self) -> ExecutionContext {
        match self.config.delivery {
            Delivery::Worker => self.worker.clone(),
            Delivery::Main => self.main.clone(),
        }
    }

    fn cache_key_for(&self, request: &BillingRequest) -> Option<CacheKey> {
        if !request.kind.is_cacheable() {
            return None;
        }
        request
            .cache_token
            .as_deref()
            .map(|token| CacheKey::new(request.kind.ordinal(), token))
    }
}

/// Listener decorator applying the caching and invalidation policy.
///
/// On success it stores cacheable results with `put_if_absent` (a racing
/// populate must not clobber a slightly earlier one) and, for mutating
/// kinds, evicts every cached purchase list since the remote state has
/// diverged. Ownership-conflict errors on mutating kinds evict too.
struct CachingListener {
    inner: Box<dyn Listener>,
    cache: BillingCache,
    kind: RequestKind,
    key: Option<CacheKey>,
    ttl: Option<Duration>,
}

impl Listener for CachingListener {
    fn on_success(&mut self, response: Response) {
        if let (Some(key), Some(ttl)) = (&self.key, self.ttl) {
            self.cache
                .put_if_absent(key.clone(), CacheEntry::with_ttl(response.payload.clone(), ttl));
        }
        if self.kind.is_mutating() {
            self.cache
                .remove_kind(RequestKind::ListPurchases.ordinal());
            if self.kind == RequestKind::ChangeSubscription {
                // Subscription SKU state changed remotely as well.
                self.cache.remove_kind(RequestKind::ListSkus.ordinal());
            }
        }
        self.inner.on_success(response);
    }

    fn on_error(&mut self, code: ResponseCode, error: Error) {
        if self.kind.is_mutating()
            && matches!(
                code,
                ResponseCode::ItemAlreadyOwned | ResponseCode::ItemNotOwned
            )
        {
            // The service's ownership state disagrees with whatever we
            // cached; drop the purchase lists.
            self.cache
                .remove_kind(RequestKind::ListPurchases.ordinal());
        }
        self.inner.on_error(code, error);
    }

    fn on_cancel(&mut self) {
        self.inner.on_cancel();
    }
}
