//! One in-flight logical operation and its exactly-once delivery contract.
//!
//! # Design notes
//! A `Request` owns its listener exclusively. Delivery takes the listener
//! out of its slot while holding the slot's lock and flips the `delivered`
//! flag under that same lock; whichever of success, error, or cancel gets
//! there first wins, and the other paths find the slot empty. No lock is
//! ever held while the listener itself runs.
use bytes::Bytes;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use till_common::{Error, RequestKind, Response, ResponseCode, Tag};
use tracing::debug;

use crate::client::connection::{ChannelProxy, RemoteCall};
use crate::client::context::ExecutionContext;

// Process-wide monotonically increasing request ids; never reused.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal callback for one request. Exactly one of `on_success` /
/// `on_error` fires per request, exactly once, unless the request is
/// cancelled first, in which case only `on_cancel` runs.
pub trait Listener: Send {
    fn on_success(&mut self, response: Response);

    fn on_error(&mut self, code: ResponseCode, error: Error);

    /// Hook for listeners holding resources that need explicit teardown.
    fn on_cancel(&mut self) {}
}

/// Caller-facing description of an operation to submit.
#[derive(Clone, Debug)]
pub struct BillingRequest {
    pub kind: RequestKind,
    /// Opaque call arguments forwarded to the channel unmodified.
    pub args: Bytes,
    /// Cache namespace token (product id, query digest). Requests without
    /// one bypass the cache even for cacheable kinds.
    pub cache_token: Option<String>,
}

impl BillingRequest {
    pub fn new(kind: RequestKind, args: Bytes) -> Self {
        Self {
            kind,
            args,
            cache_token: None,
        }
    }

    pub fn cached_as(mut self, token: impl Into<String>) -> Self {
        self.cache_token = Some(token.into());
        self
    }
}

pub struct Request {
    id: u64,
    kind: RequestKind,
    api_version: u32,
    args: Bytes,
    cache_token: Option<String>,
    tag: Option<Tag>,
    deliver_on: ExecutionContext,
    // One-shot delivery slot; `delivered` only flips while `listener` is
    // locked, which is what makes racing success/error/cancel safe.
    listener: Mutex<Option<Box<dyn Listener>>>,
    delivered: AtomicBool,
}

impl Request {
    pub(crate) fn new(
        spec: BillingRequest,
        api_version: u32,
        tag: Option<Tag>,
        deliver_on: ExecutionContext,
        listener: Box<dyn Listener>,
    ) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            kind: spec.kind,
            api_version,
            args: spec.args,
            cache_token: spec.cache_token,
            tag,
            deliver_on,
            listener: Mutex::new(Some(listener)),
            delivered: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    pub fn cache_token(&self) -> Option<&str> {
        self.cache_token.as_deref()
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// Take the listener for terminal delivery. Returns `None` if delivery
    /// already happened or the request was cancelled.
    fn take_for_delivery(&self) -> Option<Box<dyn Listener>> {
        let mut slot = self
            .listener
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.delivered.load(Ordering::Acquire) {
            return None;
        }
        let listener = slot.take()?;
        self.delivered.store(true, Ordering::Release);
        Some(listener)
    }

    /// Deliver success on the configured context. Returns whether this call
    /// won the delivery race.
    pub(crate) fn deliver_success(&self, response: Response) -> bool {
        let Some(mut listener) = self.take_for_delivery() else {
            debug!(id = self.id, "success discarded: request already resolved");
            return false;
        };
        self.deliver_on.post(move || listener.on_success(response));
        true
    }

    pub(crate) fn deliver_error(&self, code: ResponseCode, error: Error) -> bool {
        let Some(mut listener) = self.take_for_delivery() else {
            debug!(id = self.id, "error discarded: request already resolved");
            return false;
        };
        self.deliver_on.post(move || listener.on_error(code, error));
        true
    }

    /// Detach the listener so no later delivery can reach it, invoking the
    /// cancel hook first. Cancelling an already-resolved request is a no-op.
    pub(crate) fn cancel(&self) {
        let taken = {
            let mut slot = self
                .listener
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if self.delivered.load(Ordering::Acquire) {
                return;
            }
            slot.take()
        };
        if let Some(mut listener) = taken {
            listener.on_cancel();
        }
    }

    /// Run the one synchronous remote call for this request. Exactly one of
    /// success/error is delivered before this returns, unless a concurrent
    /// cancel already detached the listener.
    pub(crate) fn start(&self, proxy: &dyn ChannelProxy) {
        let call = RemoteCall {
            request_id: self.id,
            kind: self.kind,
            api_version: self.api_version,
            args: self.args.clone(),
        };
        match proxy.call(call) {
            Ok(response) if response.code.is_ok() => {
                self.deliver_success(response);
            }
            Ok(response) => {
                let code = response.code;
                self.deliver_error(
                    code,
                    Error::Call {
                        code,
                        message: format!("{} rejected by service", self.kind),
                    },
                );
            }
            Err(error) => {
                self.deliver_error(ResponseCode::CallFailed, error);
            }
        }
    }
}
