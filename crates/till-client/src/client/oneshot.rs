//! One-shot listener decorator and the purchase-flow slot registry.
//!
//! A purchase flow borrows a slot identified by a request code; forgetting
//! to give it back after a single-use operation is a classic caller bug.
//! `OneShotListener` owns the release: whatever the outcome (success,
//! error, or cancel), the slot is returned on the first terminal event.
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use till_common::{Error, Response, ResponseCode};
use tracing::warn;

use crate::client::request::Listener;

#[derive(Clone, Default)]
pub struct SlotRegistry {
    in_use: Arc<Mutex<HashSet<i32>>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot. Returns false when the request code is already busy.
    pub fn acquire(&self, request_code: i32) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_code)
    }

    pub fn release(&self, request_code: i32) {
        let released = self
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_code);
        if !released {
            warn!(request_code, "released a slot that was not held");
        }
    }

    pub fn is_held(&self, request_code: i32) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&request_code)
    }
}

/// Wraps a listener so its slot is released exactly once, on the first
/// terminal event.
pub struct OneShotListener {
    inner: Box<dyn Listener>,
    slots: SlotRegistry,
    request_code: i32,
    released: bool,
}

impl OneShotListener {
    pub fn new(inner: Box<dyn Listener>, slots: SlotRegistry, request_code: i32) -> Self {
        Self {
            inner,
            slots,
            request_code,
            released: false,
        }
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.slots.release(self.request_code);
        }
    }
}

impl Listener for OneShotListener {
    fn on_success(&mut self, response: Response) {
        self.release_once();
        self.inner.on_success(response);
    }

    fn on_error(&mut self, code: ResponseCode, error: Error) {
        self.release_once();
        self.inner.on_error(code, error);
    }

    fn on_cancel(&mut self) {
        self.release_once();
        self.inner.on_cancel();
    }
}
