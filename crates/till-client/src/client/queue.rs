//! Pending request queue: strict-FIFO, cancellable, drained by one worker.
//!
//! # Design notes
//! The channel has no request/response correlation, so correctness depends
//! on never having two remote calls outstanding: the queue is drained by a
//! single worker, one entry at a time. A cancelled entry keeps its id and
//! tag (so re-cancellation stays idempotent) but drops its request, and the
//! drain loop skips it. The queue's mutex is only ever held for list
//! mutation, never across a remote call or a listener.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use till_common::{Error, ResponseCode, Tag};
use tracing::debug;

use crate::client::connection::ChannelProxy;
use crate::client::request::Request;

struct QueueEntry {
    id: u64,
    tag: Option<Tag>,
    // Dropped on cancel; id/tag stay behind so the worker can skip it.
    request: Option<Arc<Request>>,
}

#[derive(Default)]
pub(crate) struct PendingQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, request: Arc<Request>) {
        let entry = QueueEntry {
            id: request.id(),
            tag: request.tag().cloned(),
            request: Some(request),
        };
        self.lock().push_back(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the head: its id plus the request, if not yet cancelled.
    fn peek_front(&self) -> Option<(u64, Option<Arc<Request>>)> {
        let entries = self.lock();
        entries
            .front()
            .map(|entry| (entry.id, entry.request.clone()))
    }

    /// Pop the head only if it is still the entry we peeked. A concurrent
    /// `fail_all`/`cancel_all` may have cleared the list in between.
    fn remove_head(&self, id: u64) {
        let mut entries = self.lock();
        if entries.front().is_some_and(|entry| entry.id == id) {
            entries.pop_front();
        }
    }

    /// Cancel the one entry with this id. The entry stays queued (minus its
    /// request) so a repeat cancel of the same id is a quiet no-op.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        let taken = {
            let mut entries = self.lock();
            entries
                .iter_mut()
                .find(|entry| entry.id == id)
                .and_then(|entry| entry.request.take())
        };
        match taken {
            Some(request) => {
                request.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every entry whose tag matches. `None` is not a wildcard: it
    /// cancels only anonymous (untagged) entries.
    pub(crate) fn cancel_tagged(&self, tag: Option<&Tag>) -> usize {
        let taken: Vec<Arc<Request>> = {
            let mut entries = self.lock();
            entries
                .iter_mut()
                .filter(|entry| entry.tag.as_ref() == tag)
                .filter_map(|entry| entry.request.take())
                .collect()
        };
        let count = taken.len();
        for request in taken {
            request.cancel();
        }
        count
    }

    /// Cancel everything unconditionally and empty the queue.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<QueueEntry> = {
            let mut entries = self.lock();
            entries.drain(..).collect()
        };
        let mut count = 0;
        for entry in drained {
            if let Some(request) = entry.request {
                request.cancel();
                count += 1;
            }
        }
        count
    }

    /// Deliver a synthetic failure to every still-pending entry and empty
    /// the queue. Used when the connection enters FAILED.
    pub(crate) fn fail_all(&self, code: ResponseCode) {
        let drained: Vec<QueueEntry> = {
            let mut entries = self.lock();
            entries.drain(..).collect()
        };
        for entry in drained {
            if let Some(request) = entry.request {
                request.deliver_error(code, Error::Channel("channel unavailable".into()));
            }
        }
    }

    /// Drain the queue in strict FIFO order. Invoked from the single worker
    /// context only. `live_proxy` is re-checked before every entry; once it
    /// returns `None` the head stays queued and draining stops; a future
    /// CONNECTED transition resumes it.
    pub(crate) fn run(&self, live_proxy: &dyn Fn() -> Option<Arc<dyn ChannelProxy>>) {
        loop {
            let Some((id, request)) = self.peek_front() else {
                break;
            };
            let Some(request) = request else {
                // Cancelled while queued; skip.
                debug!(id, "skipping cancelled queue entry");
                self.remove_head(id);
                continue;
            };
            let Some(proxy) = live_proxy() else {
                debug!(id, "channel not ready; drain paused");
                break;
            };
            // The remote call runs with no queue lock held.
            request.start(proxy.as_ref());
            self.remove_head(id);
        }
    }
}
