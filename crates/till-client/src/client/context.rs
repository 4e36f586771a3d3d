//! Execution contexts: named single-writer job loops.
//!
//! # Purpose
//! Generalizes "post to a handler" into "submit a closure to an execution
//! context". The client owns two: a serial worker that drains the pending
//! queue and runs remote calls, and a main context reserved for connector
//! open/close and main-context delivery.
//!
//! # Design notes
//! Each context is a spawned task draining an mpsc channel of boxed jobs,
//! so everything posted to one context runs strictly in order and never
//! concurrently with itself.
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub struct ExecutionContext {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
}

impl ExecutionContext {
    /// Spawn the context's worker task. Requires a running tokio runtime.
    pub fn spawn(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            debug!(context = name, "execution context started");
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!(context = name, "execution context stopped");
        });
        Self { name, tx }
    }

    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        // A closed context means the runtime is shutting down; the job is
        // dropped rather than run on the caller's thread.
        if self.tx.send(Box::new(job)).is_err() {
            debug!(context = self.name, "job dropped: execution context closed");
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Where a request's terminal callback is invoked.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// The same serial worker that executed the remote call.
    #[default]
    Worker,
    /// The main context, for callers that touch platform UI state.
    Main,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn jobs_run_in_posting_order() {
        let context = ExecutionContext::spawn("test");
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        for i in 0..32 {
            let seen = Arc::clone(&seen);
            context.post(move || seen.lock().expect("seen").push(i));
        }
        context.post(move || {
            let _ = done_tx.send(());
        });
        timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("context drained")
            .expect("done signal");
        let seen = seen.lock().expect("seen");
        assert_eq!(*seen, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn posting_from_plain_threads_is_supported() {
        let context = ExecutionContext::spawn("test");
        let count = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let context = context.clone();
            let count = Arc::clone(&count);
            handles.push(std::thread::spawn(move || {
                for _ in 0..16 {
                    let count = Arc::clone(&count);
                    context.post(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().expect("poster");
        }
        let (done_tx, done_rx) = oneshot::channel();
        context.post(move || {
            let _ = done_tx.send(());
        });
        timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("context drained")
            .expect("done signal");
        assert_eq!(count.load(Ordering::SeqCst), 64);
    }
}
