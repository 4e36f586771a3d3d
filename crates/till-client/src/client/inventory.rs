//! Multi-phase completion counter for per-product inventory loads.
//!
//! An inventory load fans out N independently-completing sub-requests
//! (support check, purchase list, SKU list per product). The counter says
//! when the whole attempt is done, and a callback carrying a superseded
//! attempt id is ignored so a stale load can never deliver into a newer
//! one's result.
use std::sync::{Mutex, PoisonError};

struct CounterState {
    attempt: u64,
    remaining: usize,
}

pub struct CompletionCounter {
    inner: Mutex<CounterState>,
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CounterState {
                attempt: 0,
                remaining: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new attempt with `parts` outstanding sub-requests, superseding
    /// any attempt still in flight. Returns the new attempt id.
    pub fn begin(&self, parts: usize) -> u64 {
        let mut state = self.lock();
        state.attempt += 1;
        state.remaining = parts;
        state.attempt
    }

    /// Record one sub-request completion. Returns true exactly once per
    /// attempt: when its last part finishes. Stale attempt ids are ignored.
    pub fn complete(&self, attempt: u64) -> bool {
        let mut state = self.lock();
        if attempt != state.attempt || state.remaining == 0 {
            return false;
        }
        state.remaining -= 1;
        state.remaining == 0
    }

    pub fn current_attempt(&self) -> u64 {
        self.lock().attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_completion_wins_exactly_once() {
        let counter = CompletionCounter::new();
        let attempt = counter.begin(3);
        assert!(!counter.complete(attempt));
        assert!(!counter.complete(attempt));
        assert!(counter.complete(attempt));
        // Overshoot after the attempt finished is ignored.
        assert!(!counter.complete(attempt));
    }

    #[test]
    fn stale_attempts_are_ignored() {
        let counter = CompletionCounter::new();
        let first = counter.begin(2);
        let second = counter.begin(1);
        assert!(!counter.complete(first));
        assert!(counter.complete(second));
        assert!(!counter.complete(first));
    }

    #[test]
    fn zero_part_attempt_never_fires() {
        let counter = CompletionCounter::new();
        let attempt = counter.begin(0);
        assert!(!counter.complete(attempt));
    }
}
