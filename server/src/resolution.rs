use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tokio::sync::Notify;

/// Single-assignment result slot. The first [`complete`](Self::complete)
/// wins; later ones are no-ops that report `false`.
#[derive(Debug)]
pub struct Resolution<T> {
    claimed: AtomicBool,
    value: OnceLock<T>,
    ready: Notify,
}

impl<T> Default for Resolution<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Resolution<T> {
    pub fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            value: OnceLock::new(),
            ready: Notify::new(),
        }
    }

    pub fn complete(&self, value: T) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.value.set(value).is_err() {
            return false;
        }
        self.ready.notify_waiters();
        true
    }

    /// True only once the value is readable, so [`try_get`](Self::try_get)
    /// never comes back empty after this returned `true`. A completer that
    /// has claimed the slot but not stored its value yet does not count.
    pub fn is_completed(&self) -> bool {
        self.value.get().is_some()
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<&T> {
        self.value.get()
    }

    pub async fn wait(&self) -> &T {
        loop {
            // Registered before the check so a completion in between still wakes us
            let notified = self.ready.notified();
            if let Some(value) = self.value.get() {
                return value;
            }
            notified.await;
        }
    }
}
