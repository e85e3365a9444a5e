//! Shutdown coordination between the signal handler and the cycle loop.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Shutdown flag with an awaitable wake-up.
///
/// The loop only checks the flag between cycles, so a request made while a
/// cycle is running takes effect once that cycle completes.
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Creates a flag that has not been raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown and wake the loop if it is sleeping.
    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // `notify_one` stores a permit, so a request that lands before the
        // loop starts waiting is not lost.
        self.notify.notify_one();
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&self) {
        while !self.is_shutdown_requested() {
            self.notify.notified().await;
        }
    }
}
