use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// How long a reconnect is held back after the first request for it.
pub const RECONNECT_COOLDOWN: Duration = Duration::from_secs(10);

/// Collapses bursts of reconnect requests into a single trailing reconnect per cooldown window.
///
/// Any number of failing requests may call [`Self::request`] at once. The first call opens a
/// window, the calls that follow within it are absorbed, and a single consumer waiting in
/// [`Self::next_due`] is released once the window closes. Nothing queues up beyond that one
/// pending reconnect.
pub struct ReconnectThrottle {
    cooldown: Duration,
    pending: AtomicBool,
    fire: Notify,
}

impl ReconnectThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, pending: AtomicBool::new(false), fire: Notify::new() }
    }

    /// Ask for a reconnect.
    ///
    /// Returns `true` if this call opened a new window, `false` if one was already pending.
    pub fn request(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        // `notify_one` stores a permit, so the consumer sees this even if it is not waiting yet.
        self.fire.notify_one();
        true
    }

    #[cfg(test)]
    fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Resolves once a requested reconnect is due.
    ///
    /// The throttle is idle again by the time this returns: a request made while the reconnect
    /// runs opens the next window.
    pub async fn next_due(&self) {
        self.fire.notified().await;
        tokio::time::sleep(self.cooldown).await;
        self.pending.store(false, Ordering::Release);
    }
}

impl Default for ReconnectThrottle {
    fn default() -> Self {
        Self::new(RECONNECT_COOLDOWN)
    }
}
