//! Cancellable one-shot timers backed by spawned tasks.
//!
//! The reply registry and the auth cache arm one timer per entry and cancel
//! it when the entry is consumed or invalidated before expiry.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Opaque cancellation token for a timer armed with [`schedule`].
#[derive(Debug)]
pub(crate) struct TimerHandle(JoinHandle<()>);

impl TimerHandle {
    /// Cancel the timer. Cancelling a timer that has already fired is a
    /// no-op.
    pub(crate) fn cancel(&self) { self.0.abort(); }
}

/// Run `callback` after `delay` on the current runtime.
///
/// A zero delay fires on the next timer tick rather than synchronously, so
/// the caller always observes the armed state first.
pub(crate) fn schedule<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    TimerHandle(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        callback();
    }))
}
