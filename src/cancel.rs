use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// A shared, one-way stop signal.
///
/// A token starts out unset and can be cancelled exactly once. Clones share
/// the same state, so the owner can keep one clone to trigger cancellation
/// while handing another to a [`WorkerPool`](crate::WorkerPool), which only
/// ever observes it.
///
/// Besides the flag, a token carries a channel that becomes disconnected on
/// cancellation, so threads blocked in a `select!` wake up immediately.
///
/// # Examples
///
/// ```
/// use fixedpool::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
///
/// assert!(!observer.is_cancelled());
/// assert!(token.cancel());
/// assert!(observer.is_cancelled());
///
/// // Cancelling again has no effect.
/// assert!(!token.cancel());
/// ```
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,

    /// Never sent on. Dropped on cancellation to disconnect `signal`.
    trigger: Mutex<Option<Sender<()>>>,

    signal: Receiver<()>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a new token that is not cancelled.
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);

        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Set the token.
    ///
    /// Returns `true` if this call cancelled the token, or `false` if it was
    /// already cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        true
    }

    /// Check whether the token has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Block the current thread until the token is cancelled or the timeout
    /// passes.
    ///
    /// Returns `true` if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }

    /// A receiver that is disconnected once the token is cancelled. Intended
    /// for use in `select!`; it never yields a value.
    pub(crate) fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    #[test]
    fn cancel_is_monotonic() {
        let token = CancellationToken::new();

        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_disconnects_signal() {
        let token = CancellationToken::new();
        assert!(token.signal().try_recv().unwrap_err().is_empty());

        token.cancel();
        assert!(token.signal().try_recv().unwrap_err().is_disconnected());
    }

    #[test]
    fn wait_timeout_wakes_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();

        let start = Instant::now();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert!(token.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_timeout_expires() {
        let token = CancellationToken::new();

        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }
}
