use crate::signal::{Registration, Signal, WakerSlot};
use crate::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::Context;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Deadline timer threads that have not exited yet.
static LIVE_TIMERS: AtomicUsize = AtomicUsize::new(0);

/// A caller-owned signal that interrupts a wait without touching the
/// promise being waited on or the work behind it.
///
/// Clones share the same state. [`CancelToken::none`] never fires.
///
/// # Examples
///
/// ```
/// use promise_chain::{CancelToken, Error, Promise};
///
/// let (promise, _resolver) = Promise::<u32>::pending();
/// let token = CancelToken::new();
/// token.cancel();
/// assert!(matches!(promise.wait(&token), Err(Error::Cancelled)));
/// assert!(!promise.is_settled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Option<Arc<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    reason: OnceLock<Error>,
    signal: Signal,
    timer: OnceLock<Thread>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Inner::default())),
        }
    }

    /// A token that is never cancelled. Waits using it only end when the
    /// promise settles.
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// A token that cancels itself with [`Error::DeadlineExceeded`] once
    /// `timeout` has elapsed.
    ///
    /// A timeout past the range of [`Instant`] never expires; the token
    /// behaves like [`CancelToken::new`].
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    /// The timer thread behind the deadline exits as soon as the token is
    /// cancelled or its last clone is dropped.
    pub fn with_deadline(deadline: Instant) -> Self {
        let token = Self::new();
        token.arm_deadline(deadline);
        token
    }

    /// A token that is cancelled together with `self` but can also be
    /// cancelled on its own without affecting `self`.
    pub fn child(&self) -> Self {
        let child = Self::new();
        if let Some(parent) = &self.inner {
            let weak = child.downgrade();
            let parent_weak = Arc::downgrade(parent);
            parent.signal.on_fire(move || {
                if let (Some(child), Some(parent)) = (weak.upgrade(), parent_weak.upgrade()) {
                    let reason = parent.reason.get().cloned().unwrap_or(Error::Cancelled);
                    Inner::cancel_with(&child, reason);
                }
            });
        }
        child
    }

    fn downgrade(&self) -> Weak<Inner> {
        self.inner.as_ref().map(Arc::downgrade).unwrap_or_default()
    }

    fn arm_deadline(&self, deadline: Instant) {
        let weak = self.downgrade();
        LIVE_TIMERS.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("promise-deadline".into())
            .spawn(move || {
                run_timer(weak, deadline);
                LIVE_TIMERS.fetch_sub(1, Ordering::SeqCst);
            });
        if let Err(err) = spawned {
            LIVE_TIMERS.fetch_sub(1, Ordering::SeqCst);
            log::error!("failed to spawn deadline timer, token will only cancel manually: {err}");
        }
    }

    /// Cancels with [`Error::Cancelled`]. Only the first cancellation counts.
    pub fn cancel(&self) {
        if let Some(inner) = &self.inner {
            Inner::cancel_with(inner, Error::Cancelled);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.signal.is_fired())
    }

    /// The error a cancelled wait returns, or `None` while not cancelled.
    pub fn error(&self) -> Option<Error> {
        let inner = self.inner.as_ref()?;
        if inner.signal.is_fired() {
            inner.reason.get().cloned()
        } else {
            None
        }
    }

    pub(crate) fn poll_cancelled(
        &self,
        cx: &mut Context<'_>,
        slot: &mut WakerSlot,
    ) -> Option<Error> {
        let inner = self.inner.as_ref()?;
        if inner.signal.poll_fired(cx, slot) {
            Some(inner.reason.get().cloned().unwrap_or(Error::Cancelled))
        } else {
            None
        }
    }

    pub(crate) fn clear_waker(&self, slot: &mut WakerSlot) {
        if let Some(inner) = &self.inner {
            inner.signal.clear(slot);
        }
    }

    #[cfg(test)]
    pub(crate) fn waker_count(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.signal.waker_count())
    }

    /// Registers `callback` to run on cancellation. Returns `None` for
    /// [`CancelToken::none`] (nothing is registered) and when the token was
    /// already cancelled (the callback ran inline).
    pub(crate) fn on_cancel<F>(&self, callback: F) -> Option<Registration>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.as_ref()?.signal.on_fire(callback)
    }

    pub(crate) fn forget(&self, registration: Registration) {
        if let Some(inner) = &self.inner {
            inner.signal.forget(registration);
        }
    }
}

impl Inner {
    fn cancel_with(inner: &Arc<Inner>, reason: Error) {
        // the reason is stored before the signal fires, so anyone who sees
        // the signal also sees the reason
        if inner.reason.set(reason).is_ok() {
            inner.signal.fire();
            if let Some(timer) = inner.timer.get() {
                timer.unpark();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get() {
            timer.unpark();
        }
    }
}

/// Parks until `deadline` and cancels the token then, unless it was
/// cancelled or dropped first. The thread handle is published before the
/// first check, so an unpark from `cancel_with` or `drop` is never lost.
fn run_timer(weak: Weak<Inner>, deadline: Instant) {
    match weak.upgrade() {
        Some(inner) => {
            let _ = inner.timer.set(thread::current());
        }
        None => return,
    }
    loop {
        let Some(inner) = weak.upgrade() else {
            log::trace!("deadline timer stopped, token dropped");
            return;
        };
        if inner.signal.is_fired() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            Inner::cancel_with(&inner, Error::DeadlineExceeded);
            return;
        }
        // the last clone may be gone by the time we wake up
        drop(inner);
        thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
fn live_timers() -> usize {
    LIVE_TIMERS.load(Ordering::SeqCst)
}
