//! A one-shot broadcast: fired at most once, observed by any number of
//! waiters, async or blocking, and by registered callbacks.
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle for a callback registered with [`Signal::on_fire`], used to
/// [`forget`](Signal::forget) it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration(u64);

/// The completion signal shared by a promise and all of its observers.
///
/// # Examples
///
/// ```
/// use promise_chain::signal::Signal;
/// use futures::executor::block_on;
/// use std::thread;
///
/// let signal = Signal::new();
/// let waiter = signal.clone();
/// let task1 = thread::spawn(move || block_on(waiter.fired()));
/// assert!(signal.fire());
/// assert!(!signal.fire());
/// task1.join().expect("The task1 thread has panicked");
/// ```
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    fired: bool,
    wakers: Vec<(u64, Waker)>,
    callbacks: Vec<(u64, Callback)>,
    next_key: u64,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // every write under this lock is a single assignment or a drain,
        // so a poisoned guard is still consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fires the signal. Only the first call returns `true`; it wakes every
    /// waiter and runs every registered callback on the calling thread,
    /// after the lock is released.
    pub fn fire(&self) -> bool {
        let (wakers, callbacks) = {
            let mut inner = self.lock();
            if inner.fired {
                return false;
            }
            inner.fired = true;
            (
                std::mem::take(&mut inner.wakers),
                std::mem::take(&mut inner.callbacks),
            )
        };
        for (_, waker) in wakers {
            waker.wake();
        }
        for (_, callback) in callbacks {
            callback();
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.lock().fired
    }

    /// Runs `callback` once the signal fires. If it already has, the
    /// callback runs right away on the calling thread and `None` is returned.
    pub fn on_fire<F>(&self, callback: F) -> Option<Registration>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.fired {
            drop(inner);
            callback();
            return None;
        }
        let key = inner.key();
        inner.callbacks.push((key, Box::new(callback)));
        Some(Registration(key))
    }

    /// Drops a callback that has not run yet. Returns `false` if it already
    /// ran or was forgotten before.
    pub fn forget(&self, registration: Registration) -> bool {
        // the callback is dropped after the lock is released, its captures
        // may settle other promises on the way out
        let forgotten = {
            let mut inner = self.lock();
            let index = inner
                .callbacks
                .iter()
                .position(|(key, _)| *key == registration.0);
            index.map(|index| inner.callbacks.swap_remove(index))
        };
        forgotten.is_some()
    }

    /// A future that completes once the signal has fired.
    pub fn fired(&self) -> Fired<'_> {
        Fired {
            signal: self,
            slot: WakerSlot::default(),
        }
    }

    /// Blocks the current thread until the signal fires.
    pub fn wait(&self) {
        futures::executor::block_on(self.fired())
    }

    /// Returns `true` if fired, otherwise stores the waker in `slot` to be
    /// woken on fire. A slot holds one waker, replaced when the task changes.
    pub(crate) fn poll_fired(&self, cx: &mut Context<'_>, slot: &mut WakerSlot) -> bool {
        let mut inner = self.lock();
        if inner.fired {
            slot.0 = None;
            return true;
        }
        let waker = cx.waker();
        if let Some(key) = slot.0 {
            if let Some((_, stored)) = inner.wakers.iter_mut().find(|(k, _)| *k == key) {
                if !stored.will_wake(waker) {
                    stored.clone_from(waker);
                }
                return false;
            }
        }
        let key = inner.key();
        inner.wakers.push((key, waker.clone()));
        slot.0 = Some(key);
        false
    }

    /// Removes the waker stored in `slot`, if it is still registered.
    pub(crate) fn clear(&self, slot: &mut WakerSlot) {
        if let Some(key) = slot.0.take() {
            let waker = {
                let mut inner = self.lock();
                let index = inner.wakers.iter().position(|(k, _)| *k == key);
                index.map(|index| inner.wakers.swap_remove(index))
            };
            drop(waker);
        }
    }

    #[cfg(test)]
    pub(crate) fn waker_count(&self) -> usize {
        self.lock().wakers.len()
    }
}

impl Inner {
    fn key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }
}

/// Where a pending future's waker sits in a [`Signal`], so the future can
/// take it back out when dropped.
#[derive(Debug, Default)]
pub(crate) struct WakerSlot(Option<u64>);

/// Future returned by [`Signal::fired`].
#[derive(Debug)]
pub struct Fired<'a> {
    signal: &'a Signal,
    slot: WakerSlot,
}

impl Future for Fired<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.signal.poll_fired(cx, &mut this.slot) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Fired<'_> {
    fn drop(&mut self) {
        self.signal.clear(&mut self.slot);
    }
}
