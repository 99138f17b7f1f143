//! The typed promise: a single-assignment result cell plus a completion
//! [`Signal`].
use crate::cancel::CancelToken;
use crate::panic::contain;
use crate::pool::{default_pool, Pool};
use crate::signal::{Signal, WakerSlot};
use crate::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

/// A handle to the eventual outcome of a computation.
///
/// Handles are cheap to clone and all clones observe the same outcome. The
/// outcome is written exactly once: the first [`Resolver::resolve`] or
/// [`Resolver::reject`] wins and every later attempt is ignored.
///
/// # Examples
///
/// ```
/// use promise_chain::{CancelToken, Promise};
/// use std::thread;
///
/// let promise = Promise::new(|resolver| {
///     resolver.resolve(String::from("🍓"));
/// });
/// let waiter = promise.clone();
/// let task1 = thread::spawn(move || waiter.wait(&CancelToken::none()));
///
/// assert_eq!(promise.wait(&CancelToken::none()).unwrap(), "🍓");
/// assert_eq!(task1.join().expect("The task1 thread has panicked").unwrap(), "🍓");
/// ```
pub struct Promise<T> {
    pub(crate) shared: Arc<Shared<T>>,
    pool: Arc<dyn Pool>,
}

pub(crate) struct Shared<T> {
    outcome: OnceLock<Result<T, Error>>,
    pub(crate) done: Signal,
}

/// Settles a [`Promise`]. Clones settle the same promise.
///
/// When the last clone is dropped while the promise is still pending, the
/// promise is rejected with [`Error::Abandoned`].
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
    _last: Arc<AbandonGuard<T>>,
}

struct AbandonGuard<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for AbandonGuard<T> {
    fn drop(&mut self) {
        if self.shared.settle(Err(Error::Abandoned)) {
            log::debug!("promise abandoned by its last resolver");
        }
    }
}

impl<T> Shared<T> {
    fn settle(&self, outcome: Result<T, Error>) -> bool {
        // OnceLock::set lets exactly one caller through; the value is in
        // place before the signal fires
        if self.outcome.set(outcome).is_ok() {
            self.done.fire();
            true
        } else {
            false
        }
    }

    pub(crate) fn outcome(&self) -> Option<&Result<T, Error>> {
        if self.done.is_fired() {
            self.outcome.get()
        } else {
            None
        }
    }
}

impl<T> Resolver<T> {
    /// Resolves the promise with `value`. Returns `false`, dropping `value`,
    /// if the promise was already settled.
    pub fn resolve(&self, value: T) -> bool {
        let won = self.shared.settle(Ok(value));
        if !won {
            log::debug!("resolve ignored, promise already settled");
        }
        won
    }

    /// Rejects the promise with `err`. Returns `false` if the promise was
    /// already settled.
    pub fn reject(&self, err: impl Into<Error>) -> bool {
        let won = self.shared.settle(Err(err.into()));
        if !won {
            log::debug!("reject ignored, promise already settled");
        }
        won
    }

    /// Settles the promise with `outcome`.
    pub fn settle(&self, outcome: Result<T, Error>) -> bool {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(err) => self.reject(err),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.shared.done.is_fired()
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _last: self._last.clone(),
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("outcome", &self.shared.outcome())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Submits `executor` to the [default pool](crate::pool::default_pool)
    /// and returns without waiting for it.
    ///
    /// A panic inside `executor` rejects the promise, see
    /// [`panic::contain`](crate::panic::contain).
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolver<T>) + Send + 'static,
    {
        Self::with_pool(executor, default_pool())
    }

    /// Like [`Promise::new`] but runs `executor` on `pool`. Continuations
    /// chained with [`then`](Promise::then) and friends also use `pool`.
    pub fn with_pool<F>(executor: F, pool: Arc<dyn Pool>) -> Self
    where
        F: FnOnce(Resolver<T>) + Send + 'static,
    {
        let (promise, resolver) = Self::pending_with_pool(pool.clone());
        pool.submit(Box::new(move || {
            let fallback = resolver.clone();
            if let Err(err) = contain(move || executor(resolver)) {
                fallback.reject(err);
            }
        }));
        promise
    }

    /// Runs `f` on the default pool and settles with whatever it returns.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{CancelToken, Error, Promise};
    ///
    /// let parsed = Promise::from_fn(|| "42".parse::<i32>().map_err(Error::new));
    /// assert_eq!(parsed.wait(&CancelToken::none()).unwrap(), 42);
    /// ```
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        Self::from_fn_with_pool(f, default_pool())
    }

    pub fn from_fn_with_pool<F>(f: F, pool: Arc<dyn Pool>) -> Self
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        Self::with_pool(
            move |resolver| {
                resolver.settle(f());
            },
            pool,
        )
    }

    /// A pending promise with its resolver, for settling from code that is
    /// not an executor.
    pub fn pending() -> (Self, Resolver<T>) {
        Self::pending_with_pool(default_pool())
    }

    pub fn pending_with_pool(pool: Arc<dyn Pool>) -> (Self, Resolver<T>) {
        let shared = Arc::new(Shared {
            outcome: OnceLock::new(),
            done: Signal::new(),
        });
        let resolver = Resolver {
            shared: shared.clone(),
            _last: Arc::new(AbandonGuard {
                shared: shared.clone(),
            }),
        };
        (Self { shared, pool }, resolver)
    }

    /// An already resolved promise.
    pub fn resolved(value: T) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.resolve(value);
        promise
    }

    /// An already rejected promise.
    pub fn rejected(err: impl Into<Error>) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.reject(err);
        promise
    }
}

impl<T> Promise<T> {
    pub fn is_settled(&self) -> bool {
        self.shared.done.is_fired()
    }

    /// The pool continuations of this promise run on by default.
    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    /// Waits for the promise to settle or for `cancel` to fire, whichever
    /// happens first.
    ///
    /// A cancelled wait returns the token's error and leaves the promise
    /// alone; other waiters and the computation itself carry on.
    pub fn wait_async<'a>(&'a self, cancel: &'a CancelToken) -> Wait<'a, T> {
        Wait {
            promise: self,
            cancel,
            on_cancel: WakerSlot::default(),
            on_settle: WakerSlot::default(),
        }
    }
}

impl<T: Clone> Promise<T> {
    /// The outcome if the promise has settled, without blocking.
    pub fn try_get(&self) -> Option<Result<T, Error>> {
        self.shared.outcome().cloned()
    }

    /// Blocks the current thread for [`wait_async`](Promise::wait_async).
    pub fn wait(&self, cancel: &CancelToken) -> Result<T, Error> {
        futures::executor::block_on(self.wait_async(cancel))
    }
}

/// Future returned by [`Promise::wait_async`].
///
/// While pending it keeps a waker on both the token and the promise.
/// Dropping it takes both back out, whichever side finished the wait.
pub struct Wait<'a, T> {
    promise: &'a Promise<T>,
    cancel: &'a CancelToken,
    on_cancel: WakerSlot,
    on_settle: WakerSlot,
}

impl<T: Clone> Future for Wait<'_, T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(err) = this.cancel.poll_cancelled(cx, &mut this.on_cancel) {
            return Poll::Ready(Err(err));
        }
        if this.promise.shared.done.poll_fired(cx, &mut this.on_settle) {
            if let Some(outcome) = this.promise.shared.outcome() {
                return Poll::Ready(outcome.clone());
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for Wait<'_, T> {
    fn drop(&mut self) {
        self.cancel.clear_waker(&mut self.on_cancel);
        self.promise.shared.done.clear(&mut self.on_settle);
    }
}

#[cfg(test)]
mod tests {
    use super::Promise;
    use crate::pool::Job;
    use crate::{CancelToken, Error};
    use futures::executor::block_on;
    use std::future::Future;
    use std::sync::{Arc, Barrier};
    use std::task::Context;
    use std::thread;
    use std::time::Duration;

    fn none() -> CancelToken {
        CancelToken::none()
    }

    #[test]
    fn test_resolve() {
        let promise = Promise::new(|resolver| {
            resolver.resolve(1);
        });
        assert_eq!(promise.wait(&none()).unwrap(), 1);
        assert!(promise.is_settled());
    }

    #[test]
    fn test_reject() {
        let promise = Promise::<()>::new(|resolver| {
            resolver.reject(Error::msg("nope"));
        });
        assert_eq!(promise.wait(&none()).unwrap_err().to_string(), "nope");
    }

    #[test]
    fn test_first_writer_wins() {
        let (promise, resolver) = Promise::pending();
        assert!(resolver.resolve("first"));
        assert!(!resolver.resolve("second"));
        assert!(!resolver.reject(Error::msg("late")));
        assert_eq!(promise.try_get().unwrap().unwrap(), "first");
    }

    #[test]
    fn test_racing_resolvers() {
        for _ in 0..20 {
            let (promise, resolver) = Promise::<usize>::pending();
            let barrier = Arc::new(Barrier::new(8));
            let tasks: Vec<_> = (0..8)
                .map(|i| {
                    let resolver = resolver.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        if i % 2 == 0 {
                            resolver.resolve(i)
                        } else {
                            resolver.reject(Error::msg(i))
                        }
                    })
                })
                .collect();
            let winners = tasks
                .into_iter()
                .map(|t| t.join().expect("The resolver thread has panicked"))
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);

            let first = promise.try_get().unwrap();
            for _ in 0..3 {
                let again = promise.try_get().unwrap();
                assert_eq!(format!("{first:?}"), format!("{again:?}"));
            }
        }
    }

    #[test]
    fn test_pending_until_settled() {
        let (promise, resolver) = Promise::<u8>::pending();
        assert!(!promise.is_settled());
        assert!(promise.try_get().is_none());
        resolver.resolve(9);
        assert_eq!(promise.try_get().unwrap().unwrap(), 9);
    }

    #[test]
    fn test_abandoned_when_resolver_dropped() {
        let promise = Promise::<u8>::new(|_resolver| {});
        assert!(matches!(promise.wait(&none()), Err(Error::Abandoned)));
    }

    #[test]
    fn test_resolver_moved_to_another_thread() {
        let promise = Promise::new(|resolver| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                resolver.resolve(5);
            });
        });
        assert_eq!(promise.wait(&none()).unwrap(), 5);
    }

    #[test]
    fn test_wait_async() {
        let promise = Promise::resolved(3);
        let token = none();
        assert_eq!(block_on(promise.wait_async(&token)).unwrap(), 3);
    }

    #[test]
    fn test_cancelled_wait_leaves_promise_pending() {
        let (promise, resolver) = Promise::<u8>::pending();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(promise.wait(&token), Err(Error::Cancelled)));
        assert!(!promise.is_settled());

        resolver.resolve(1);
        assert_eq!(promise.wait(&none()).unwrap(), 1);
        // the cancelled token keeps winning, the promise is untouched
        assert!(matches!(promise.wait(&token), Err(Error::Cancelled)));
    }

    #[test]
    fn test_custom_pool() {
        let inline = Arc::new(|job: Job| job());
        let promise = Promise::with_pool(
            |resolver| {
                resolver.resolve(thread::current().id());
            },
            inline,
        );
        // an inline pool runs the executor before with_pool returns
        assert!(promise.is_settled());
        assert_eq!(promise.wait(&none()).unwrap(), thread::current().id());
    }

    #[test]
    fn test_finished_waits_leave_no_wakers() {
        let token = CancelToken::new();
        let tasks: Vec<_> = (0..200)
            .map(|i| {
                let token = token.clone();
                thread::spawn(move || Promise::resolved(i).wait(&token))
            })
            .collect();
        for (i, task) in tasks.into_iter().enumerate() {
            let value = task.join().expect("The waiter thread has panicked");
            assert_eq!(value.unwrap(), i as i32);
        }
        assert_eq!(token.waker_count(), 0);
    }

    #[test]
    fn test_dropped_wait_leaves_no_wakers() {
        let (promise, _resolver) = Promise::<u8>::pending();
        let token = CancelToken::new();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = Box::pin(promise.wait_async(&token));
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert_eq!(promise.shared.done.waker_count(), 1);
        assert_eq!(token.waker_count(), 1);

        drop(wait);
        assert_eq!(promise.shared.done.waker_count(), 0);
        assert_eq!(token.waker_count(), 0);
    }
}
