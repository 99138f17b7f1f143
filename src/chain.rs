//! `then`, `catch` and `recover` for the typed [`Promise`].
//!
//! A link does not park a pooled task while its parent is pending. It
//! registers on the parent's completion signal and on the cancel token, and
//! whichever fires first submits the link's body to the pool. The body runs
//! once, always on the pool and never on the thread that built the chain.
use crate::cancel::CancelToken;
use crate::panic::contain;
use crate::pool::Pool;
use crate::promise::{Promise, Resolver};
use crate::signal::Registration;
use crate::Error;
use std::sync::{Arc, Mutex, PoisonError};

impl<A> Promise<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// A promise for `transform` applied to this promise's value.
    ///
    /// If this promise rejects, or `cancel` fires first, the new promise
    /// rejects with that error and `transform` never runs. If `transform`
    /// returns an error or panics, the new promise rejects with it. Runs on
    /// this promise's pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{CancelToken, Error, Promise};
    ///
    /// let token = CancelToken::none();
    /// let greeting = Promise::resolved(String::from("Hello, "))
    ///     .then(&token, |s| Ok::<_, Error>(s + "world!"));
    /// assert_eq!(greeting.wait(&token).unwrap(), "Hello, world!");
    /// ```
    pub fn then<B, F>(&self, cancel: &CancelToken, transform: F) -> Promise<B>
    where
        B: Send + Sync + 'static,
        F: FnOnce(A) -> Result<B, Error> + Send + 'static,
    {
        self.then_with_pool(cancel, transform, self.pool().clone())
    }

    pub fn then_with_pool<B, F>(
        &self,
        cancel: &CancelToken,
        transform: F,
        pool: Arc<dyn Pool>,
    ) -> Promise<B>
    where
        B: Send + Sync + 'static,
        F: FnOnce(A) -> Result<B, Error> + Send + 'static,
    {
        self.link(cancel, pool, move |outcome, resolver| match outcome {
            Ok(value) => resolver.settle(transform(value)),
            Err(err) => resolver.reject(err),
        })
    }

    /// A promise that passes this promise's value through unchanged, and on
    /// rejection rejects with whatever `recover` makes of the error.
    ///
    /// The value type is unchanged, so `catch` can only replace the error.
    /// Use [`recover`](Promise::recover) to turn a rejection into a value.
    /// A cancelled wait counts as a rejection here, so `recover` also sees
    /// [`Error::Cancelled`] and [`Error::DeadlineExceeded`].
    pub fn catch<F>(&self, cancel: &CancelToken, recover: F) -> Promise<A>
    where
        F: FnOnce(Error) -> Error + Send + 'static,
    {
        self.catch_with_pool(cancel, recover, self.pool().clone())
    }

    pub fn catch_with_pool<F>(
        &self,
        cancel: &CancelToken,
        recover: F,
        pool: Arc<dyn Pool>,
    ) -> Promise<A>
    where
        F: FnOnce(Error) -> Error + Send + 'static,
    {
        self.link(cancel, pool, move |outcome, resolver| match outcome {
            Ok(value) => resolver.resolve(value),
            Err(err) => resolver.reject(recover(err)),
        })
    }

    /// Like [`catch`](Promise::catch), but `recover` may answer a rejection
    /// with a value.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{CancelToken, Error, Promise};
    ///
    /// let token = CancelToken::none();
    /// let port = Promise::<u16>::rejected(Error::msg("no port configured"))
    ///     .recover(&token, |_| Ok(8080));
    /// assert_eq!(port.wait(&token).unwrap(), 8080);
    /// ```
    pub fn recover<F>(&self, cancel: &CancelToken, recover: F) -> Promise<A>
    where
        F: FnOnce(Error) -> Result<A, Error> + Send + 'static,
    {
        self.recover_with_pool(cancel, recover, self.pool().clone())
    }

    pub fn recover_with_pool<F>(
        &self,
        cancel: &CancelToken,
        recover: F,
        pool: Arc<dyn Pool>,
    ) -> Promise<A>
    where
        F: FnOnce(Error) -> Result<A, Error> + Send + 'static,
    {
        self.link(cancel, pool, move |outcome, resolver| match outcome {
            Ok(value) => resolver.resolve(value),
            Err(err) => resolver.settle(recover(err)),
        })
    }

    fn link<B, F>(&self, cancel: &CancelToken, pool: Arc<dyn Pool>, body: F) -> Promise<B>
    where
        B: Send + Sync + 'static,
        F: FnOnce(Result<A, Error>, &Resolver<B>) -> bool + Send + 'static,
    {
        let (child, resolver) = Promise::pending_with_pool(pool.clone());
        let link = Arc::new(Link {
            parent: self.clone(),
            cancel: cancel.clone(),
            pool,
            resolver,
            body: Mutex::new(Some(body)),
            on_parent: Mutex::new(None),
            on_cancel: Mutex::new(None),
        });

        // an already cancelled token is checked first, like in `wait`
        let this = link.clone();
        let registration = cancel.on_cancel(move || this.fire(Trigger::Cancelled));
        *lock(&link.on_cancel) = registration;

        let this = link.clone();
        let registration = self.shared.done.on_fire(move || this.fire(Trigger::Parent));
        *lock(&link.on_parent) = registration;

        // a trigger that fired during registration could not see the
        // registrations that were stored afterwards
        if lock(&link.body).is_none() {
            link.forget_registrations();
        }
        child
    }
}

enum Trigger {
    Parent,
    Cancelled,
}

struct Link<A, B, F> {
    parent: Promise<A>,
    cancel: CancelToken,
    pool: Arc<dyn Pool>,
    resolver: Resolver<B>,
    body: Mutex<Option<F>>,
    on_parent: Mutex<Option<Registration>>,
    on_cancel: Mutex<Option<Registration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<A, B, F> Link<A, B, F>
where
    A: Clone + Send + Sync + 'static,
    B: Send + Sync + 'static,
    F: FnOnce(Result<A, Error>, &Resolver<B>) -> bool + Send + 'static,
{
    /// Called by whichever of the two signals fires. Only the first caller
    /// gets the body and schedules it.
    fn fire(self: Arc<Self>, trigger: Trigger) {
        let Some(body) = lock(&self.body).take() else {
            return;
        };
        self.forget_registrations();

        let outcome = match trigger {
            Trigger::Cancelled => Err(self.cancel.error().unwrap_or(Error::Cancelled)),
            Trigger::Parent => match self.parent.shared.outcome() {
                Some(outcome) => outcome.clone(),
                None => Err(Error::Abandoned),
            },
        };

        let resolver = self.resolver.clone();
        log::trace!("scheduling chained continuation");
        self.pool.submit(Box::new(move || {
            let fallback = resolver.clone();
            if let Err(err) = contain(move || body(outcome, &resolver)) {
                fallback.reject(err);
            }
        }));
    }

    fn forget_registrations(&self) {
        if let Some(registration) = lock(&self.on_parent).take() {
            self.parent.shared.done.forget(registration);
        }
        if let Some(registration) = lock(&self.on_cancel).take() {
            self.cancel.forget(registration);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::WorkerPool;
    use crate::{CancelToken, Error, Promise};
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_then_transforms() {
        let token = CancelToken::none();
        let len = Promise::resolved("four").then(&token, |s| Ok::<_, Error>(s.len()));
        assert_eq!(len.wait(&token).unwrap(), 4);
    }

    #[test]
    fn test_then_skips_transform_on_rejection() {
        let token = CancelToken::none();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let child = Promise::<u8>::rejected(Error::msg("parent failed")).then(&token, move |v| {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, Error>(v)
        });
        assert_eq!(child.wait(&token).unwrap_err().to_string(), "parent failed");
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic_in_transform_rejects_child_only() {
        let token = CancelToken::none();
        let parent = Promise::resolved(1);
        let child = parent.then(&token, |_| -> Result<u8, Error> { panic!("transform blew up") });
        assert_eq!(child.wait(&token).unwrap_err().to_string(), "transform blew up");
        assert_eq!(parent.wait(&token).unwrap(), 1);
    }

    #[test]
    fn test_cancelled_link_rejects_without_parent() {
        let (parent, resolver) = Promise::<u8>::pending();
        let token = CancelToken::new();
        let child = parent.then(&token, |v| Ok::<_, Error>(v + 1));
        token.cancel();
        assert!(matches!(child.wait(&CancelToken::none()), Err(Error::Cancelled)));

        // the parent is unaffected by the link giving up
        resolver.resolve(1);
        assert_eq!(parent.wait(&CancelToken::none()).unwrap(), 1);
    }

    #[test]
    fn test_link_with_deadline() {
        let parent = Promise::new(|resolver| {
            thread::sleep(Duration::from_millis(300));
            resolver.resolve(1);
        });
        let token = CancelToken::with_timeout(Duration::from_millis(10));
        let child = parent.then(&token, |v| Ok::<_, Error>(v));
        assert!(matches!(child.wait(&CancelToken::none()), Err(Error::DeadlineExceeded)));
    }

    #[test]
    fn test_catch_replaces_error() {
        let token = CancelToken::none();
        let child = Promise::<u8>::rejected(Error::msg("low level"))
            .catch(&token, |err| Error::msg(format!("high level: {err}")));
        assert_eq!(child.wait(&token).unwrap_err().to_string(), "high level: low level");
    }

    #[test]
    fn test_catch_passes_value_through() {
        let token = CancelToken::none();
        let child = Promise::resolved(2).catch(&token, |_| Error::msg("unused"));
        assert_eq!(child.wait(&token).unwrap(), 2);
    }

    #[test]
    fn test_recover_to_value() {
        let token = CancelToken::none();
        let child = Promise::<u8>::rejected(Error::msg("x")).recover(&token, |_| Ok(0));
        assert_eq!(child.wait(&token).unwrap(), 0);

        let child = Promise::<u8>::rejected(Error::msg("x"))
            .recover(&token, |err| Err(Error::msg(format!("still {err}"))));
        assert_eq!(child.wait(&token).unwrap_err().to_string(), "still x");
    }

    #[test]
    fn test_long_chain_on_single_worker() {
        let pool = Arc::new(
            WorkerPool::builder()
                .size(NonZeroUsize::new(1).unwrap())
                .spawn()
                .unwrap(),
        );
        let token = CancelToken::none();
        let (head, resolver) = Promise::<u32>::pending_with_pool(pool);
        let mut tail = head.clone();
        for _ in 0..100 {
            tail = tail.then(&token, |v| Ok::<_, Error>(v + 1));
        }
        resolver.resolve(0);
        assert_eq!(tail.wait(&token).unwrap(), 100);
    }

    #[test]
    fn test_then_on_other_pool() {
        let pool = Arc::new(WorkerPool::builder().name("other").spawn().unwrap());
        let token = CancelToken::none();
        let name = Promise::resolved(()).then_with_pool(
            &token,
            |_| Ok::<_, Error>(thread::current().name().map(str::to_owned)),
            pool,
        );
        let name = name.wait(&token).unwrap().unwrap();
        assert!(name.starts_with("other-"));
    }
}
