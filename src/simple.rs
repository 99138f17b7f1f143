//! An untyped promise guarded by a mutex, with blocking `then` and `catch`.
//!
//! Values are type-erased, there is no cancellation, and a `catch` handler
//! that runs counts as having handled the error: the promise it returns is
//! resolved with an empty value. Prefer [`crate::Promise`] unless those
//! properties are what you want.
//!
//! # Examples
//!
//! ```
//! use promise_chain::simple::{Promise, State, Value};
//! use std::sync::Arc;
//!
//! let promise = Promise::new(|resolver| {
//!     resolver.resolve("step1");
//! })
//! .then(|value| {
//!     let step = value.as_ref().and_then(|v| v.downcast_ref::<&str>()).copied();
//!     assert_eq!(step, Some("step1"));
//!     Some(Arc::new("step2") as Value)
//! });
//!
//! let value = promise.wait().unwrap();
//! assert_eq!(value.unwrap().downcast_ref::<&str>(), Some(&"step2"));
//! assert_eq!(promise.state(), State::Resolved);
//! ```
use crate::panic::contain;
use crate::pool::{default_pool, Pool};
use crate::signal::Signal;
use crate::Error;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A type-erased resolved value. `None` is the empty value.
pub type Value = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Resolved,
    Rejected,
}

struct Slot {
    state: State,
    result: Option<Value>,
    err: Option<Error>,
}

struct Shared {
    slot: Mutex<Slot>,
    done: Signal,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leaves `Pending` for `state`, once. The slot is written before the
    /// signal fires, so a reader woken by the signal sees the final state.
    fn transition(&self, state: State, result: Option<Value>, err: Option<Error>) -> bool {
        let mut slot = self.lock();
        if slot.state != State::Pending {
            return false;
        }
        slot.state = state;
        slot.result = result;
        slot.err = err;
        drop(slot);
        self.done.fire();
        true
    }
}

/// A handle to an untyped, eventually settled value.
#[derive(Clone)]
pub struct Promise {
    shared: Arc<Shared>,
    pool: Arc<dyn Pool>,
}

/// Settles a [`simple::Promise`](Promise). Dropping the last clone of a
/// resolver without settling rejects with [`Error::Abandoned`].
#[derive(Clone)]
pub struct Resolver {
    shared: Arc<Shared>,
    _last: Arc<AbandonGuard>,
}

struct AbandonGuard {
    shared: Arc<Shared>,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self
            .shared
            .transition(State::Rejected, None, Some(Error::Abandoned))
        {
            log::debug!("promise abandoned by its last resolver");
        }
    }
}

impl Resolver {
    pub fn resolve<V: Any + Send + Sync>(&self, value: V) -> bool {
        self.resolve_value(Some(Arc::new(value)))
    }

    /// Resolves with an already erased value, or the empty value.
    pub fn resolve_value(&self, value: Option<Value>) -> bool {
        let won = self.shared.transition(State::Resolved, value, None);
        if !won {
            log::debug!("resolve ignored, promise already settled");
        }
        won
    }

    pub fn reject(&self, err: impl Into<Error>) -> bool {
        let won = self.shared.transition(State::Rejected, None, Some(err.into()));
        if !won {
            log::debug!("reject ignored, promise already settled");
        }
        won
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.lock();
        f.debug_struct("Promise")
            .field("state", &slot.state)
            .field("err", &slot.err)
            .finish_non_exhaustive()
    }
}

impl Promise {
    /// Runs `executor` on the default pool.
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolver) + Send + 'static,
    {
        Self::with_pool(executor, default_pool())
    }

    pub fn with_pool<F>(executor: F, pool: Arc<dyn Pool>) -> Self
    where
        F: FnOnce(Resolver) + Send + 'static,
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

    fn pending_with_pool(pool: Arc<dyn Pool>) -> (Self, Resolver) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                state: State::Pending,
                result: None,
                err: None,
            }),
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

    pub fn resolved<V: Any + Send + Sync>(value: V) -> Self {
        let (promise, resolver) = Self::pending_with_pool(default_pool());
        resolver.resolve(value);
        promise
    }

    pub fn rejected(err: impl Into<Error>) -> Self {
        let (promise, resolver) = Self::pending_with_pool(default_pool());
        resolver.reject(err);
        promise
    }

    pub fn state(&self) -> State {
        self.shared.lock().state
    }

    /// Blocks until settled. There is no way to give up early.
    pub fn wait(&self) -> Result<Option<Value>, Error> {
        self.shared.done.wait();
        self.outcome()
    }

    fn outcome(&self) -> Result<Option<Value>, Error> {
        let slot = self.shared.lock();
        match (slot.state, &slot.err) {
            (State::Rejected, Some(err)) => Err(err.clone()),
            (State::Rejected, None) => Err(Error::Abandoned),
            _ => Ok(slot.result.clone()),
        }
    }

    /// Derives a promise from this one's outcome.
    ///
    /// The derived promise's executor blocks its pool thread until this
    /// promise settles. Then, with the lock released:
    ///
    /// * resolved: `on_resolved` maps the value, or the value passes through;
    /// * rejected: `on_rejected` sees the error and the derived promise is
    ///   resolved with the empty value, or without a handler the error
    ///   passes through.
    pub fn then_catch<R, J>(&self, on_resolved: Option<R>, on_rejected: Option<J>) -> Promise
    where
        R: FnOnce(Option<Value>) -> Option<Value> + Send + 'static,
        J: FnOnce(Error) + Send + 'static,
    {
        let parent = self.shared.clone();
        Self::with_pool(
            move |resolver| {
                parent.done.wait();
                let (state, result, err) = {
                    let slot = parent.lock();
                    (slot.state, slot.result.clone(), slot.err.clone())
                };
                match state {
                    State::Resolved => match on_resolved {
                        Some(on_resolved) => resolver.resolve_value(on_resolved(result)),
                        None => resolver.resolve_value(result),
                    },
                    State::Rejected => {
                        let err = err.unwrap_or(Error::Abandoned);
                        match on_rejected {
                            Some(on_rejected) => {
                                on_rejected(err);
                                resolver.resolve_value(None)
                            }
                            None => resolver.reject(err),
                        }
                    }
                    State::Pending => unreachable!("completion signal fired on a pending promise"),
                };
            },
            self.pool.clone(),
        )
    }

    pub fn then<R>(&self, on_resolved: R) -> Promise
    where
        R: FnOnce(Option<Value>) -> Option<Value> + Send + 'static,
    {
        self.then_catch(Some(on_resolved), None::<fn(Error)>)
    }

    pub fn catch<J>(&self, on_rejected: J) -> Promise
    where
        J: FnOnce(Error) + Send + 'static,
    {
        self.then_catch(None::<fn(Option<Value>) -> Option<Value>>, Some(on_rejected))
    }
}
