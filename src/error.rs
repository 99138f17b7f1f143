use std::{error::Error as StdError, fmt::Display, sync::Arc};

/// The reason a promise was rejected, or a wait on it gave up.
///
/// Every observer of a settled promise receives its own clone of the same
/// error, so foreign errors are kept behind an [`Arc`] and can be recovered
/// with [`Error::downcast_ref`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The executor rejected with an error value of its own.
    #[error(transparent)]
    Rejected(Arc<dyn StdError + Send + Sync + 'static>),
    /// The executor rejected with a plain message.
    #[error("{0}")]
    Message(String),
    /// The executor or continuation panicked with a payload that was not an
    /// error. The message is the formatted payload.
    #[error("{0}")]
    Panicked(String),
    /// Every [`Resolver`](crate::Resolver) was dropped before the promise
    /// was settled.
    #[error("promise abandoned before it was settled")]
    Abandoned,
    /// The cancellation token passed to the wait was cancelled.
    #[error("wait cancelled")]
    Cancelled,
    /// The cancellation token passed to the wait hit its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    /// Wraps any error so it can be used as a rejection.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::Error;
    /// use std::io;
    ///
    /// let err = Error::new(io::Error::new(io::ErrorKind::Other, "disk on fire"));
    /// assert!(err.is::<io::Error>());
    /// assert_eq!(err.to_string(), "disk on fire");
    /// ```
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Rejected(Arc::new(err))
    }

    pub fn msg(msg: impl Display) -> Self {
        Error::Message(msg.to_string())
    }

    /// Returns the wrapped error if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            Error::Rejected(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// `true` for the errors a wait returns on its own behalf, which are
    /// never recorded in a promise.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}
