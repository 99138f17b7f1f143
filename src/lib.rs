//! Promises for threads: a value that some pooled computation will produce,
//! waited on with an optional [`CancelToken`] and chained with
//! [`then`](Promise::then), [`catch`](Promise::catch) and
//! [`recover`](Promise::recover).
//!
//! Executors run on a [`Pool`](pool::Pool). The default one spawns a thread
//! per job; [`WorkerPool`](pool::WorkerPool) bounds the number of threads.
//! Panics in executors and continuations reject the promise they belong to.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{CancelToken, Error, Promise};
//!
//! let token = CancelToken::none();
//! let hello = Promise::new(|resolver| {
//!     resolver.resolve(String::from("Hello, "));
//! });
//! let world = hello.then(&token, |s| Ok::<_, Error>(s + "world!"));
//! let failed = world.then(&token, |_| Err::<String, _>(Error::msg("expected error")));
//!
//! assert_eq!(world.wait(&token).unwrap(), "Hello, world!");
//! assert_eq!(failed.wait(&token).unwrap_err().to_string(), "expected error");
//! ```
//!
//! Cancelling a wait only stops the waiter:
//!
//! ```
//! use promise_chain::{CancelToken, Error, Promise};
//! use std::time::Duration;
//!
//! let slow = Promise::new(|resolver| {
//!     std::thread::sleep(Duration::from_millis(200));
//!     resolver.resolve(1);
//! });
//! let impatient = CancelToken::with_timeout(Duration::from_millis(10));
//! assert!(matches!(slow.wait(&impatient), Err(Error::DeadlineExceeded)));
//! assert_eq!(slow.wait(&CancelToken::none()).unwrap(), 1);
//! ```
//!
//! [`simple::Promise`] is an untyped variant without cancellation.

pub mod cancel;
mod chain;
mod error;
pub mod panic;
pub mod pool;
pub mod promise;
pub mod signal;
pub mod simple;

pub use cancel::CancelToken;
pub use error::Error;
pub use promise::{Promise, Resolver, Wait};
