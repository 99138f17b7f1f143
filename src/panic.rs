//! Turns a panic inside an executor or continuation into a rejection.
use crate::Error;
use std::any::Any;
use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Runs `f`, returning the error its panic converts to if it unwinds.
///
/// Closures run here only hand their results to a promise, which stays
/// consistent whether or not they finish, hence the [`AssertUnwindSafe`].
///
/// A typed error only survives the unwind when the payload is an [`Error`],
/// an `Arc<dyn Error + Send + Sync>` or a `Box<dyn Error + Send + Sync>`.
/// The payload can not be inspected for arbitrary error types, so
/// `panic_any(MyError)` with a bare concrete type comes back as
/// [`Error::Panicked`] with the text "panic with a non-string payload".
///
/// # Examples
///
/// ```
/// use promise_chain::{panic::contain, Error};
/// use std::io;
/// use std::panic::panic_any;
///
/// let disk = || io::Error::new(io::ErrorKind::Other, "disk");
///
/// let wrapped = contain(|| panic_any(Error::new(disk()))).unwrap_err();
/// assert!(wrapped.is::<io::Error>());
///
/// let bare = contain(|| panic_any(disk())).unwrap_err();
/// assert!(!bare.is::<io::Error>());
/// assert_eq!(bare.to_string(), "panic with a non-string payload");
/// ```
pub fn contain<R>(f: impl FnOnce() -> R) -> Result<R, Error> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let err = error_from_panic(payload);
        log::warn!("contained panic: {err}");
        err
    })
}

/// Converts a panic payload into an [`Error`].
///
/// An [`Error`], `Arc<dyn Error + Send + Sync>` or
/// `Box<dyn Error + Send + Sync>` payload is used as it is, so a promise
/// rejected through `panic_any(Error::new(my_error))` still satisfies
/// [`Error::is`]. `&str` and `String` payloads become [`Error::Panicked`]
/// with that text, and any other payload becomes [`Error::Panicked`] with a
/// fixed message.
///
/// # Examples
///
/// ```
/// use promise_chain::{panic::contain, Error};
///
/// let err = contain(|| panic!("random error")).unwrap_err();
/// assert!(matches!(err, Error::Panicked(_)));
/// assert_eq!(err.to_string(), "random error");
/// ```
pub fn error_from_panic(payload: Box<dyn Any + Send>) -> Error {
    let payload = match payload.downcast::<Error>() {
        Ok(err) => return *err,
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<Arc<dyn StdError + Send + Sync>>() {
        Ok(err) => return Error::Rejected(*err),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<Box<dyn StdError + Send + Sync>>() {
        Ok(err) => return Error::Rejected(Arc::from(*err)),
        Err(payload) => payload,
    };
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return Error::Panicked((*msg).to_owned());
    }
    match payload.downcast::<String>() {
        Ok(msg) => Error::Panicked(*msg),
        Err(_) => Error::Panicked("panic with a non-string payload".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::contain;
    use crate::Error;
    use std::panic::panic_any;
    use std::{fmt, io};

    #[derive(Debug)]
    struct Expected;

    impl fmt::Display for Expected {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("expected error")
        }
    }

    impl std::error::Error for Expected {}

    #[test]
    fn test_no_panic() {
        assert_eq!(contain(|| 3).unwrap(), 3);
    }

    #[test]
    fn test_str_and_string_payloads() {
        let err = contain(|| panic!("random error")).unwrap_err();
        assert_eq!(err.to_string(), "random error");

        let n = 4;
        let err = contain(|| panic!("failed at {n}")).unwrap_err();
        assert_eq!(err.to_string(), "failed at 4");
    }

    #[test]
    fn test_error_payloads_keep_identity() {
        let err = contain(|| panic_any(Error::new(Expected))).unwrap_err();
        assert!(err.is::<Expected>());

        let err = contain(|| panic_any(Error::Cancelled)).unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let boxed: Box<dyn std::error::Error + Send + Sync> =
            Box::new(io::Error::new(io::ErrorKind::Other, "io"));
        let err = contain(move || panic_any(boxed)).unwrap_err();
        assert!(err.is::<io::Error>());
    }

    #[test]
    fn test_opaque_payload() {
        let err = contain(|| panic_any(42_u8)).unwrap_err();
        assert!(matches!(err, Error::Panicked(_)));
    }

    #[test]
    fn test_bare_error_payload_is_opaque() {
        let err = contain(|| panic_any(Expected)).unwrap_err();
        assert!(!err.is::<Expected>());
        assert_eq!(err.to_string(), "panic with a non-string payload");
    }
}
