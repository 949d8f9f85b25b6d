//! Result type definition and extension traits for Railway-Oriented Programming.
//!
//! Provides combinators that keep auxiliary failures off the primary path
//! without reaching for unwrap/expect/panic.

use crate::error::Error;

/// The standard Result type for Conduit core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for any Result whose error can be displayed.
pub trait GenericResultExt<T, E> {
    /// Perform a side effect on the Err value without consuming the Result.
    fn tap_err<F: FnOnce(&E)>(self, f: F) -> Self;

    /// Log the error at `warn` level under `operation` and continue with `None`.
    ///
    /// Used for best-effort work whose failure must not change the outcome
    /// of the operation that triggered it.
    fn warn_and_discard(self, operation: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> GenericResultExt<T, E> for std::result::Result<T, E> {
    fn tap_err<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }

    fn warn_and_discard(self, operation: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(operation, error = %e, "Auxiliary operation failed, continuing");
                None
            }
        }
    }
}
