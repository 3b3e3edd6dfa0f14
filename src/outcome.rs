//! Three-state tagged value conveying success or failure across stages.
//!
//! An [`Outcome`] is either uninitialized, a value, or a captured
//! [`Exception`]. Every continuation boundary in the future machinery
//! funnels through an outcome: failures must be observable downstream
//! without unwinding across scheduling boundaries, so they are carried as
//! data.
//!
//! The unit type collapses the "void" case: `Outcome<()>` holds no payload
//! but keeps full exception semantics.

use crate::error::Exception;

/// The result of an asynchronous stage.
#[derive(Debug, Clone, Default)]
pub enum Outcome<T> {
    /// No value has been assigned yet.
    #[default]
    Uninitialized,
    /// The stage produced a value.
    Value(T),
    /// The stage failed; the error is carried verbatim.
    Exception(Exception),
}

impl<T> Outcome<T> {
    /// Wraps a value.
    #[must_use]
    pub fn from_value(value: T) -> Self {
        Self::Value(value)
    }

    /// Wraps a failure.
    #[must_use]
    pub fn from_exception(exception: impl Into<Exception>) -> Self {
        Self::Exception(exception.into())
    }

    /// Consumes the outcome and returns the payload.
    ///
    /// # Errors
    ///
    /// Re-raises the captured exception, or [`Exception::Uninitialized`]
    /// when nothing was assigned.
    pub fn value(self) -> Result<T, Exception> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Exception(exception) => Err(exception),
            Self::Uninitialized => Err(Exception::Uninitialized),
        }
    }

    /// Consumes the outcome and returns the captured exception.
    ///
    /// # Errors
    ///
    /// [`Exception::NotException`] unless the outcome holds an exception.
    pub fn exception(self) -> Result<Exception, Exception> {
        match self {
            Self::Exception(exception) => Ok(exception),
            Self::Value(_) | Self::Uninitialized => Err(Exception::NotException),
        }
    }

    /// Returns true if the outcome holds a value.
    #[must_use]
    pub fn has_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Returns true if the outcome holds an exception.
    #[must_use]
    pub fn has_exception(&self) -> bool {
        matches!(self, Self::Exception(_))
    }

    /// Returns true if nothing has been assigned.
    #[must_use]
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, Self::Uninitialized)
    }

    /// Moves the outcome out, leaving `Uninitialized` behind.
    ///
    /// This is the consumption primitive of the shared completion state: a
    /// delivered outcome is moved to its single consumer exactly once.
    #[must_use]
    pub fn take(&mut self) -> Self {
        core::mem::replace(self, Self::Uninitialized)
    }

    /// Transforms the value, forwarding exception and uninitialized states.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Value(value) => Outcome::Value(f(value)),
            Self::Exception(exception) => Outcome::Exception(exception),
            Self::Uninitialized => Outcome::Uninitialized,
        }
    }
}

impl<T> From<Result<T, Exception>> for Outcome<T> {
    fn from(result: Result<T, Exception>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(exception) => Self::Exception(exception),
        }
    }
}
