//! The exception taxonomy carried inside outcomes.
//!
//! Continuations cross thread boundaries, so upstream failures travel as
//! data rather than as unwinding: every failure is an [`Exception`] stored
//! in an [`Outcome`](crate::Outcome). Panics raised by user callables are
//! caught at the scheduling boundary and wrapped in a [`PanicPayload`].

use core::fmt;
use std::any::Any;

/// Payload from a caught panic.
///
/// Wraps the panic value for safe transport across task boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a message from a raw panic value.
    ///
    /// String payloads (the overwhelmingly common case) are carried
    /// verbatim; anything else is replaced by a placeholder.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// A failure carried through the future machinery.
///
/// The first group covers API misuse detected by the library; the second
/// group covers failures raised inside user callables. All of them flow
/// through [`Outcome::Exception`](crate::Outcome::Exception) and compare by
/// payload, which keeps assertions on propagated errors straightforward.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Exception {
    /// Second attempt to extract a future, or to consume an already
    /// retrieved state.
    #[error("future already retrieved")]
    AlreadyRetrieved,
    /// The state transitioned to its timed-out phase before the operation.
    #[error("wrong state: future timed out")]
    TimedOut,
    /// A synchronous wait reached its deadline before completion.
    #[error("wait deadline elapsed")]
    WaitTimeout,
    /// An empty outcome was consumed.
    #[error("outcome is uninitialized")]
    Uninitialized,
    /// The exception payload was requested from a value outcome.
    #[error("outcome does not hold an exception")]
    NotException,
    /// The worker pool shut down before the task could run.
    #[error("worker pool shut down before the task ran")]
    ShutdownAborted,
    /// A user callable panicked; the payload is carried verbatim.
    #[error("{0}")]
    Panicked(PanicPayload),
    /// A failure constructed by the caller.
    #[error("{0}")]
    User(String),
}

impl Exception {
    /// Creates a caller-constructed failure.
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }
}

impl From<&str> for Exception {
    fn from(message: &str) -> Self {
        Self::User(message.to_string())
    }
}

impl From<String> for Exception {
    fn from(message: String) -> Self {
        Self::User(message)
    }
}

impl From<PanicPayload> for Exception {
    fn from(payload: PanicPayload) -> Self {
        Self::Panicked(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_display() {
        let payload = PanicPayload::new("something went wrong");
        assert_eq!(format!("{payload}"), "panic: something went wrong");
    }

    #[test]
    fn from_panic_extracts_static_str() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        let payload = PanicPayload::from_panic(boxed.as_ref());
        assert_eq!(payload.message(), "boom");
    }

    #[test]
    fn from_panic_extracts_string() {
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        let payload = PanicPayload::from_panic(boxed.as_ref());
        assert_eq!(payload.message(), "owned boom");
    }

    #[test]
    fn from_panic_non_string_placeholder() {
        let boxed: Box<dyn Any + Send> = Box::new(42_u32);
        let payload = PanicPayload::from_panic(boxed.as_ref());
        assert_eq!(payload.message(), "non-string panic payload");
    }

    #[test]
    fn user_exception_from_str() {
        let e = Exception::from("boom");
        assert_eq!(e, Exception::User("boom".to_string()));
        assert_eq!(format!("{e}"), "boom");
    }

    #[test]
    fn taxonomy_messages() {
        assert_eq!(
            format!("{}", Exception::AlreadyRetrieved),
            "future already retrieved"
        );
        assert_eq!(
            format!("{}", Exception::TimedOut),
            "wrong state: future timed out"
        );
        assert_eq!(
            format!("{}", Exception::WaitTimeout),
            "wait deadline elapsed"
        );
        assert_eq!(
            format!("{}", Exception::ShutdownAborted),
            "worker pool shut down before the task ran"
        );
    }
}
