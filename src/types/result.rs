//! Task results and captured panic payloads.
//!
//! A task submitted with a finally hook completes with a [`TaskResult`]:
//! either the value it returned or the panic it escaped with. The payload is
//! captured by the fiber trampoline, never unwinding into the scheduler.

use core::fmt;
use std::any::Any;

/// Payload from a caught task panic.
///
/// Wraps the panic value for transport from the fiber stack to the main
/// context. `&str` and `String` payloads keep their message; anything else
/// is reported opaquely.
#[derive(Debug, Clone)]
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

    /// Extracts a payload from the boxed value produced by `catch_unwind`.
    #[must_use]
    pub fn from_unwind(payload: &(dyn Any + Send)) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Self::new(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self::new(s.clone())
        } else {
            Self::new("task panicked with a non-string payload")
        }
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

/// The result of a completed task: a value or a captured panic.
#[derive(Debug, Clone)]
pub enum TaskResult<T> {
    /// The task returned a value.
    Ok(T),
    /// The task panicked; the payload was captured on the fiber stack.
    Panicked(PanicPayload),
}

impl<T> TaskResult<T> {
    /// Returns true if the task returned a value.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns true if the task panicked.
    #[must_use]
    pub const fn is_panicked(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }

    /// Maps the success value using the provided function.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> TaskResult<U> {
        match self {
            Self::Ok(v) => TaskResult::Ok(f(v)),
            Self::Panicked(p) => TaskResult::Panicked(p),
        }
    }

    /// Converts to a standard `Result` with the panic payload as the error.
    pub fn into_result(self) -> Result<T, PanicPayload> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Panicked(p) => Err(p),
        }
    }

    /// Returns the success value or panics with the captured message.
    ///
    /// # Panics
    ///
    /// Panics if the task panicked.
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self {
            Self::Ok(v) => v,
            Self::Panicked(p) => {
                panic!("called `TaskResult::unwrap()` on a panicked task: {p}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_payload_keeps_message() {
        let caught = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        let payload = PanicPayload::from_unwind(caught.as_ref());
        assert_eq!(payload.message(), "boom");
    }

    #[test]
    fn formatted_payload_keeps_message() {
        let code = 7;
        let caught = std::panic::catch_unwind(|| panic!("error code {code}")).unwrap_err();
        let payload = PanicPayload::from_unwind(caught.as_ref());
        assert_eq!(payload.message(), "error code 7");
    }

    #[test]
    fn map_preserves_panic() {
        let r: TaskResult<i32> = TaskResult::Panicked(PanicPayload::new("x"));
        let mapped = r.map(|v| v + 1);
        assert!(mapped.is_panicked());
    }

    #[test]
    fn into_result_ok() {
        let r = TaskResult::Ok(5);
        assert_eq!(r.into_result().unwrap(), 5);
    }
}
