//! Error types for the fiber engine.
//!
//! Only genuinely recoverable failures surface as [`Error`]. Task panics are
//! captured into [`TaskResult`](crate::types::TaskResult) by the trampoline;
//! submission misuse and internal invariant violations are programmer errors
//! and assert (fatal) rather than returning an error value.

use core::fmt;

/// The kind of engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A fiber stack could not be allocated or protected.
    StackAllocation,
    /// Internal engine error (bug).
    Internal,
}

/// The error type for engine operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::StackAllocation => write!(f, "fiber stack allocation failed")?,
            ErrorKind::Internal => write!(f, "internal engine error")?,
        }
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}
