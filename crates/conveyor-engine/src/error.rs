//! Error types for the task-queue engine.
//!
//! The engine distinguishes five kinds of failure:
//!
//! - `InvalidArgument`: caller misuse (unknown queue, malformed chain, bad percentage)
//! - `NotFound`: task or resource absent
//! - `Conflict`: uniqueness collision, concurrent-processing guard trip
//! - `Backend`: storage or dispatcher I/O failure
//! - `Handler`: error raised by a user handler; not an engine bug
//!
//! Use [`Error::kind`] when a caller needs the category rather than the
//! concrete variant.

use conveyor_core::TaskId;

/// The result type used throughout conveyor-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The category of an error, independent of its concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller misuse.
    InvalidArgument,
    /// A task or resource was absent.
    NotFound,
    /// A concurrent operation won.
    Conflict,
    /// Storage or dispatcher I/O failed.
    Backend,
    /// A user handler failed.
    Handler,
}

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input was provided by the caller.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid input.
        message: String,
    },

    /// A task was not found.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// A named resource was not found.
    #[error("not found: {resource} '{id}'")]
    NotFound {
        /// The type of resource that was not found.
        resource: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A concurrent operation holds the resource.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A dispatcher operation failed.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the dispatch failure.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A user handler returned an error or panicked.
    #[error("handler failed: {message}")]
    Handler {
        /// The error reported by the handler.
        message: String,
    },

    /// An error from conveyor-core.
    #[error("core error: {0}")]
    Core(#[from] conveyor_core::Error),
}

impl Error {
    /// Creates a new invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a new conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new handler-failure error.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Returns the category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::TaskNotFound { .. } | Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Storage { .. }
            | Self::Dispatch { .. }
            | Self::Serialization { .. }
            | Self::Core(_) => ErrorKind::Backend,
            Self::Handler { .. } => ErrorKind::Handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn invalid_argument_display() {
        let err = Error::invalid_argument("unknown queue 'nope'");
        assert!(err.to_string().contains("invalid argument"));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn task_not_found_display() {
        let err = Error::TaskNotFound {
            task_id: TaskId::generate(),
        };
        assert!(err.to_string().contains("task not found"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn conflict_kind() {
        let err = Error::conflict("task is already being processed");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::storage_with_source("failed to write task", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn handler_kind() {
        let err = Error::handler("boom");
        assert_eq!(err.kind(), ErrorKind::Handler);
    }
}
