//! Error types and result aliases shared across Conveyor components.

/// The result type used throughout conveyor-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_display() {
        let err = Error::InvalidId {
            message: "not a ULID".into(),
        };
        assert!(err.to_string().contains("invalid identifier"));
    }

    #[test]
    fn internal_display() {
        let err = Error::internal("unreachable state");
        assert!(err.to_string().contains("internal error"));
    }
}
