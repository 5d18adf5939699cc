//! Common error types for DualStore.

use thiserror::Error;

/// Top-level error type for DualStore operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote could not be reached, or answered with a status that is
    /// configured as a connectivity failure.
    #[error("Connectivity error (status {status}): {message}")]
    Connectivity { status: u16, message: String },

    /// The remote answered with a non-success status that is not a
    /// connectivity failure.
    #[error("Remote error (status {status}): {message}")]
    Remote { status: u16, message: String },

    /// Local persistent store or journal operation failed.
    #[error("Local storage error: {0}")]
    LocalStorage(String),

    /// Missing or malformed routing parameters.
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A bulk replay stopped at its first failure.
    #[error("Replay interrupted at {model_id} after {} applied: {source}", .completed.len())]
    ReplayInterrupted {
        model_id: String,
        completed: Vec<String>,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Build a remote failure as reported by a transport.
    ///
    /// Status `0` means no response reached the transport.
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }

    /// The transport status carried by a remote-side failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Connectivity { status, .. } | Error::Remote { status, .. } => Some(*status),
            Error::ReplayInterrupted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Whether this error reports the remote as unreachable.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Connectivity { .. } => true,
            Error::ReplayInterrupted { source, .. } => source.is_connectivity(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_of_remote_errors() {
        assert_eq!(Error::remote(500, "boom").status(), Some(500));
        assert_eq!(Error::Validation("x".into()).status(), None);

        let interrupted = Error::ReplayInterrupted {
            model_id: "srv-1".into(),
            completed: vec![],
            source: Box::new(Error::Connectivity {
                status: 0,
                message: "unreachable".into(),
            }),
        };
        assert_eq!(interrupted.status(), Some(0));
        assert!(interrupted.is_connectivity());
    }

    #[test]
    fn test_replay_interrupted_display() {
        let err = Error::ReplayInterrupted {
            model_id: "b".into(),
            completed: vec!["a".into()],
            source: Box::new(Error::remote(500, "boom")),
        };
        let text = err.to_string();
        assert!(text.contains("at b after 1 applied"));
        assert!(text.contains("status 500"));
    }
}
