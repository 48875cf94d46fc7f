//! Stream error types.

/// The result type for log operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur on the append-only log.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The log is being torn down; no further publishes are accepted.
    #[error("publish rejected: the stream is shutting down")]
    ShuttingDown,

    /// A persistence operation failed.
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of the persistence failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A persisted entry could not be decoded during replay.
    #[error("corrupt log entry at line {line}: {message}")]
    Corrupt {
        /// 1-based line number in the backing file.
        line: usize,
        /// What failed to decode.
        message: String,
    },
}

impl StreamError {
    /// Creates a persistence error with the given message.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a persistence error wrapping an I/O cause.
    #[must_use]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
