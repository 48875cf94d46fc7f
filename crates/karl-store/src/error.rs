//! Store error types.

use karl_stream::StreamError;

/// The result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in the keyed store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing mutation log failed.
    #[error("mutation log error: {0}")]
    Log(#[from] StreamError),
}
