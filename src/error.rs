//! Error types for nearfield.

use thiserror::Error;

/// Errors that can occur during index build, search, or (de)serialization.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    /// The index holds no data (not trained, or a sub-index is missing).
    #[error("index is empty")]
    EmptyIndex,

    /// An operation that requires a trained index was called before train.
    #[error("index is not trained")]
    IndexNotTrained,

    /// Train was called on an index that is already trained.
    #[error("index is already trained")]
    IndexAlreadyTrained,

    /// Invalid parameter or argument combination.
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    /// Unknown or unsupported metric type string.
    #[error("invalid metric type: {0}")]
    InvalidMetricType(String),

    /// The binary set handed to deserialization is missing or malformed.
    #[error("invalid binary set")]
    InvalidBinarySet,

    /// The serialized stream starts with an index tag this build does not know.
    #[error("unrecognized serialized index type: {0}")]
    InvalidSerializedIndexType(String),

    /// The index is structurally unable to serve the request.
    #[error("index error: {0}")]
    InvalidIndexError(String),

    /// Functionality that is declared but not available.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A lower-level failure, message preserved.
    #[error("inner error: {0}")]
    Inner(String),
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Inner(e.to_string())
    }
}

/// Result type alias for nearfield operations.
pub type Result<T> = std::result::Result<T, IndexError>;
