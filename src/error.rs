//! Error types for the star-tree index
//!
//! Build-time faults (bad configuration, values that violate a metric's
//! numeric contract, misuse of the builder) and read-time faults (corrupted
//! buffers) share one error type. A query the index cannot serve is not an
//! error: see [`crate::query::Evaluation::FallbackRequired`].

use thiserror::Error;

/// Main error type for the star-tree index
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid index configuration (unknown dimension, malformed pair, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A raw value does not match the type declared for its column
    #[error("Type mismatch on column '{column}': expected {expected}, got {actual}")]
    TypeMismatch {
        /// Column the value belongs to
        column: String,
        /// Declared type
        expected: String,
        /// Observed type
        actual: String,
    },

    /// An exact aggregator left its representable range
    #[error("Overflow in {function} over column '{column}'")]
    Overflow {
        /// Aggregation function name
        function: String,
        /// Metric column
        column: String,
    },

    /// Two records with different group keys were merged
    #[error("Group key mismatch: expected {expected:?}, got {actual:?}")]
    KeyMismatch {
        /// Key of the record being merged into
        expected: Vec<u32>,
        /// Key of the incoming record
        actual: Vec<u32>,
    },

    /// The builder was driven out of its single-shot lifecycle
    #[error("Builder state error: {0}")]
    BuilderState(String),

    /// Two aggregator states of different kinds or parameters were combined
    #[error("Incompatible aggregator state: {0}")]
    IncompatibleState(String),

    /// Input rows do not fit the segment schema
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A serialized buffer could not be decoded
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The checksum stored in the header
        expected: u64,
        /// The checksum computed over the body
        actual: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Shorthand for a corrupted-buffer error
    pub fn corrupted(message: impl Into<String>) -> Self {
        Error::Corrupted(message.into())
    }

    /// Whether this error aborts a segment build (as opposed to a read fault)
    pub fn is_build_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::TypeMismatch { .. }
                | Error::Overflow { .. }
                | Error::KeyMismatch { .. }
                | Error::BuilderState(_)
                | Error::InvalidInput(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
