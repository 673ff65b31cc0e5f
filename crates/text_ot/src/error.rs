//! Error types for the text operation crate.

use thiserror::Error;

/// Result type alias for operations on text.
pub type OtResult<T> = Result<T, OtError>;

/// Errors raised when an operation does not fit the document it is applied to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// The operation addresses a position past the end of the document.
    #[error("Offset {offset} is out of bounds for a document of length {len}")]
    OffsetOutOfBounds { offset: usize, len: usize },

    /// A delete names text that is not what the document holds at that position.
    #[error("Delete at {offset} expected {expected:?} but the document holds {found:?}")]
    ContentMismatch {
        offset: usize,
        expected: String,
        found: String,
    },
}
