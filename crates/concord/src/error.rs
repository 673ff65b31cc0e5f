//! Error types for the consistency core.

use crate::config::ConfigError;
use crate::jupiter::JupiterError;
use crate::message::CodecError;
use crate::session::SessionError;
use text_ot::OtError;
use thiserror::Error;

/// Result type alias for consistency core operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Any error the consistency core can return to its caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// An operation does not fit the document it was applied to.
    #[error(transparent)]
    Ot(#[from] OtError),

    #[error(transparent)]
    Jupiter(#[from] JupiterError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The session task has stopped and no longer accepts commands.
    #[error("session runtime has stopped")]
    RuntimeClosed,
}
