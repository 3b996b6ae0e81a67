//! The error kinds callers can match on.
//!
//! Glue code and the CLI wrap these in [`anyhow::Error`] freely;
//! the core returns them typed so a caller can tell a missing blob
//! from a corrupt one without string-matching.

use crate::mac::Mac;
use crate::resource::ResourceType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("corrupt resource: {0}")]
    Corrupt(String),

    #[error("repository in use: {0}")]
    InUse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    pub fn blob_not_found(kind: ResourceType, mac: &Mac) -> Self {
        Error::NotFound(format!("{kind} blob {mac}"))
    }

    /// Cancellation must never masquerade as I/O or anything else.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Did this `anyhow` chain start with a cooperative cancellation?
pub fn was_canceled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<Error>(), Some(Error::Canceled)))
}
