//! The `error` module defines the error taxonomy shared by every layer of
//! `pubstash`.
//!
//! Construction and single-entity failures surface to the immediate caller
//! through [`Result`]. Bulk reads (listing, eviction) log and skip the
//! offending item instead of returning one of these.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required field was missing or blank when building a message.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A single-key read produced data that no longer decodes.
    #[error("corrupt entry at '{key}': {reason}")]
    Corruption { key: String, reason: String },

    /// The broker reported that a send did not complete.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Broker-side rejection of a consumer operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// A store transaction lost too many races against concurrent writers.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// True for errors caused by the payload itself, which retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::Serialization(_) | Error::Corruption { .. }
        )
    }
}
