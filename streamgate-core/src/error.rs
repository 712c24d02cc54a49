use thiserror::Error;

use crate::upstream::UpstreamError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No workers available")]
    NoWorkers,

    #[error("Upstream error: {0}")]
    Upstream(UpstreamError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<UpstreamError> for Error {
    fn from(err: UpstreamError) -> Self {
        match err {
            // "Not found" style upstream conditions terminate retry chains and
            // surface as 404, so they are promoted out of the upstream bucket.
            UpstreamError::NotFound => Self::NotFound("message not found in channel".to_string()),
            UpstreamError::Deleted => {
                Self::NotFound("message was deleted or is not accessible".to_string())
            }
            other => Self::Upstream(other),
        }
    }
}

impl Error {
    /// Hard failures stop worker retry loops immediately instead of being
    /// retried against another account.
    #[must_use]
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::InvalidInput(_))
    }

    /// Whether the error is the recoverable mid-stream reference expiry.
    #[must_use]
    pub fn is_reference_expired(&self) -> bool {
        matches!(self, Self::Upstream(UpstreamError::ReferenceExpired))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
