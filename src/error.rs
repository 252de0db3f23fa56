use thiserror::Error;

use crate::store::SinkError;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure mode of the security core. Each variant is a security
/// invariant violation or an unavailable collaborator, never a generic
/// catch-all: downstream anomaly detection relies on the distinction.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid credential token")]
    InvalidCredential,
    #[error("Expired credential token")]
    ExpiredCredential,
    #[error("Invalid one-time code")]
    InvalidCode,
    #[error("One-time code attempt limit exceeded")]
    CodeAttemptsExceeded,
    #[error("A ballot has already been cast by this voter in this election")]
    DuplicateVote,
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("No identity found for identifier \"{0}\"")]
    UnknownIdentity(String),
    #[error("Durable storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<SinkError> for Error {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Duplicate => Self::DuplicateVote,
            SinkError::Unavailable(msg) => Self::StorageUnavailable(msg),
        }
    }
}
