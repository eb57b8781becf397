use thiserror::Error;

use crate::aggregate::AggregateError;

/// Driver-level error taxonomy.
///
/// The first four variants mirror the failure classes of the wire protocol:
/// connection failures are fatal to the call that observed them,
/// authorization and file errors are per-request and leave the driver usable.
#[derive(Error, Debug)]
pub enum Error {
    /// The handshake did not complete within its deadline, or the session
    /// never reached open state.
    #[error("failed connection: {0}")]
    FailedConnection(String),

    /// The server rejected the authorization token, or a request could not
    /// be correlated to a response within its bound.
    #[error("failed authorization: {0}")]
    FailedAuthorization(String),

    /// A delete or drop request failed for a non-authorization reason.
    #[error("file deletion: {0}")]
    FileDeletion(String),

    /// An add, update, revert or get request failed for a non-authorization
    /// reason.
    #[error("file modification: {0}")]
    FileModification(String),

    /// The driver has been shut down; no further requests are admitted.
    #[error("the driver is inactive, it has been shut down")]
    Inactive,

    #[error("aggregate error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

pub type DriverResult<T> = Result<T, Error>;

impl Error {
    /// Whether this error still leaves the driver usable for further
    /// requests.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Inactive)
    }
}
