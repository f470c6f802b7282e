// Error taxonomy for the delivery core

use thiserror::Error;

/// Errors raised by the relay core
///
/// Validation errors (`InvalidPair`, `InvalidMessage`, `Unauthorized`) are
/// raised before anything touches the store or the registry fan-out.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A user tried to open a channel with themselves
    #[error("invalid pair: user {0} cannot open a channel with themselves")]
    InvalidPair(u64),

    /// Empty, oversized or otherwise malformed message
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Missing, malformed or expired identity
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The connection already has a session
    #[error("connection {0} is already registered")]
    DuplicateConnection(String),

    /// The session is not (or no longer) registered
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The message store is unreachable or rejected the operation
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A frame the caller depends on could not be queued to its connection
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl RelayError {
    /// Stable identifier used in `error` frames on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidPair(_) => "invalid_pair",
            RelayError::InvalidMessage(_) => "invalid_message",
            RelayError::Unauthorized(_) => "unauthorized",
            RelayError::DuplicateConnection(_) => "duplicate_connection",
            RelayError::UnknownSession(_) => "unknown_session",
            RelayError::Persistence(_) => "persistence",
            RelayError::Delivery(_) => "delivery",
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Persistence(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RelayError {
    fn from(err: tokio::task::JoinError) -> Self {
        RelayError::Persistence(format!("store task failed: {}", err))
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
