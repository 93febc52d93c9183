use thiserror::Error;

use crate::hub::SessionId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Connection-level failure. A clean close by the peer is reported as
/// [`TransportError::Closed`] so callers can tell it apart from I/O trouble.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport failure: {0}")]
    Io(#[source] BoxError),
    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    pub fn io(err: impl Into<BoxError>) -> Self {
        Self::Io(err.into())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated frame: {0}")]
    Truncated(#[source] serde_json::Error),
    #[error("malformed frame: {0}")]
    Invalid(#[source] serde_json::Error),
    #[error("frame has an empty nick")]
    EmptyNick,
}

/// Anything that can go wrong while waiting for the next inbound message.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("session {0} is already registered")]
pub struct RegistryConflict(pub SessionId);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("hub is no longer running")]
pub struct HubClosed;

/// Failure to register a session with the hub.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error(transparent)]
    Conflict(#[from] RegistryConflict),
    #[error(transparent)]
    Closed(#[from] HubClosed),
}

/// Why a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    #[error("delivery failed: {0}")]
    Send(#[source] TransportError),
    #[error("registration failed: {0}")]
    Join(#[from] JoinError),
    #[error(transparent)]
    HubClosed(#[from] HubClosed),
}
