//! Error types for session and control operations

use std::time::Duration;

use thiserror::Error;

use crate::protocol::ServerError;
use crate::session::Phase;
use crate::subscription::TableId;
use crate::transport::TransportError;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Why a stream connection stopped delivering lines
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// The server closed the connection without closing the session
    #[error("stream ended")]
    EndOfStream,

    /// No line (not even a heartbeat) within the liveness timeout
    #[error("no data for {0:?}")]
    Stalled(Duration),

    /// The transport failed
    #[error("transport failure: {0}")]
    Transport(TransportError),

    /// A line grew past the configured maximum length
    #[error("line longer than {0} bytes")]
    LineTooLong(usize),
}

/// Errors that end a session or prevent one from starting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The server rejected the create request
    #[error("Session creation rejected: {0}")]
    CreationRejected(ServerError),

    /// The server rejected a bind request (e.g. unknown session)
    #[error("Bind rejected: {0}")]
    BindRejected(ServerError),

    /// The server reported an error the session cannot survive
    #[error("Fatal server error: {0}")]
    Fatal(ServerError),

    /// The create/bind response was not a valid session header
    #[error("Invalid handshake response: {0}")]
    Handshake(String),

    /// Transport failure while opening a connection
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The stream was interrupted and rebinding is disabled
    #[error("Stream interrupted: {0}")]
    Interrupted(StreamFault),

    /// Every allowed rebind attempt failed
    #[error("Rebind failed after {attempts} attempt(s); last cause: {last_cause}")]
    RebindExhausted {
        attempts: u32,
        last_cause: Box<SessionError>,
    },

    /// The operation is not valid in the current phase
    #[error("Operation not allowed while {0}")]
    InvalidState(Phase),

    /// `disconnect()` was called while the operation was in progress
    #[error("Session closed by disconnect")]
    Cancelled,

    /// The create/bind handshake did not complete in time
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
}

impl SessionError {
    /// Server-provided code and message, when the error came from the server
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::CreationRejected(e) | Self::BindRejected(e) | Self::Fatal(e) => Some(e),
            Self::RebindExhausted { last_cause, .. } => last_cause.server_error(),
            _ => None,
        }
    }
}

/// Errors of a single control request
///
/// Reported to the caller of that request only; they never change the state
/// of the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// There is no bound session to send the request for
    #[error("No active session")]
    NoSession,

    /// The table is not one of the session's subscriptions
    #[error("Unknown table {0}")]
    UnknownTable(TableId),

    /// Network failure on the control exchange
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server refused the request
    #[error("Control request rejected: {0}")]
    Rejected(ServerError),

    /// The response body was neither `OK` nor an error line
    #[error("Unexpected control response: {0:?}")]
    UnexpectedResponse(String),

    /// No response within the control timeout
    #[error("Control request timed out after {0:?}")]
    Timeout(Duration),
}
