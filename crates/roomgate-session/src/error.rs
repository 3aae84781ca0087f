//! Error types for the session layer.

use roomgate_protocol::{ClientId, ErrorKind, FramingError, MessageType, RequestId};
use roomgate_transport::ConnectionId;

/// Errors from server-side session bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session exists for the connection. It was never opened, or it
    /// was closed or displaced.
    #[error("no session for {0}")]
    NotFound(ConnectionId),

    /// The connection has not sent `CONNECT` yet.
    #[error("{0} has not identified itself")]
    NotIdentified(ConnectionId),

    /// The connection already carries a different client id.
    #[error("{connection} is already bound to client {client_id}")]
    AlreadyIdentified {
        connection: ConnectionId,
        client_id: ClientId,
    },

    /// Every assignable client id has been handed out.
    #[error("no client ids left to assign")]
    ClientIdsExhausted,
}

/// Errors seen by a [`RequestClient`](crate::RequestClient).
///
/// `RequestTimedOut` (nobody answered) is deliberately distinct from
/// `Server` (somebody answered with `ERROR`).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The server closed the connection while a response was pending.
    #[error("server closed the connection")]
    Disconnected,

    /// No response after every retry.
    #[error("request {request_id} timed out after {attempts} attempts")]
    RequestTimedOut {
        request_id: RequestId,
        attempts: u32,
    },

    /// The server answered with `ERROR`.
    #[error("server error {kind}: {message}")]
    Server { kind: ErrorKind, message: String },

    /// The server answered with the wrong message type.
    #[error("expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: MessageType,
        got: MessageType,
    },
}

impl ClientError {
    /// The wire error kind, for `ERROR` responses.
    pub fn server_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Server { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
