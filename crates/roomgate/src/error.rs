//! Error types for the dispatcher, and the unified Roomgate error.

use std::time::Duration;

use roomgate_protocol::{ErrorKind, FramingError, MessageType, ProtocolError, RoomId, RoomPhase};
use roomgate_room::RoomError;
use roomgate_session::{ClientError, SessionError};
use roomgate_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum RoomgateError {
    /// A transport-level error (bind, unknown connection).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (invalid room id).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A framing error (encode, decode).
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// A server-side session error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A client-side request error.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A room server error.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A room registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Starting a room server failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Errors from [`Registry`](crate::Registry) bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A live descriptor already exists for the room.
    #[error("room {0} already has a server")]
    AlreadyExists(RoomId),

    #[error("room {0} is not registered")]
    NotFound(RoomId),

    /// A spawn outcome arrived for a descriptor that no longer exists.
    #[error("stale spawn outcome for room {room_id} (generation {generation})")]
    StaleGeneration { room_id: RoomId, generation: u64 },

    #[error("room {room_id} cannot move from {from} to {to}")]
    InvalidTransition {
        room_id: RoomId,
        from: RoomPhase,
        to: RoomPhase,
    },
}

// ---------------------------------------------------------------------------
// Launching
// ---------------------------------------------------------------------------

/// A single failed attempt to start a room server.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The room process could not be started.
    #[error("failed to start room process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The process exited (or closed stdout) before announcing itself.
    #[error("room process exited before reporting its address")]
    NoReadyLine,

    /// The process printed something other than `READY <addr>`.
    #[error("unexpected readiness line {0:?}")]
    BadReadyLine(String),

    /// An in-process room server failed to bind.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// The control link could not be opened or broke during the handshake.
    #[error("control link i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The room server answered the handshake with something other than
    /// `ROOM_READY`.
    #[error("room rejected the handshake: {0}")]
    Rejected(String),

    /// The attempt took longer than the startup timeout.
    #[error("room did not become ready within {0:?}")]
    TimedOut(Duration),
}

/// All launch attempts for a room failed. Reported to every request
/// waiting on the room as `ERROR{RoomUnavailable}`.
#[derive(Debug, thiserror::Error)]
#[error("room {room_id} could not be started after {attempts} attempt(s): {last}")]
pub struct SpawnFailure {
    pub room_id: RoomId,
    pub attempts: u32,
    #[source]
    pub last: LaunchError,
}

// ---------------------------------------------------------------------------
// Per-request errors
// ---------------------------------------------------------------------------

/// Why the dispatcher refused a request. Sent back as `ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("send CONNECT first")]
    NotConnected,

    #[error("{0} is not handled by the dispatcher")]
    Unsupported(MessageType),

    /// The room exists but is being torn down.
    #[error("room {0} is closing, try again")]
    Closing(RoomId),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RequestError {
    /// The `ERROR` kind sent to the client for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected => ErrorKind::NotConnected,
            Self::Unsupported(_) => ErrorKind::Protocol,
            Self::Closing(_) => ErrorKind::RoomUnavailable,
            Self::Session(_) => ErrorKind::InvalidRequest,
            Self::Registry(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomgate_transport::ConnectionId;

    fn room(id: &str) -> RoomId {
        RoomId::new(id).unwrap()
    }

    #[test]
    fn test_from_transport_error() {
        let err: RoomgateError = TransportError::NotListening.into();
        assert!(matches!(err, RoomgateError::Transport(_)));
        assert_eq!(err.to_string(), "not listening");
    }

    #[test]
    fn test_from_protocol_error() {
        let err: RoomgateError = RoomId::new("").unwrap_err().into();
        assert!(matches!(err, RoomgateError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err: RoomgateError = SessionError::NotFound(ConnectionId::new(3)).into();
        assert!(matches!(err, RoomgateError::Session(_)));
    }

    #[test]
    fn test_from_registry_error() {
        let err: RoomgateError = RegistryError::NotFound(room("arena1")).into();
        assert!(matches!(err, RoomgateError::Registry(_)));
        assert!(err.to_string().contains("arena1"));
    }

    #[test]
    fn test_spawn_failure_message_names_room_and_cause() {
        let failure = SpawnFailure {
            room_id: room("arena1"),
            attempts: 3,
            last: LaunchError::NoReadyLine,
        };
        let text = failure.to_string();
        assert!(text.contains("arena1"));
        assert!(text.contains("3 attempt"));
        assert!(text.contains("before reporting"));
    }

    #[test]
    fn test_request_error_kinds() {
        assert_eq!(RequestError::NotConnected.kind(), ErrorKind::NotConnected);
        assert_eq!(
            RequestError::Unsupported(MessageType::Move).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            RequestError::Closing(room("arena1")).kind(),
            ErrorKind::RoomUnavailable
        );
    }
}
