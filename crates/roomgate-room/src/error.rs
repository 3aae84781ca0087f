//! Error types for the room layer.

use roomgate_protocol::{ClientId, ErrorKind, MessageType, Position, RoomId};
use roomgate_session::SessionError;
use roomgate_transport::TransportError;

/// Errors that can occur in a room server.
///
/// Most variants describe a rejected request and become a per-request
/// `ERROR` on the wire; [`RoomError::kind`] picks the wire category.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The target tile is outside the grid.
    #[error("position {0} is outside the room")]
    OutOfBounds(Position),

    /// The target tile is more than one tile away from the actor.
    #[error("position {target} is out of reach from {from}")]
    OutOfReach { from: Position, target: Position },

    /// The client is not in the room.
    #[error("client {0} has not joined this room")]
    NotJoined(ClientId),

    /// A gameplay request arrived before `CONNECT`.
    #[error("send CONNECT first")]
    NotConnected,

    /// Room servers only accept clients the dispatcher has identified.
    #[error("CONNECT to a room server must carry a client id")]
    ClientIdRequired,

    /// The handshake named a different room.
    #[error("this server hosts room {hosted}, not {requested}")]
    WrongRoom { hosted: RoomId, requested: RoomId },

    /// The message type is not handled by room servers.
    #[error("{0} is not handled by room servers")]
    Unsupported(MessageType),

    /// The room is shutting down.
    #[error("room {0} is closing")]
    Draining(RoomId),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RoomError {
    /// The `ERROR` kind sent to the client for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfBounds(_)
            | Self::OutOfReach { .. }
            | Self::NotJoined(_)
            | Self::ClientIdRequired
            | Self::WrongRoom { .. }
            | Self::Session(_) => ErrorKind::InvalidRequest,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::Unsupported(_) => ErrorKind::Protocol,
            Self::Draining(_) => ErrorKind::RoomUnavailable,
            Self::Transport(_) => ErrorKind::Internal,
        }
    }
}
