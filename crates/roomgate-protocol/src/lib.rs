//! Wire protocol for Roomgate.
//!
//! This crate defines the "language" that clients, the dispatcher, and
//! room servers speak:
//!
//! - **Types** ([`Message`], [`Frame`], [`ClientId`], [`RoomId`], ...):
//!   the structures that travel on the wire.
//! - **Codec** ([`encode_frame`], [`FrameDecoder`]): the 4-byte
//!   length-prefixed JSON framing used on every TCP connection.
//! - **Errors** ([`ProtocolError`], [`FramingError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → Session / Room / Dispatcher
//! ```
//!
//! The protocol layer knows nothing about sockets. It turns bytes into
//! frames and back.

mod codec;
mod error;
mod types;

pub use codec::{DEFAULT_MAX_FRAME_LEN, FrameDecoder, Frames, LENGTH_PREFIX_LEN, encode_frame};
pub use error::{FramingError, ProtocolError};
pub use types::{
    Ack, ActionOutcome, ActionRequest, ClientId, ConnectRequest, Connected, Direction,
    ErrorBody, ErrorKind, Frame, Heartbeat, ItemKind, Message, MessageType, MoveRequest,
    PlacedClient, PlacedItem, Position, RequestId, RoomAssignment, RoomHandshake, RoomId,
    RoomList, RoomListEntry, RoomPhase, RoomReady, RoomRequest, RoomStatus, Side,
    StateUpdate, WorldDelta, WorldSnapshot,
};
