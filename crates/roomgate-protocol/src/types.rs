//! Core protocol types for Roomgate's wire format.
//!
//! Everything in this module travels "on the wire": the dispatcher, the
//! room servers, and clients all speak in terms of these structures.
//!
//! A frame on the wire is `{ "request_id": .., "type": "..", "payload": .. }`.
//! The `type` string selects one variant of the closed [`Message`] enum,
//! and the payload is decoded by an exhaustive `match` over
//! [`MessageType`]. Adding a message type without teaching the codec how
//! to decode it is a compile error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::fmt;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A unique identifier for a client.
///
/// Assigned by the dispatcher on the first `CONNECT` and presented again
/// by the client to every room server it joins. `#[serde(transparent)]`
/// keeps it a plain number on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C-{}", self.0)
    }
}

/// Identifies one logical request within a client session.
///
/// A retry reuses the id of the original request; servers use the id to
/// recognise duplicates. Id `0` is reserved for unsolicited messages
/// (broadcasts and room status reports) that answer no request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// The id carried by messages that are not a response to anything.
    pub const UNSOLICITED: RequestId = RequestId(0);

    /// Returns `true` for the reserved unsolicited id.
    pub fn is_unsolicited(self) -> bool {
        self == Self::UNSOLICITED
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A room identifier such as `"arena1"`.
///
/// Room ids end up on a child process command line, so they are
/// restricted to ASCII letters, digits, `-` and `_`, 1–64 characters.
/// Validation runs during deserialization (`try_from = "String"`), so an
/// invalid id never reaches the dispatcher's registry.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Maximum length of a room id.
    pub const MAX_LEN: usize = 64;

    /// Validates and wraps a room id.
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ProtocolError::InvalidRoomId(id, "must not be empty"));
        }
        if id.len() > Self::MAX_LEN {
            return Err(ProtocolError::InvalidRoomId(id, "longer than 64 characters"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ProtocolError::InvalidRoomId(
                id,
                "only ASCII letters, digits, '-' and '_' are allowed",
            ));
        }
        Ok(Self(id))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// World types: positions, items, deltas
// ---------------------------------------------------------------------------

/// A tile coordinate inside a room.
///
/// Signed so that a client can *ask* for a negative tile; the room server
/// rejects it with a per-request error instead of the frame failing to
/// decode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chebyshev distance: how many king-moves apart two tiles are.
    pub fn distance(self, other: Position) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.x, self.y)
    }
}

/// One-tile movement directions. `Up` increases `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// The `(dx, dy)` step for this direction.
    pub fn offset(self) -> (i32, i32) {
        match self {
            Self::Up => (0, 1),
            Self::Down => (0, -1),
            Self::Left => (-1, 0),
            Self::Right => (1, 0),
        }
    }
}

/// The room edge a client walked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

/// Interactive items that can sit on a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Chest,
    Fire,
}

impl ItemKind {
    /// How many times a fresh item of this kind can be used.
    pub fn initial_uses(self) -> u32 {
        match self {
            Self::Chest => 10,
            Self::Fire => 5,
        }
    }
}

/// A client and where it stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedClient {
    pub client_id: ClientId,
    pub position: Position,
}

/// An item and how many uses it has left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedItem {
    pub position: Position,
    pub item: ItemKind,
    pub uses: u32,
}

/// The full state of a room, sent to a client when it joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub room_id: RoomId,
    /// Tiles run from `0` to `dimension` inclusive on both axes.
    pub dimension: i32,
    /// The world frame this snapshot was taken at.
    pub frame: u64,
    /// Clients currently attached to the room.
    pub clients: Vec<PlacedClient>,
    pub items: Vec<PlacedItem>,
}

/// One change to a room's world.
///
/// `#[serde(tag = "change")]` produces `{ "change": "client_moved", ... }`,
/// which lets a client apply deltas with a flat switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum WorldDelta {
    ClientJoined { client_id: ClientId, position: Position },
    ClientMoved { client_id: ClientId, position: Position },
    ClientLeft { client_id: ClientId },
    ItemChanged { position: Position, item: ItemKind, uses: u32 },
}

/// Broadcast to every attached client after the world changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub room_id: RoomId,
    /// Monotonic per-room frame counter; a gap means a missed update.
    pub frame: u64,
    pub changes: Vec<WorldDelta>,
}

/// What happened when a client interacted with a tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// The item gave something up.
    Used { item: ItemKind, remaining: u32 },
    /// The item has no uses left.
    Empty { item: ItemKind },
    /// Someone else emptied the item this round.
    Contended { item: ItemKind },
    /// No item, but other clients are standing on the tile.
    Bumped { clients: Vec<ClientId> },
    /// Nothing there at all.
    Nothing,
}

/// The successful result of a gameplay request or a leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Ack {
    Moved {
        position: Position,
        /// Set when the move bumped the left or right edge of the room.
        #[serde(default)]
        exit: Option<Side>,
    },
    Acted {
        outcome: ActionOutcome,
    },
    Left,
}

// ---------------------------------------------------------------------------
// Room listing and lifecycle
// ---------------------------------------------------------------------------

/// The lifecycle phase of a room as tracked by the dispatcher.
///
/// ```text
/// Spawning → Ready → Draining → Reclaimed
///     └───────────────────────────↗   (spawn failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RoomPhase {
    Spawning,
    Ready,
    Draining,
    Reclaimed,
}

impl RoomPhase {
    /// Returns `true` if moving from `self` to `target` is allowed.
    ///
    /// Transitions only ever move forward; nothing leaves `Reclaimed`.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Spawning, Self::Ready)
                | (Self::Spawning, Self::Reclaimed)
                | (Self::Ready, Self::Draining)
                | (Self::Draining, Self::Reclaimed)
        )
    }
}

impl fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawning => write!(f, "Spawning"),
            Self::Ready => write!(f, "Ready"),
            Self::Draining => write!(f, "Draining"),
            Self::Reclaimed => write!(f, "Reclaimed"),
        }
    }
}

/// A summary of a room returned by `LIST_ROOMS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomListEntry {
    pub room_id: RoomId,
    pub phase: RoomPhase,
    /// Clients attached to the room server, as last reported by it.
    pub clients: usize,
    /// The room server's port, once it is ready.
    #[serde(default)]
    pub port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `CONNECT`: the first message on every connection.
///
/// A client talking to the dispatcher for the first time omits
/// `client_id` and gets one assigned. Room servers require it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub client_id: Option<ClientId>,
}

/// `CONNECTED`: the answer to `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    pub client_id: ClientId,
    /// The dispatcher remembers the last room each client was sent to.
    #[serde(default)]
    pub last_room: Option<RoomId>,
    /// Room servers include the current world.
    #[serde(default)]
    pub snapshot: Option<WorldSnapshot>,
}

/// `CREATE_ROOM` / `JOIN_ROOM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub room_id: RoomId,
}

/// `ROOM_ASSIGNED`: where to find the room server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAssignment {
    pub room_id: RoomId,
    pub host: String,
    pub port: u16,
}

impl RoomAssignment {
    /// `host:port`, ready for `TcpStream::connect`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `ROOM_LIST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomList {
    pub rooms: Vec<RoomListEntry>,
}

/// `ACTION`: interact with a tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub target: Position,
}

/// `MOVE`: step one tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub direction: Direction,
}

/// `HEARTBEAT`: echoed back unchanged by servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub sent_at_ms: u64,
}

/// The category of an `ERROR` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    /// Unknown message type, bad payload, or a message this server does
    /// not handle.
    Protocol,
    /// A well-formed request that the game rules reject.
    InvalidRequest,
    /// A request arrived before `CONNECT`.
    NotConnected,
    /// The room server could not be started.
    RoomUnavailable,
    /// Something went wrong on the server's side.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Protocol => "Protocol",
            Self::InvalidRequest => "InvalidRequest",
            Self::NotConnected => "NotConnected",
            Self::RoomUnavailable => "RoomUnavailable",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// `ERROR` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// `ROOM_HANDSHAKE`: the dispatcher's readiness probe, sent on the
/// control link right after a room server starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomHandshake {
    pub room_id: RoomId,
}

/// `ROOM_READY`: the room server's answer to the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomReady {
    pub room_id: RoomId,
    pub clients: usize,
}

/// `ROOM_STATUS`: unsolicited occupancy report on the control link.
/// `idle` means the room has been empty for its whole grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStatus {
    pub room_id: RoomId,
    pub clients: usize,
    pub idle: bool,
}

// ---------------------------------------------------------------------------
// MessageType and Message
// ---------------------------------------------------------------------------

/// The closed set of message types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Connect,
    Connected,
    CreateRoom,
    JoinRoom,
    RoomAssigned,
    ListRooms,
    RoomList,
    LeaveRoom,
    Action,
    Move,
    Ack,
    StateUpdate,
    Heartbeat,
    Error,
    RoomHandshake,
    RoomReady,
    RoomStatus,
}

impl MessageType {
    /// Every message type, in wire-table order.
    pub const ALL: [MessageType; 17] = [
        Self::Connect,
        Self::Connected,
        Self::CreateRoom,
        Self::JoinRoom,
        Self::RoomAssigned,
        Self::ListRooms,
        Self::RoomList,
        Self::LeaveRoom,
        Self::Action,
        Self::Move,
        Self::Ack,
        Self::StateUpdate,
        Self::Heartbeat,
        Self::Error,
        Self::RoomHandshake,
        Self::RoomReady,
        Self::RoomStatus,
    ];

    /// The `type` string used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::CreateRoom => "CREATE_ROOM",
            Self::JoinRoom => "JOIN_ROOM",
            Self::RoomAssigned => "ROOM_ASSIGNED",
            Self::ListRooms => "LIST_ROOMS",
            Self::RoomList => "ROOM_LIST",
            Self::LeaveRoom => "LEAVE_ROOM",
            Self::Action => "ACTION",
            Self::Move => "MOVE",
            Self::Ack => "ACK",
            Self::StateUpdate => "STATE_UPDATE",
            Self::Heartbeat => "HEARTBEAT",
            Self::Error => "ERROR",
            Self::RoomHandshake => "ROOM_HANDSHAKE",
            Self::RoomReady => "ROOM_READY",
            Self::RoomStatus => "ROOM_STATUS",
        }
    }

    /// Parses a wire `type` string. Returns `None` for anything unknown.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every message a Roomgate peer can send, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect(ConnectRequest),
    Connected(Connected),
    CreateRoom(RoomRequest),
    JoinRoom(RoomRequest),
    RoomAssigned(RoomAssignment),
    ListRooms,
    RoomList(RoomList),
    LeaveRoom,
    Action(ActionRequest),
    Move(MoveRequest),
    Ack(Ack),
    StateUpdate(StateUpdate),
    Heartbeat(Heartbeat),
    Error(ErrorBody),
    RoomHandshake(RoomHandshake),
    RoomReady(RoomReady),
    RoomStatus(RoomStatus),
}

impl Message {
    /// Shorthand for an `ERROR` message.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error(ErrorBody {
            kind,
            message: message.into(),
        })
    }

    /// The wire type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Connect(_) => MessageType::Connect,
            Self::Connected(_) => MessageType::Connected,
            Self::CreateRoom(_) => MessageType::CreateRoom,
            Self::JoinRoom(_) => MessageType::JoinRoom,
            Self::RoomAssigned(_) => MessageType::RoomAssigned,
            Self::ListRooms => MessageType::ListRooms,
            Self::RoomList(_) => MessageType::RoomList,
            Self::LeaveRoom => MessageType::LeaveRoom,
            Self::Action(_) => MessageType::Action,
            Self::Move(_) => MessageType::Move,
            Self::Ack(_) => MessageType::Ack,
            Self::StateUpdate(_) => MessageType::StateUpdate,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::Error(_) => MessageType::Error,
            Self::RoomHandshake(_) => MessageType::RoomHandshake,
            Self::RoomReady(_) => MessageType::RoomReady,
            Self::RoomStatus(_) => MessageType::RoomStatus,
        }
    }

    /// Returns `true` for `ERROR` messages.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Serializes the payload half of the frame. Unit messages encode as
    /// `null`.
    pub fn encode_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Connect(p) => serde_json::to_value(p),
            Self::Connected(p) => serde_json::to_value(p),
            Self::CreateRoom(p) | Self::JoinRoom(p) => serde_json::to_value(p),
            Self::RoomAssigned(p) => serde_json::to_value(p),
            Self::ListRooms | Self::LeaveRoom => Ok(Value::Null),
            Self::RoomList(p) => serde_json::to_value(p),
            Self::Action(p) => serde_json::to_value(p),
            Self::Move(p) => serde_json::to_value(p),
            Self::Ack(p) => serde_json::to_value(p),
            Self::StateUpdate(p) => serde_json::to_value(p),
            Self::Heartbeat(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
            Self::RoomHandshake(p) => serde_json::to_value(p),
            Self::RoomReady(p) => serde_json::to_value(p),
            Self::RoomStatus(p) => serde_json::to_value(p),
        }
    }

    /// Decodes a payload for a known message type.
    ///
    /// Unit messages ignore whatever payload they carry. A missing payload
    /// (`null`) is accepted for `CONNECT` and `HEARTBEAT`, whose fields all
    /// have defaults.
    pub fn decode(kind: MessageType, payload: Value) -> Result<Self, serde_json::Error> {
        let payload = match (kind, payload) {
            (MessageType::Connect | MessageType::Heartbeat, Value::Null) => {
                Value::Object(serde_json::Map::new())
            }
            (_, payload) => payload,
        };
        Ok(match kind {
            MessageType::Connect => Self::Connect(serde_json::from_value(payload)?),
            MessageType::Connected => Self::Connected(serde_json::from_value(payload)?),
            MessageType::CreateRoom => Self::CreateRoom(serde_json::from_value(payload)?),
            MessageType::JoinRoom => Self::JoinRoom(serde_json::from_value(payload)?),
            MessageType::RoomAssigned => {
                Self::RoomAssigned(serde_json::from_value(payload)?)
            }
            MessageType::ListRooms => Self::ListRooms,
            MessageType::RoomList => Self::RoomList(serde_json::from_value(payload)?),
            MessageType::LeaveRoom => Self::LeaveRoom,
            MessageType::Action => Self::Action(serde_json::from_value(payload)?),
            MessageType::Move => Self::Move(serde_json::from_value(payload)?),
            MessageType::Ack => Self::Ack(serde_json::from_value(payload)?),
            MessageType::StateUpdate => Self::StateUpdate(serde_json::from_value(payload)?),
            MessageType::Heartbeat => Self::Heartbeat(serde_json::from_value(payload)?),
            MessageType::Error => Self::Error(serde_json::from_value(payload)?),
            MessageType::RoomHandshake => {
                Self::RoomHandshake(serde_json::from_value(payload)?)
            }
            MessageType::RoomReady => Self::RoomReady(serde_json::from_value(payload)?),
            MessageType::RoomStatus => Self::RoomStatus(serde_json::from_value(payload)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One unit of the wire protocol: a message plus the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: RequestId,
    pub message: Message,
}

impl Frame {
    pub fn new(request_id: RequestId, message: Message) -> Self {
        Self {
            request_id,
            message,
        }
    }

    /// A frame that answers no request (broadcasts, status reports).
    pub fn unsolicited(message: Message) -> Self {
        Self::new(RequestId::UNSOLICITED, message)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! These tests pin the JSON shapes that clients depend on.

    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::new(id).unwrap()
    }

    // =====================================================================
    // Identity types
    // =====================================================================

    #[test]
    fn test_client_id_serializes_as_plain_number() {
        assert_eq!(serde_json::to_string(&ClientId(42)).unwrap(), "42");
        assert_eq!(ClientId(7).to_string(), "C-7");
    }

    #[test]
    fn test_request_id_zero_is_unsolicited() {
        assert!(RequestId(0).is_unsolicited());
        assert!(!RequestId(1).is_unsolicited());
    }

    #[test]
    fn test_room_id_accepts_simple_names() {
        assert_eq!(room("arena1").as_str(), "arena1");
        assert_eq!(room("cave_2-b").to_string(), "cave_2-b");
    }

    #[test]
    fn test_room_id_rejects_empty_long_and_odd_characters() {
        assert!(RoomId::new("").is_err());
        assert!(RoomId::new("a".repeat(65)).is_err());
        assert!(RoomId::new("arena 1").is_err());
        assert!(RoomId::new("../etc").is_err());
    }

    #[test]
    fn test_room_id_deserialize_validates() {
        let ok: RoomId = serde_json::from_str("\"arena1\"").unwrap();
        assert_eq!(ok, room("arena1"));
        let bad: Result<RoomId, _> = serde_json::from_str("\"no spaces\"");
        assert!(bad.is_err());
    }

    // =====================================================================
    // World types
    // =====================================================================

    #[test]
    fn test_position_distance_is_chebyshev() {
        let a = Position::new(2, 2);
        assert_eq!(a.distance(Position::new(1, 1)), 1);
        assert_eq!(a.distance(Position::new(2, 2)), 0);
        assert_eq!(a.distance(Position::new(5, 3)), 3);
    }

    #[test]
    fn test_direction_offsets() {
        assert_eq!(Direction::Up.offset(), (0, 1));
        assert_eq!(Direction::Down.offset(), (0, -1));
        assert_eq!(Direction::Left.offset(), (-1, 0));
        assert_eq!(Direction::Right.offset(), (1, 0));
    }

    #[test]
    fn test_world_delta_json_format() {
        let delta = WorldDelta::ClientMoved {
            client_id: ClientId(3),
            position: Position::new(4, 5),
        };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["change"], "client_moved");
        assert_eq!(json["client_id"], 3);
        assert_eq!(json["position"]["x"], 4);
    }

    #[test]
    fn test_ack_acted_json_format() {
        let ack = Ack::Acted {
            outcome: ActionOutcome::Used {
                item: ItemKind::Chest,
                remaining: 9,
            },
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["result"], "acted");
        assert_eq!(json["outcome"]["kind"], "used");
        assert_eq!(json["outcome"]["item"], "chest");
        assert_eq!(json["outcome"]["remaining"], 9);
    }

    #[test]
    fn test_ack_moved_without_exit_defaults_to_none() {
        let json = r#"{"result": "moved", "position": {"x": 1, "y": 2}}"#;
        let ack: Ack = serde_json::from_str(json).unwrap();
        assert_eq!(
            ack,
            Ack::Moved {
                position: Position::new(1, 2),
                exit: None
            }
        );
    }

    // =====================================================================
    // RoomPhase
    // =====================================================================

    #[test]
    fn test_room_phase_transitions_only_move_forward() {
        use RoomPhase::*;
        assert!(Spawning.can_transition_to(Ready));
        assert!(Spawning.can_transition_to(Reclaimed));
        assert!(Ready.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Reclaimed));

        assert!(!Ready.can_transition_to(Spawning));
        assert!(!Ready.can_transition_to(Reclaimed));
        assert!(!Draining.can_transition_to(Ready));
        assert!(!Reclaimed.can_transition_to(Spawning));
        assert!(!Reclaimed.can_transition_to(Ready));
    }

    // =====================================================================
    // MessageType / Message
    // =====================================================================

    #[test]
    fn test_message_type_wire_names_round_trip() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::from_wire("FLY_TO_MOON"), None);
        assert_eq!(MessageType::from_wire("join_room"), None);
    }

    #[test]
    fn test_message_type_matches_variant() {
        let msg = Message::JoinRoom(RoomRequest {
            room_id: room("arena1"),
        });
        assert_eq!(msg.message_type(), MessageType::JoinRoom);
        assert_eq!(Message::LeaveRoom.message_type(), MessageType::LeaveRoom);
    }

    #[test]
    fn test_unit_messages_encode_as_null_and_ignore_payload() {
        assert_eq!(Message::LeaveRoom.encode_payload().unwrap(), Value::Null);
        let decoded =
            Message::decode(MessageType::ListRooms, serde_json::json!({"junk": 1})).unwrap();
        assert_eq!(decoded, Message::ListRooms);
    }

    #[test]
    fn test_connect_accepts_missing_payload() {
        let decoded = Message::decode(MessageType::Connect, Value::Null).unwrap();
        assert_eq!(decoded, Message::Connect(ConnectRequest { client_id: None }));
    }

    #[test]
    fn test_move_with_unknown_direction_fails_to_decode() {
        let result = Message::decode(
            MessageType::Move,
            serde_json::json!({"direction": "sideways"}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_error_kind_serializes_as_pascal_case() {
        let json = serde_json::to_string(&ErrorKind::RoomUnavailable).unwrap();
        assert_eq!(json, "\"RoomUnavailable\"");
    }
}
