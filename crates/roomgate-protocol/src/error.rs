//! Error types for the protocol layer.
//!
//! Two enums live here. [`ProtocolError`] covers values that are invalid
//! in themselves (a bad room id). [`FramingError`] covers the byte stream:
//! some framing errors poison the whole connection, others only spoil a
//! single request. [`FramingError::is_fatal`] tells them apart.

use crate::types::{MessageType, RequestId};

/// Errors in protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A room id failed validation. Carries the rejected id and the rule
    /// it broke.
    #[error("invalid room id {0:?}: {1}")]
    InvalidRoomId(String, &'static str),
}

/// Errors while turning bytes into frames or frames into bytes.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// The length prefix (or an outgoing body) exceeds the frame limit.
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    Oversized { len: usize, max: usize },

    /// The body is not a JSON object with `request_id`, `type` and
    /// `payload`. There is no request id to answer, so the stream cannot
    /// be trusted any further.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The `type` string is not one we know.
    #[error("unknown message type {message_type:?} in request {request_id}")]
    UnknownMessageType {
        request_id: RequestId,
        message_type: String,
    },

    /// The type is known but its payload does not decode.
    #[error("invalid {message_type} payload in request {request_id}: {source}")]
    InvalidPayload {
        request_id: RequestId,
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },

    /// Serializing an outgoing frame failed.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

impl FramingError {
    /// Returns `true` if the connection must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Oversized { .. } | Self::Malformed(_) | Self::Encode(_)
        )
    }

    /// The request this error belongs to, for recoverable errors.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::UnknownMessageType { request_id, .. }
            | Self::InvalidPayload { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}
