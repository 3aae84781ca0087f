//! Length-prefixed framing for Roomgate messages.
//!
//! TCP is a byte stream: one `read()` can return half a frame, or three
//! frames and the start of a fourth. Every frame on the wire is therefore
//! prefixed with its length:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ len: u32 BE  │ JSON body: {"request_id", "type", "payload"} │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! [`FrameDecoder`] owns the receive buffer for one connection. Bytes are
//! appended as they arrive, and [`FrameDecoder::next_frame`] hands back
//! complete frames one at a time, leaving any partial tail in place for
//! the next read.
//!
//! Decoding happens in two stages. The body is first parsed into a loose
//! `WireIn` (request id, type string, untyped payload); only then is the
//! type string resolved against [`MessageType`] and the payload decoded.
//! This lets a server answer an unknown type or a bad payload with an
//! `ERROR` for that request id, instead of dropping the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::FramingError;
use crate::types::{Frame, Message, MessageType, RequestId};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on a frame body. A peer announcing anything larger
/// is treated as corrupt.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Serialize)]
struct WireOut<'a> {
    request_id: RequestId,
    #[serde(rename = "type")]
    message_type: &'a str,
    payload: Value,
}

#[derive(Deserialize)]
struct WireIn {
    request_id: RequestId,
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    payload: Value,
}

/// Encodes a frame into its length-prefixed wire form.
///
/// # Errors
/// [`FramingError::Encode`] if serialization fails, and
/// [`FramingError::Oversized`] if the body is larger than `max_frame_len`.
pub fn encode_frame(frame: &Frame, max_frame_len: usize) -> Result<Bytes, FramingError> {
    let payload = frame.message.encode_payload().map_err(FramingError::Encode)?;
    let body = serde_json::to_vec(&WireOut {
        request_id: frame.request_id,
        message_type: frame.message.message_type().as_str(),
        payload,
    })
    .map_err(FramingError::Encode)?;

    if body.len() > max_frame_len {
        return Err(FramingError::Oversized {
            len: body.len(),
            max: max_frame_len,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    // Cannot truncate: max_frame_len is far below u32::MAX in practice,
    // and body.len() <= max_frame_len.
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Per-connection receive buffer that splits a byte stream into frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_len,
        }
    }

    /// The underlying buffer, for `read_buf`-style reads straight into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Appends received bytes.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if a partial frame is waiting for more bytes.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Pulls the next complete frame out of the buffer.
    ///
    /// - `Ok(None)`: more bytes are needed.
    /// - `Err(e)` with `e.is_fatal()`: the stream is corrupt. The buffer
    ///   is left as is and the connection should be closed.
    /// - `Err(e)` otherwise: one frame was unusable, its bytes have been
    ///   consumed, and decoding can continue.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_len {
            return Err(FramingError::Oversized {
                len,
                max: self.max_frame_len,
            });
        }

        let total = LENGTH_PREFIX_LEN + len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_LEN);
        let body = self.buf.split_to(len);
        decode_body(&body).map(Some)
    }

    /// Iterates over every complete frame currently buffered.
    ///
    /// The iterator stops after the first fatal error.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            done: false,
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

/// Iterator returned by [`FrameDecoder::frames`].
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.done = e.is_fatal();
                Some(Err(e))
            }
        }
    }
}

fn decode_body(body: &[u8]) -> Result<Frame, FramingError> {
    let wire: WireIn = serde_json::from_slice(body).map_err(FramingError::Malformed)?;

    let Some(kind) = MessageType::from_wire(&wire.message_type) else {
        return Err(FramingError::UnknownMessageType {
            request_id: wire.request_id,
            message_type: wire.message_type,
        });
    };

    let message =
        Message::decode(kind, wire.payload).map_err(|source| FramingError::InvalidPayload {
            request_id: wire.request_id,
            message_type: kind,
            source,
        })?;

    Ok(Frame::new(wire.request_id, message))
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, MoveRequest, RoomId, RoomRequest};

    fn join(id: u64, room: &str) -> Frame {
        Frame::new(
            RequestId(id),
            Message::JoinRoom(RoomRequest {
                room_id: RoomId::new(room).unwrap(),
            }),
        )
    }

    /// Builds a raw frame from an arbitrary JSON body.
    fn raw(body: &str) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body.as_bytes());
        out
    }

    // =====================================================================
    // Encoding
    // =====================================================================

    #[test]
    fn test_encode_frame_writes_big_endian_length_prefix() {
        let bytes = encode_frame(&join(1, "arena1"), DEFAULT_MAX_FRAME_LEN).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - LENGTH_PREFIX_LEN);

        let body: Value = serde_json::from_slice(&bytes[LENGTH_PREFIX_LEN..]).unwrap();
        assert_eq!(body["request_id"], 1);
        assert_eq!(body["type"], "JOIN_ROOM");
        assert_eq!(body["payload"]["room_id"], "arena1");
    }

    #[test]
    fn test_encode_frame_rejects_oversized_body() {
        let result = encode_frame(&join(1, "arena1"), 8);
        assert!(matches!(result, Err(FramingError::Oversized { max: 8, .. })));
    }

    // =====================================================================
    // Decoding: partial reads and coalesced frames
    // =====================================================================

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let bytes = encode_frame(&join(1, "arena1"), DEFAULT_MAX_FRAME_LEN).unwrap();
        let mut decoder = FrameDecoder::default();

        // Byte at a time: nothing until the final byte lands.
        for b in &bytes[..bytes.len() - 1] {
            decoder.extend_from_slice(&[*b]);
            assert!(decoder.next_frame().unwrap().is_none());
        }
        assert!(decoder.has_partial());

        decoder.extend_from_slice(&bytes[bytes.len() - 1..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(join(1, "arena1")));
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_decoder_splits_coalesced_frames_in_order() {
        let mut decoder = FrameDecoder::default();
        for id in 1..=3 {
            let bytes = encode_frame(&join(id, "arena1"), DEFAULT_MAX_FRAME_LEN).unwrap();
            decoder.extend_from_slice(&bytes);
        }
        // And half of a fourth.
        let fourth = encode_frame(&join(4, "arena1"), DEFAULT_MAX_FRAME_LEN).unwrap();
        decoder.extend_from_slice(&fourth[..6]);

        let ids: Vec<u64> = decoder
            .frames()
            .map(|f| f.unwrap().request_id.0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(decoder.buffered_len(), 6);
    }

    // =====================================================================
    // Decoding: errors
    // =====================================================================

    #[test]
    fn test_decoder_oversized_prefix_is_fatal() {
        let mut decoder = FrameDecoder::new(16);
        decoder.extend_from_slice(&1000u32.to_be_bytes());

        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, FramingError::Oversized { len: 1000, max: 16 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decoder_malformed_json_is_fatal() {
        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(&raw("{not json"));

        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, FramingError::Malformed(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decoder_unknown_type_is_recoverable() {
        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(&raw(r#"{"request_id": 9, "type": "FLY", "payload": {}}"#));
        decoder.extend_from_slice(
            &encode_frame(&join(10, "arena1"), DEFAULT_MAX_FRAME_LEN).unwrap(),
        );

        let err = decoder.next_frame().unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.request_id(), Some(RequestId(9)));

        // The bad frame was consumed; the next one decodes normally.
        assert_eq!(decoder.next_frame().unwrap(), Some(join(10, "arena1")));
    }

    #[test]
    fn test_decoder_invalid_payload_is_recoverable() {
        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(&raw(
            r#"{"request_id": 4, "type": "MOVE", "payload": {"direction": "north"}}"#,
        ));

        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(
            err,
            FramingError::InvalidPayload {
                message_type: MessageType::Move,
                ..
            }
        ));
        assert_eq!(err.request_id(), Some(RequestId(4)));
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_frames_iterator_stops_after_fatal_error() {
        let mut decoder = FrameDecoder::default();
        decoder.extend_from_slice(
            &encode_frame(
                &Frame::new(
                    RequestId(1),
                    Message::Move(MoveRequest {
                        direction: Direction::Up,
                    }),
                ),
                DEFAULT_MAX_FRAME_LEN,
            )
            .unwrap(),
        );
        decoder.extend_from_slice(&raw("]]]"));

        let results: Vec<_> = decoder.frames().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_fatal());
    }
}
