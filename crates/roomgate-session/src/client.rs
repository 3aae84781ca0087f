//! A request/response client over one framed TCP connection.
//!
//! [`RequestClient`] is what a player (or a test) uses to talk to the
//! dispatcher and to room servers. It implements the client half of the
//! retry protocol:
//!
//! 1. Send a request with a fresh id and remember the encoded bytes.
//! 2. Wait for a frame carrying that id, up to the retry timeout.
//! 3. On timeout, resend the identical bytes. After `max_retries`
//!    resends, fail with [`ClientError::RequestTimedOut`].
//!
//! While waiting, unsolicited `STATE_UPDATE` broadcasts are buffered for
//! the caller, and responses to ids the client no longer waits for are
//! discarded.

use std::collections::VecDeque;
use std::time::Duration;

use roomgate_protocol::{
    Ack, ActionOutcome, ActionRequest, ClientId, ConnectRequest, Connected,
    DEFAULT_MAX_FRAME_LEN, Direction, Frame, FrameDecoder, Heartbeat, Message, MessageType,
    MoveRequest, Position, RequestId, RoomAssignment, RoomId, RoomListEntry, RoomRequest,
    StateUpdate, encode_frame,
};
use roomgate_transport::is_transient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::{ClientError, RetryDecision, RetryPolicy, RetryTracker};

/// A connected client.
pub struct RequestClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    tracker: RetryTracker,
    next_request_id: u64,
    updates: VecDeque<StateUpdate>,
    max_frame_len: usize,
}

impl RequestClient {
    /// Connects with the given retry policy.
    pub async fn connect(addr: &str, policy: RetryPolicy) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true).map_err(ClientError::Io)?;
        tracing::debug!(addr, "client connected");
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(DEFAULT_MAX_FRAME_LEN),
            tracker: RetryTracker::new(policy),
            next_request_id: 1,
            updates: VecDeque::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    /// Allocates the next request id. Ids start at 1; 0 is reserved.
    pub fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.tracker.policy()
    }

    /// Sends a request with a fresh id and waits for its response.
    ///
    /// `ERROR` responses become [`ClientError::Server`].
    pub async fn request(&mut self, message: Message) -> Result<Message, ClientError> {
        let id = self.next_request_id();
        self.request_with_id(id, message).await
    }

    /// Sends a request under a caller-chosen id.
    ///
    /// Reusing an id that the server has already answered gets the cached
    /// response back without the request being applied again.
    pub async fn request_with_id(
        &mut self,
        request_id: RequestId,
        message: Message,
    ) -> Result<Message, ClientError> {
        let encoded = encode_frame(&Frame::new(request_id, message), self.max_frame_len)?;
        self.write_lossy(&encoded).await?;
        self.tracker.begin(request_id, encoded, Instant::now());

        loop {
            let Some(deadline) = self.tracker.deadline(request_id) else {
                return Err(ClientError::Disconnected);
            };

            match time::timeout_at(deadline, self.recv_frame()).await {
                Ok(Ok(Some(frame))) if frame.request_id == request_id => {
                    self.tracker.complete(request_id);
                    return match frame.message {
                        Message::Error(body) => Err(ClientError::Server {
                            kind: body.kind,
                            message: body.message,
                        }),
                        message => Ok(message),
                    };
                }
                Ok(Ok(Some(frame))) => self.absorb(frame),
                Ok(Ok(None)) => {
                    self.tracker.complete(request_id);
                    return Err(ClientError::Disconnected);
                }
                Ok(Err(e)) => {
                    self.tracker.complete(request_id);
                    return Err(e);
                }
                Err(_elapsed) => match self.tracker.on_timeout(request_id, Instant::now()) {
                    Some(RetryDecision::Resend(bytes)) => {
                        tracing::debug!(%request_id, "no response, resending");
                        self.write_lossy(&bytes).await?;
                    }
                    Some(RetryDecision::Exhausted { attempts }) => {
                        tracing::warn!(%request_id, attempts, "request timed out");
                        return Err(ClientError::RequestTimedOut {
                            request_id,
                            attempts,
                        });
                    }
                    None => return Err(ClientError::Disconnected),
                },
            }
        }
    }

    /// Handles a frame that is not the response being waited for.
    fn absorb(&mut self, frame: Frame) {
        match frame.message {
            Message::StateUpdate(update) if frame.request_id.is_unsolicited() => {
                self.updates.push_back(update);
            }
            other => {
                tracing::debug!(
                    request_id = %frame.request_id,
                    message_type = %other.message_type(),
                    "discarding stale frame"
                );
            }
        }
    }

    /// Writes bytes, treating transient failures like a lost packet: the
    /// retry timer will resend.
    async fn write_lossy(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        match self.stream.write_all(bytes).await {
            Ok(()) => Ok(()),
            Err(e) if is_transient(&e) => {
                tracing::debug!(error = %e, "transient write failure");
                Ok(())
            }
            Err(e) => Err(ClientError::Io(e)),
        }
    }

    /// Sends raw bytes without tracking a response.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await.map_err(ClientError::Io)
    }

    /// Reads the next frame. `Ok(None)` means the server closed the
    /// connection. Recoverable framing errors are skipped.
    ///
    /// Cancel-safe: bytes already read stay in the decoder.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(ClientError::Framing(e)),
                Err(e) => {
                    tracing::debug!(error = %e, "skipping undecodable frame");
                    continue;
                }
            }
            match self.stream.read_buf(self.decoder.buffer_mut()).await {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
    }

    /// Takes every buffered `STATE_UPDATE`.
    pub fn drain_updates(&mut self) -> Vec<StateUpdate> {
        self.updates.drain(..).collect()
    }

    /// Returns the next `STATE_UPDATE`, reading from the socket if none
    /// is buffered. `Ok(None)` if nothing arrives within `wait`.
    pub async fn next_update(&mut self, wait: Duration) -> Result<Option<StateUpdate>, ClientError> {
        if let Some(update) = self.updates.pop_front() {
            return Ok(Some(update));
        }
        let deadline = Instant::now() + wait;
        loop {
            match time::timeout_at(deadline, self.recv_frame()).await {
                Err(_elapsed) => return Ok(None),
                Ok(Ok(Some(frame))) => {
                    self.absorb(frame);
                    if let Some(update) = self.updates.pop_front() {
                        return Ok(Some(update));
                    }
                }
                Ok(Ok(None)) => return Err(ClientError::Disconnected),
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Closes the write half. The server sees a clean disconnect.
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await.map_err(ClientError::Io)
    }

    // -----------------------------------------------------------------------
    // Typed helpers
    // -----------------------------------------------------------------------

    /// `CONNECT`. Pass `None` to the dispatcher on first contact.
    pub async fn hello(&mut self, client_id: Option<ClientId>) -> Result<Connected, ClientError> {
        match self.request(Message::Connect(ConnectRequest { client_id })).await? {
            Message::Connected(connected) => Ok(connected),
            other => Err(unexpected(MessageType::Connected, &other)),
        }
    }

    /// `JOIN_ROOM`.
    pub async fn join_room(&mut self, room_id: RoomId) -> Result<RoomAssignment, ClientError> {
        let reply = self.request(Message::JoinRoom(RoomRequest { room_id })).await?;
        expect_assignment(reply)
    }

    /// `CREATE_ROOM`.
    pub async fn create_room(&mut self, room_id: RoomId) -> Result<RoomAssignment, ClientError> {
        let reply = self.request(Message::CreateRoom(RoomRequest { room_id })).await?;
        expect_assignment(reply)
    }

    /// `LIST_ROOMS`.
    pub async fn list_rooms(&mut self) -> Result<Vec<RoomListEntry>, ClientError> {
        match self.request(Message::ListRooms).await? {
            Message::RoomList(list) => Ok(list.rooms),
            other => Err(unexpected(MessageType::RoomList, &other)),
        }
    }

    /// `MOVE`.
    pub async fn step(&mut self, direction: Direction) -> Result<Ack, ClientError> {
        let reply = self.request(Message::Move(MoveRequest { direction })).await?;
        expect_ack(reply)
    }

    /// `ACTION` on a tile.
    pub async fn act(&mut self, target: Position) -> Result<ActionOutcome, ClientError> {
        let reply = self.request(Message::Action(ActionRequest { target })).await?;
        match expect_ack(reply)? {
            Ack::Acted { outcome } => Ok(outcome),
            _ => Err(ClientError::UnexpectedResponse {
                expected: MessageType::Ack,
                got: MessageType::Ack,
            }),
        }
    }

    /// `LEAVE_ROOM`.
    pub async fn leave(&mut self) -> Result<Ack, ClientError> {
        let reply = self.request(Message::LeaveRoom).await?;
        expect_ack(reply)
    }

    /// `HEARTBEAT`, returning the echoed payload.
    pub async fn heartbeat(&mut self, sent_at_ms: u64) -> Result<Heartbeat, ClientError> {
        match self.request(Message::Heartbeat(Heartbeat { sent_at_ms })).await? {
            Message::Heartbeat(beat) => Ok(beat),
            other => Err(unexpected(MessageType::Heartbeat, &other)),
        }
    }
}

fn unexpected(expected: MessageType, got: &Message) -> ClientError {
    ClientError::UnexpectedResponse {
        expected,
        got: got.message_type(),
    }
}

fn expect_assignment(reply: Message) -> Result<RoomAssignment, ClientError> {
    match reply {
        Message::RoomAssigned(assignment) => Ok(assignment),
        other => Err(unexpected(MessageType::RoomAssigned, &other)),
    }
}

fn expect_ack(reply: Message) -> Result<Ack, ClientError> {
    match reply {
        Message::Ack(ack) => Ok(ack),
        other => Err(unexpected(MessageType::Ack, &other)),
    }
}
