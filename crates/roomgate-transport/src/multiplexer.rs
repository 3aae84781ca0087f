//! Readiness-driven connection multiplexer.
//!
//! One [`Multiplexer`] serves every TCP connection of a server from a
//! single control loop, without a task per client request:
//!
//! ```text
//!             ┌──────────── SelectAll ────────────┐
//!  socket 1 ──┤ read half + FrameDecoder (unfold) ├──┐
//!  socket 2 ──┤ read half + FrameDecoder (unfold) ├──┼──► wait() ──► Vec<Readiness>
//!  listener ──┴───────────────────────────────────┘  │
//!                                                    │
//!  send(id) ──► mpsc ──► writer task ──► write half  │
//! ```
//!
//! Each read half is turned into a stream of frames with
//! `futures_util::stream::unfold`, and all of them are merged into one
//! [`SelectAll`]. Partial reads simply stay in the connection's
//! [`FrameDecoder`] until the rest arrives.
//!
//! Writes go through a per-connection writer task fed by an unbounded
//! channel, so [`Multiplexer::send`] never waits on a slow peer. Closing a
//! connection drops its channel sender: the writer flushes whatever is
//! still queued and then shuts the socket down.
//!
//! [`Multiplexer::wait`] is cancel-safe. Stream state lives inside the
//! `SelectAll`, and `TcpListener::accept` is itself cancel-safe, so the
//! call can sit in a `tokio::select!` next to timers.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::future::FutureExt;
use futures_util::stream::{self, AbortHandle, BoxStream, SelectAll, StreamExt};
use roomgate_protocol::{Frame, FrameDecoder, FramingError, encode_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use crate::{ConnectionId, TransportError};

/// Upper bound on events returned by one call to [`Multiplexer::wait`].
const MAX_EVENTS_PER_WAIT: usize = 256;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Something that happened on the multiplexer's sockets.
#[derive(Debug)]
pub enum Readiness {
    /// A new client connection was accepted.
    Accepted { id: ConnectionId, peer: SocketAddr },
    /// A complete frame arrived.
    Frame { id: ConnectionId, frame: Frame },
    /// A frame arrived but could not be used. The connection stays open;
    /// the error carries the request id to answer.
    Rejected {
        id: ConnectionId,
        error: FramingError,
    },
    /// The connection is gone. It has already been removed from the
    /// multiplexer when this is reported.
    Closed {
        id: ConnectionId,
        reason: CloseReason,
    },
}

impl Readiness {
    /// The connection this event concerns.
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Accepted { id, .. }
            | Self::Frame { id, .. }
            | Self::Rejected { id, .. }
            | Self::Closed { id, .. } => *id,
        }
    }
}

/// Why a connection went away.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its end cleanly.
    PeerClosed,
    /// The socket failed with a non-transient error.
    Reset(io::Error),
    /// The peer sent bytes that cannot be framed.
    Corrupt(FramingError),
    /// [`Multiplexer::close`] was called.
    Local,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Reset(e) => write!(f, "reset: {e}"),
            Self::Corrupt(e) => write!(f, "corrupt stream: {e}"),
            Self::Local => write!(f, "closed locally"),
        }
    }
}

/// Returns `true` for I/O errors that mean "try again", not "gone".
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ---------------------------------------------------------------------------
// Multiplexer
// ---------------------------------------------------------------------------

struct Connection {
    outbound: mpsc::UnboundedSender<Bytes>,
    reader: AbortHandle,
    peer: Option<SocketAddr>,
}

enum Wake {
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Reader(Readiness),
}

/// Serves a dynamic set of framed TCP connections from one task.
pub struct Multiplexer {
    listener: Option<TcpListener>,
    readers: SelectAll<BoxStream<'static, Readiness>>,
    connections: HashMap<ConnectionId, Connection>,
    pending: VecDeque<Readiness>,
    next_id: u64,
    max_frame_len: usize,
}

impl Multiplexer {
    /// Binds a listener. Accepted sockets join the multiplexer
    /// automatically.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        max_frame_len: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::Bind)?;
        let mut mux = Self::unbound(max_frame_len);
        mux.listener = Some(listener);
        Ok(mux)
    }

    /// A multiplexer without a listener. Connections are added with
    /// [`register`](Self::register).
    pub fn unbound(max_frame_len: usize) -> Self {
        Self {
            listener: None,
            readers: SelectAll::new(),
            connections: HashMap::new(),
            pending: VecDeque::new(),
            next_id: 1,
            max_frame_len,
        }
    }

    /// The listener's address, if there is one.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        match &self.listener {
            Some(listener) => listener.local_addr().map_err(TransportError::LocalAddr),
            None => Err(TransportError::NotListening),
        }
    }

    /// Returns `true` while the listener is still accepting.
    pub fn is_accepting(&self) -> bool {
        self.listener.is_some()
    }

    /// Drops the listener. Existing connections are unaffected.
    pub fn stop_accepting(&mut self) {
        if self.listener.take().is_some() {
            tracing::debug!("listener closed");
        }
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Remote address of a connection, when known.
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).and_then(|c| c.peer)
    }

    /// Adds an already-connected stream.
    ///
    /// `decoder` may already hold bytes read from the stream (for example
    /// during a handshake performed before handing the stream over).
    pub fn register(&mut self, stream: TcpStream, decoder: FrameDecoder) -> ConnectionId {
        let peer = stream.peer_addr().ok();
        self.adopt(stream, peer, decoder)
    }

    fn adopt(
        &mut self,
        stream: TcpStream,
        peer: Option<SocketAddr>,
        decoder: FrameDecoder,
    ) -> ConnectionId {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%id, error = %e, "failed to set TCP_NODELAY");
        }
        let (read, write) = stream.into_split();

        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(id, write, rx));

        let (reader, handle) = stream::abortable(frame_stream(id, read, decoder));
        self.readers.push(reader.boxed());

        self.connections.insert(
            id,
            Connection {
                outbound,
                reader: handle,
                peer,
            },
        );
        id
    }

    /// Encodes a frame with this multiplexer's frame limit.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, TransportError> {
        encode_frame(frame, self.max_frame_len).map_err(TransportError::Framing)
    }

    /// Queues a frame for a connection. Never waits on the peer.
    pub fn send(&self, id: ConnectionId, frame: &Frame) -> Result<(), TransportError> {
        let bytes = self.encode(frame)?;
        self.send_encoded(id, bytes)
    }

    /// Queues pre-encoded bytes. Used to encode a broadcast once and fan
    /// it out.
    pub fn send_encoded(&self, id: ConnectionId, bytes: Bytes) -> Result<(), TransportError> {
        let conn = self
            .connections
            .get(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        conn.outbound
            .send(bytes)
            .map_err(|_| TransportError::UnknownConnection(id))
    }

    /// Closes a connection after its queued output has been flushed.
    ///
    /// A `Closed { reason: Local }` event is reported by the next
    /// [`wait`](Self::wait).
    pub fn close(&mut self, id: ConnectionId) -> Result<(), TransportError> {
        let conn = self
            .connections
            .remove(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        conn.reader.abort();
        // Dropping `conn.outbound` lets the writer drain and shut down.
        drop(conn);
        self.pending.push_back(Readiness::Closed {
            id,
            reason: CloseReason::Local,
        });
        Ok(())
    }

    /// Waits until at least one connection (or the listener) is ready and
    /// returns everything that is ready right now.
    ///
    /// Never returns an empty vector. With no listener and no connections
    /// it waits forever, which is what a `select!` branch wants.
    pub async fn wait(&mut self) -> Vec<Readiness> {
        let mut ready: Vec<Readiness> = self.pending.drain(..).collect();
        if ready.is_empty() {
            let first = self.next_event().await;
            ready.push(first);
        }
        while ready.len() < MAX_EVENTS_PER_WAIT {
            match self.next_event().now_or_never() {
                Some(event) => ready.push(event),
                None => break,
            }
        }
        ready
    }

    async fn next_event(&mut self) -> Readiness {
        loop {
            let has_readers = !self.readers.is_empty();
            let wake = tokio::select! {
                accepted = accept(self.listener.as_ref()) => Wake::Accept(accepted),
                Some(event) = self.readers.next(), if has_readers => Wake::Reader(event),
            };

            match wake {
                Wake::Accept(Ok((stream, peer))) => {
                    let decoder = FrameDecoder::new(self.max_frame_len);
                    let id = self.adopt(stream, Some(peer), decoder);
                    tracing::debug!(%id, %peer, "accepted connection");
                    return Readiness::Accepted { id, peer };
                }
                Wake::Accept(Err(e)) if is_transient(&e) => continue,
                Wake::Accept(Err(e)) => {
                    // Per-socket accept failures (e.g. the peer reset
                    // before we got to it) do not stop the listener.
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
                Wake::Reader(event) => {
                    if let Readiness::Closed { id, reason } = &event {
                        self.connections.remove(id);
                        tracing::debug!(%id, %reason, "connection closed");
                    }
                    return event;
                }
            }
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Per-connection halves
// ---------------------------------------------------------------------------

struct ReadState {
    read: OwnedReadHalf,
    decoder: FrameDecoder,
}

/// Turns a read half into a stream of events that ends after `Closed`.
fn frame_stream(
    id: ConnectionId,
    read: OwnedReadHalf,
    decoder: FrameDecoder,
) -> BoxStream<'static, Readiness> {
    stream::unfold(Some(ReadState { read, decoder }), move |state| async move {
        let mut st = state?;
        loop {
            match st.decoder.next_frame() {
                Ok(Some(frame)) => return Some((Readiness::Frame { id, frame }, Some(st))),
                Ok(None) => {}
                Err(error) if error.is_fatal() => {
                    let reason = CloseReason::Corrupt(error);
                    return Some((Readiness::Closed { id, reason }, None));
                }
                Err(error) => return Some((Readiness::Rejected { id, error }, Some(st))),
            }

            match st.read.read_buf(st.decoder.buffer_mut()).await {
                Ok(0) => {
                    if st.decoder.has_partial() {
                        tracing::debug!(
                            %id,
                            buffered = st.decoder.buffered_len(),
                            "peer closed mid-frame"
                        );
                    }
                    let reason = CloseReason::PeerClosed;
                    return Some((Readiness::Closed { id, reason }, None));
                }
                Ok(_) => {}
                Err(e) if is_transient(&e) => {}
                Err(e) => {
                    let reason = CloseReason::Reset(e);
                    return Some((Readiness::Closed { id, reason }, None));
                }
            }
        }
    })
    .boxed()
}

async fn write_loop(
    id: ConnectionId,
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write.write_all(&bytes).await {
            tracing::debug!(%id, error = %e, "write failed, discarding queued output");
            return;
        }
    }
    if let Err(e) = write.shutdown().await {
        tracing::debug!(%id, error = %e, "shutdown failed");
    }
}
