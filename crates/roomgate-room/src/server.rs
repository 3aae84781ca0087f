//! The room server: one room, one control loop, one multiplexer.
//!
//! A room server is the sole authority over its [`WorldState`]. It is
//! started by the dispatcher (as a child process or a Tokio task) and
//! talks to two kinds of peers over the same listener:
//!
//! - **Clients**, which `CONNECT` with the id the dispatcher gave them and
//!   then send `MOVE`, `ACTION` and `LEAVE_ROOM`.
//! - **The dispatcher**, which opens a *control link* with
//!   `ROOM_HANDSHAKE` and then listens for `ROOM_STATUS` reports.
//!
//! # The loop
//!
//! ```text
//! loop {
//!     select! {
//!         mux.wait()      → accept / frames / disconnects
//!         grace.expired() → nobody came back: report idle, drain
//!         round.tick()    → end the round, evict old responses, sweep idle
//!     }
//! }
//! ```
//!
//! Everything inside one wake-up is synchronous, and the multiplexer never
//! waits on a slow client, so one stuck client cannot stall the room.

use std::net::SocketAddr;

use rand::SeedableRng;
use rand::rngs::StdRng;
use roomgate_protocol::{
    Ack, ConnectRequest, Connected, ErrorKind, Frame, FramingError, Message, RequestId,
    RoomHandshake, RoomId, RoomReady, RoomStatus, StateUpdate, WorldDelta,
};
use roomgate_session::{Admission, ResponseCache, SessionManager};
use roomgate_tick::{Deadline, Ticker};
use roomgate_transport::{CloseReason, ConnectionId, Multiplexer, Readiness};
use tokio::time::Instant;

use crate::{RoomError, RoomServerConfig, RoomServerState, WorldState};

/// A bound, not yet running, room server.
pub struct RoomServer {
    room_id: RoomId,
    config: RoomServerConfig,
    state: RoomServerState,
    mux: Multiplexer,
    sessions: SessionManager,
    cache: ResponseCache,
    world: WorldState,
    grace: Deadline,
    round: Ticker,
    /// The dispatcher's connection, once it has handshaken.
    control: Option<ConnectionId>,
    /// Occupancy last reported on the control link.
    reported: Option<usize>,
}

impl RoomServer {
    /// Binds the listener and builds the world. Call [`run`](Self::run)
    /// to start serving.
    pub async fn bind(room_id: RoomId, config: RoomServerConfig) -> Result<Self, RoomError> {
        let config = config.validated();
        let mux = Multiplexer::bind(config.bind.as_str(), config.max_frame_len).await?;

        let world = match config.item_seed {
            Some(seed) => {
                WorldState::generate(room_id.clone(), config.dimension, &mut StdRng::seed_from_u64(seed))
            }
            None => WorldState::generate(room_id.clone(), config.dimension, &mut rand::rng()),
        };

        Ok(Self {
            sessions: SessionManager::new(config.session.clone()),
            cache: ResponseCache::new(config.response_ttl),
            round: Ticker::new(config.round.clone()),
            grace: Deadline::new(),
            state: RoomServerState::Serving,
            control: None,
            reported: None,
            room_id,
            mux,
            world,
            config,
        })
    }

    /// The address clients should connect to.
    pub fn local_addr(&self) -> Result<SocketAddr, RoomError> {
        Ok(self.mux.local_addr()?)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Serves until the room has drained or its control link is lost.
    pub async fn run(mut self) -> Result<(), RoomError> {
        let addr = self.local_addr()?;
        tracing::info!(room_id = %self.room_id, %addr, "room server started");

        // Nobody has joined yet: the room is already counting down.
        self.grace.arm(self.config.grace);

        while self.state != RoomServerState::Stopped {
            tokio::select! {
                events = self.mux.wait() => {
                    for event in events {
                        self.handle_event(event);
                    }
                }
                _ = self.grace.expired() => self.on_grace_expired(),
                _ = self.round.tick() => self.housekeeping(),
            }
        }

        tracing::info!(room_id = %self.room_id, "room server stopped");
        Ok(())
    }

    fn transition(&mut self, next: RoomServerState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(room_id = %self.room_id, from = %self.state, to = %next, "room state");
            self.state = next;
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn handle_event(&mut self, event: Readiness) {
        match event {
            Readiness::Accepted { id, peer } => {
                tracing::debug!(room_id = %self.room_id, %id, %peer, "connection accepted");
                self.sessions.open(id, Instant::now());
                self.refresh_grace();
            }
            Readiness::Frame { id, frame } => {
                if Some(id) == self.control {
                    self.handle_control_frame(id, frame);
                } else {
                    self.sessions.touch(id, Instant::now());
                    self.handle_client_frame(id, frame);
                }
            }
            Readiness::Rejected { id, error } => self.handle_rejected(id, error),
            Readiness::Closed { id, reason } => self.handle_closed(id, reason),
        }
    }

    fn handle_rejected(&mut self, conn: ConnectionId, error: FramingError) {
        tracing::debug!(room_id = %self.room_id, %conn, %error, "rejected frame");
        if let Some(request_id) = error.request_id() {
            let reply = Message::error(ErrorKind::Protocol, error.to_string());
            self.reply(conn, request_id, reply);
        }
    }

    fn handle_closed(&mut self, conn: ConnectionId, reason: CloseReason) {
        if Some(conn) == self.control {
            self.control = None;
            if self.state == RoomServerState::Draining {
                tracing::debug!(room_id = %self.room_id, "control link closed after drain");
            } else {
                tracing::warn!(room_id = %self.room_id, %reason, "control link lost, shutting down");
            }
            self.transition(RoomServerState::Stopped);
            return;
        }
        if !matches!(reason, CloseReason::Local | CloseReason::PeerClosed) {
            tracing::warn!(room_id = %self.room_id, %conn, %reason, "client connection dropped");
        }
        self.detach(conn);
    }

    /// Forgets a connection and removes its client from the world.
    fn detach(&mut self, conn: ConnectionId) {
        let Some(session) = self.sessions.close(conn) else {
            // Already detached, or displaced by a newer connection.
            return;
        };
        if let Some(client_id) = session.client_id {
            if let Some(delta) = self.world.remove_client(client_id) {
                tracing::info!(room_id = %self.room_id, %client_id, "client left");
                self.broadcast(vec![delta]);
            }
        }
        self.report_occupancy();
        self.refresh_grace();
    }

    // -----------------------------------------------------------------------
    // Client frames
    // -----------------------------------------------------------------------

    fn handle_client_frame(&mut self, conn: ConnectionId, frame: Frame) {
        let Frame {
            request_id,
            message,
        } = frame;

        match message {
            Message::RoomHandshake(handshake) => self.handle_handshake(conn, request_id, handshake),
            Message::Connect(request) => {
                let reply = match self.join(conn, request) {
                    Ok(connected) => Message::Connected(connected),
                    Err(e) => Message::error(e.kind(), e.to_string()),
                };
                self.reply(conn, request_id, reply);
                self.report_occupancy();
            }
            Message::Heartbeat(beat) => self.reply(conn, request_id, Message::Heartbeat(beat)),
            message @ (Message::Move(_) | Message::Action(_) | Message::LeaveRoom) => {
                self.handle_gameplay(conn, request_id, message);
            }
            other => {
                let e = RoomError::Unsupported(other.message_type());
                self.reply(conn, request_id, Message::error(e.kind(), e.to_string()));
            }
        }
    }

    fn handle_handshake(&mut self, conn: ConnectionId, request_id: RequestId, handshake: RoomHandshake) {
        if handshake.room_id != self.room_id {
            let e = RoomError::WrongRoom {
                hosted: self.room_id.clone(),
                requested: handshake.room_id,
            };
            self.reply(conn, request_id, Message::error(e.kind(), e.to_string()));
            return;
        }

        if let Some(old) = self.control.replace(conn) {
            tracing::warn!(room_id = %self.room_id, %old, "control link replaced");
            let _ = self.mux.close(old);
        }
        // The control link is not a client.
        self.sessions.close(conn);
        self.reported = Some(self.world.present_count());

        tracing::debug!(room_id = %self.room_id, %conn, "control link established");
        self.reply(
            conn,
            request_id,
            Message::RoomReady(RoomReady {
                room_id: self.room_id.clone(),
                clients: self.world.present_count(),
            }),
        );
        self.refresh_grace();
    }

    /// `CONNECT`: attach a client to the room.
    fn join(&mut self, conn: ConnectionId, request: ConnectRequest) -> Result<Connected, RoomError> {
        if !self.state.is_joinable() {
            return Err(RoomError::Draining(self.room_id.clone()));
        }
        let client_id = request.client_id.ok_or(RoomError::ClientIdRequired)?;

        let identified = self.sessions.identify(conn, Some(client_id))?;
        if let Some(old) = identified.displaced {
            tracing::info!(room_id = %self.room_id, %client_id, %old, "closing displaced connection");
            let _ = self.mux.close(old);
        }
        if identified.new_session {
            // Request ids restart with each session.
            self.cache.forget_client(client_id);
        }

        if let Some(delta) = self.world.add_client(client_id) {
            tracing::info!(
                room_id = %self.room_id,
                %client_id,
                clients = self.world.present_count(),
                "client joined"
            );
            self.broadcast(vec![delta]);
        }

        Ok(Connected {
            client_id,
            last_room: None,
            snapshot: Some(self.world.snapshot()),
        })
    }

    /// `MOVE`, `ACTION`, `LEAVE_ROOM`: applied at most once per request id.
    fn handle_gameplay(&mut self, conn: ConnectionId, request_id: RequestId, message: Message) {
        let Some(client_id) = self.sessions.client_of(conn) else {
            let e = RoomError::NotConnected;
            self.reply(conn, request_id, Message::error(e.kind(), e.to_string()));
            return;
        };

        let now = Instant::now();
        match self.cache.admit(client_id, request_id, conn, now) {
            Admission::Fresh => {}
            Admission::InFlight => {
                tracing::debug!(room_id = %self.room_id, %client_id, %request_id, "duplicate in flight");
                return;
            }
            Admission::Replay(response) => {
                tracing::debug!(room_id = %self.room_id, %client_id, %request_id, "replaying response");
                self.reply(conn, request_id, response);
                return;
            }
        }

        let leaving = matches!(message, Message::LeaveRoom);
        let result = match message {
            Message::Move(m) => self.world.apply_move(client_id, m.direction),
            Message::Action(a) => self.world.apply_action(client_id, a.target),
            Message::LeaveRoom => self
                .world
                .remove_client(client_id)
                .map(|delta| (Ack::Left, vec![delta]))
                .ok_or(RoomError::NotJoined(client_id)),
            other => Err(RoomError::Unsupported(other.message_type())),
        };

        let (response, changes) = match result {
            Ok((ack, changes)) => (Message::Ack(ack), changes),
            Err(e) => {
                tracing::debug!(room_id = %self.room_id, %client_id, %request_id, error = %e, "request rejected");
                (Message::error(e.kind(), e.to_string()), Vec::new())
            }
        };

        let target = self
            .cache
            .complete(client_id, request_id, response.clone(), now)
            .unwrap_or(conn);
        self.reply(target, request_id, response);
        self.broadcast(changes);

        if leaving {
            tracing::info!(room_id = %self.room_id, %client_id, "client left");
            self.sessions.close(conn);
            // Queued output (the ACK above) is flushed before the close.
            let _ = self.mux.close(conn);
            self.report_occupancy();
            self.refresh_grace();
        }
    }

    // -----------------------------------------------------------------------
    // Control link
    // -----------------------------------------------------------------------

    fn handle_control_frame(&mut self, conn: ConnectionId, frame: Frame) {
        match frame.message {
            Message::Heartbeat(beat) => self.reply(conn, frame.request_id, Message::Heartbeat(beat)),
            other => {
                tracing::debug!(
                    room_id = %self.room_id,
                    message_type = %other.message_type(),
                    "ignoring message on control link"
                );
            }
        }
    }

    fn report_occupancy(&mut self) {
        let clients = self.world.present_count();
        if self.reported == Some(clients) {
            return;
        }
        self.reported = Some(clients);
        self.send_status(clients, false);
    }

    fn send_status(&mut self, clients: usize, idle: bool) {
        let Some(control) = self.control else {
            return;
        };
        let status = Message::RoomStatus(RoomStatus {
            room_id: self.room_id.clone(),
            clients,
            idle,
        });
        if let Err(e) = self.mux.send(control, &Frame::unsolicited(status)) {
            tracing::warn!(room_id = %self.room_id, error = %e, "failed to report status");
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Arms the grace deadline while nobody is connected, disarms it
    /// otherwise.
    fn refresh_grace(&mut self) {
        if self.sessions.is_empty() {
            if !self.grace.is_armed() && self.state.is_joinable() {
                tracing::debug!(room_id = %self.room_id, grace = ?self.config.grace, "room empty, grace started");
                self.grace.arm(self.config.grace);
            }
        } else {
            self.grace.disarm();
        }
    }

    fn on_grace_expired(&mut self) {
        tracing::info!(room_id = %self.room_id, "room idle past grace period, draining");
        self.transition(RoomServerState::Draining);
        if self.control.is_some() {
            // Clients assigned before the dispatcher sees the report still
            // reach us and are told the room is unavailable.
            self.send_status(0, true);
        } else {
            self.mux.stop_accepting();
            self.transition(RoomServerState::Stopped);
        }
    }

    fn housekeeping(&mut self) {
        let now = Instant::now();
        self.world.end_round();

        let evicted = self.cache.evict_expired(now);
        if evicted > 0 {
            tracing::trace!(room_id = %self.room_id, evicted, "response cache evicted");
        }

        for conn in self.sessions.idle(now) {
            tracing::info!(room_id = %self.room_id, %conn, "closing idle connection");
            let _ = self.mux.close(conn);
            self.detach(conn);
        }
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    fn reply(&self, conn: ConnectionId, request_id: RequestId, message: Message) {
        if let Err(e) = self.mux.send(conn, &Frame::new(request_id, message)) {
            tracing::debug!(room_id = %self.room_id, %conn, error = %e, "reply dropped");
        }
    }

    /// Commits deltas and sends the resulting `STATE_UPDATE` to every
    /// attached client.
    fn broadcast(&mut self, changes: Vec<WorldDelta>) {
        let Some(update) = self.world.commit(changes) else {
            return;
        };
        self.send_update(update);
    }

    fn send_update(&self, update: StateUpdate) {
        let frame = Frame::unsolicited(Message::StateUpdate(update));
        let bytes = match self.mux.encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(room_id = %self.room_id, error = %e, "failed to encode update");
                return;
            }
        };
        for (client_id, conn) in self.sessions.clients() {
            if self.world.is_present(client_id) {
                let _ = self.mux.send_encoded(conn, bytes.clone());
            }
        }
    }
}
