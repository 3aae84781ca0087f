//! Dispatcher event handling: client requests, control links, spawn
//! outcomes, and housekeeping.
//!
//! A connection is one of two things:
//!
//! - a **client**, opened by the listener and tracked by the
//!   [`SessionManager`](roomgate_session::SessionManager), or
//! - a **control link** to a room server, registered by the dispatcher
//!   itself after a successful launch and tracked by the registry.
//!
//! `JOIN_ROOM` and `CREATE_ROOM` go through the response cache, so a
//! client that retries (same request id) while its room is still
//! spawning is never the cause of a second launch, and gets the original
//! answer once it exists.

use roomgate_protocol::{
    ClientId, ConnectRequest, Connected, ErrorKind, Frame, FramingError, Message, RequestId,
    RoomAssignment, RoomId, RoomList, RoomPhase, RoomRequest, RoomStatus,
};
use roomgate_session::{Admission, Location};
use roomgate_transport::{CloseReason, ConnectionId, Readiness};
use tokio::time::Instant;

use crate::dispatcher::Dispatcher;
use crate::registry::{SpawnOutcome, Waiter};
use crate::{RequestError, RoomLauncher};

impl<L: RoomLauncher> Dispatcher<L> {
    pub(crate) fn handle_event(&mut self, event: Readiness) {
        match event {
            Readiness::Accepted { id, peer } => {
                tracing::debug!(%id, %peer, "client connected");
                self.sessions.open(id, Instant::now());
            }
            Readiness::Frame { id, frame } => {
                if let Some(room_id) = self.registry.room_for_control(id).cloned() {
                    self.handle_control_frame(room_id, frame);
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
        tracing::debug!(%conn, %error, "rejected frame");
        if let Some(request_id) = error.request_id() {
            self.reply(conn, request_id, Message::error(ErrorKind::Protocol, error.to_string()));
        }
    }

    fn handle_closed(&mut self, conn: ConnectionId, reason: CloseReason) {
        if let Some(room_id) = self.registry.room_for_control(conn).cloned() {
            tracing::warn!(%room_id, %reason, "control link lost");
            self.reclaim_room(&room_id);
            return;
        }
        if let Some(session) = self.sessions.close(conn) {
            tracing::debug!(
                %conn,
                client_id = ?session.client_id,
                %reason,
                "client disconnected"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Client requests
    // -----------------------------------------------------------------------

    fn handle_client_frame(&mut self, conn: ConnectionId, frame: Frame) {
        let Frame {
            request_id,
            message,
        } = frame;

        let reply = match message {
            Message::Connect(request) => self.connect(conn, request).map(Message::Connected),
            Message::JoinRoom(request) | Message::CreateRoom(request) => {
                // Answered now, or later when the room is ready.
                self.join(conn, request_id, request);
                return;
            }
            Message::ListRooms => Ok(Message::RoomList(RoomList {
                rooms: self.registry.list(),
            })),
            Message::Heartbeat(beat) => Ok(Message::Heartbeat(beat)),
            other => Err(RequestError::Unsupported(other.message_type())),
        };

        let reply = reply.unwrap_or_else(|e| {
            tracing::debug!(%conn, %request_id, error = %e, "request rejected");
            Message::error(e.kind(), e.to_string())
        });
        self.reply(conn, request_id, reply);
    }

    /// `CONNECT`: assign a client id, or re-bind a known one.
    fn connect(&mut self, conn: ConnectionId, request: ConnectRequest) -> Result<Connected, RequestError> {
        let identified = self.sessions.identify(conn, request.client_id)?;
        if let Some(old) = identified.displaced {
            let _ = self.mux.close(old);
        }
        if identified.new_session {
            // Request ids restart with each session.
            self.cache.forget_client(identified.client_id);
        }
        self.sessions.set_location(conn, Location::Dispatcher)?;

        let client_id = identified.client_id;
        let last_room = self.sessions.last_room(client_id).cloned();
        tracing::info!(
            %conn,
            %client_id,
            assigned = identified.assigned,
            last_room = ?last_room,
            "client identified"
        );
        Ok(Connected {
            client_id,
            last_room,
            snapshot: None,
        })
    }

    /// `JOIN_ROOM` / `CREATE_ROOM`: resolve the room, creating it if
    /// needed. Applied at most once per request id.
    fn join(&mut self, conn: ConnectionId, request_id: RequestId, request: RoomRequest) {
        let Some(client_id) = self.sessions.client_of(conn) else {
            let e = RequestError::NotConnected;
            self.reply(conn, request_id, Message::error(e.kind(), e.to_string()));
            return;
        };

        match self.cache.admit(client_id, request_id, conn, Instant::now()) {
            Admission::Fresh => {}
            Admission::InFlight => {
                tracing::debug!(%client_id, %request_id, "join already in progress");
                return;
            }
            Admission::Replay(response) => {
                tracing::debug!(%client_id, %request_id, "replaying join response");
                self.reply(conn, request_id, response);
                return;
            }
        }

        let room_id = request.room_id;
        let waiter = Waiter {
            connection: conn,
            client_id,
            request_id,
        };

        let phase = self.registry.lookup(&room_id).map(|r| r.phase);
        let result = match phase {
            Some(RoomPhase::Ready) => {
                let response = self.assignment_for(&room_id);
                self.respond(waiter, response);
                return;
            }
            Some(RoomPhase::Spawning) => self.registry.add_waiter(&room_id, waiter),
            Some(RoomPhase::Draining | RoomPhase::Reclaimed) => {
                let e = RequestError::Closing(room_id);
                self.respond(waiter, Message::error(e.kind(), e.to_string()));
                return;
            }
            None => self
                .registry
                .create(room_id.clone(), &self.launcher, &self.outcomes_tx)
                .and_then(|_| self.registry.add_waiter(&room_id, waiter)),
        };

        if let Err(e) = result {
            tracing::error!(%room_id, error = %e, "failed to park join request");
            let e = RequestError::from(e);
            self.respond(waiter, Message::error(e.kind(), e.to_string()));
        }
    }

    /// `ROOM_ASSIGNED` for a ready room, or an error if it has gone.
    fn assignment_for(&self, room_id: &RoomId) -> Message {
        let endpoint = self.registry.lookup(room_id).and_then(|r| r.endpoint);
        match endpoint {
            Some(endpoint) => Message::RoomAssigned(RoomAssignment {
                room_id: room_id.clone(),
                host: self
                    .config
                    .advertise_host
                    .clone()
                    .unwrap_or_else(|| endpoint.ip().to_string()),
                port: endpoint.port(),
            }),
            None => {
                let e = RequestError::Closing(room_id.clone());
                Message::error(e.kind(), e.to_string())
            }
        }
    }

    /// Completes a cached request and sends the response to wherever the
    /// client is now.
    fn respond(&mut self, waiter: Waiter, response: Message) {
        let Waiter {
            connection,
            client_id,
            request_id,
        } = waiter;

        if let Message::RoomAssigned(assignment) = &response {
            self.note_assignment(client_id, &assignment.room_id);
        }
        let target = self
            .cache
            .complete(client_id, request_id, response.clone(), Instant::now())
            .unwrap_or(connection);
        self.reply(target, request_id, response);
    }

    /// Remembers the room a client was sent to.
    fn note_assignment(&mut self, client_id: ClientId, room_id: &RoomId) {
        let Some(conn) = self.sessions.connection_of(client_id) else {
            return;
        };
        if let Err(e) = self.sessions.set_location(conn, Location::Room(room_id.clone())) {
            tracing::debug!(%client_id, error = %e, "could not record room");
        } else {
            tracing::info!(%client_id, %room_id, "client assigned to room");
        }
    }

    // -----------------------------------------------------------------------
    // Spawn outcomes
    // -----------------------------------------------------------------------

    pub(crate) fn handle_spawn_outcome(&mut self, outcome: SpawnOutcome) {
        let SpawnOutcome {
            room_id,
            generation,
            result,
        } = outcome;

        if !self.registry.expects(&room_id, generation) {
            // Dropping the outcome terminates its room server.
            tracing::warn!(%room_id, generation, "ignoring stale spawn outcome");
            return;
        }

        match result {
            Ok(ready) => {
                let control = self.mux.register(ready.control, ready.decoder);
                match self
                    .registry
                    .mark_ready(&room_id, generation, ready.launched, control, ready.clients)
                {
                    Ok(waiters) => {
                        let response = self.assignment_for(&room_id);
                        for waiter in waiters {
                            self.respond(waiter, response.clone());
                        }
                    }
                    Err(e) => {
                        tracing::error!(%room_id, error = %e, "could not mark room ready");
                        let _ = self.mux.close(control);
                    }
                }
            }
            Err(failure) => {
                tracing::error!(%room_id, error = %failure, "room unavailable");
                match self.registry.fail(&room_id, generation) {
                    Ok(waiters) => {
                        let response = Message::error(ErrorKind::RoomUnavailable, failure.to_string());
                        for waiter in waiters {
                            self.respond(waiter, response.clone());
                        }
                    }
                    Err(e) => tracing::error!(%room_id, error = %e, "could not record failure"),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Control links
    // -----------------------------------------------------------------------

    fn handle_control_frame(&mut self, room_id: RoomId, frame: Frame) {
        match frame.message {
            Message::RoomStatus(RoomStatus {
                room_id: reported,
                clients,
                idle,
            }) => {
                if reported != room_id {
                    tracing::warn!(%room_id, %reported, "status for another room on control link");
                    return;
                }
                if let Err(e) = self.registry.update_occupancy(&room_id, clients) {
                    tracing::debug!(%room_id, error = %e, "status for unknown room");
                    return;
                }
                tracing::debug!(%room_id, clients, idle, "room status");
                if idle {
                    tracing::info!(%room_id, "room idle past grace period");
                    self.reclaim_room(&room_id);
                }
            }
            other => {
                tracing::debug!(
                    %room_id,
                    message_type = %other.message_type(),
                    "ignoring message on control link"
                );
            }
        }
    }

    /// Removes a room from the registry, hangs up its control link, and
    /// fails any requests still waiting on it.
    pub(crate) fn reclaim_room(&mut self, room_id: &RoomId) {
        let mut descriptor = match self.registry.reclaim(room_id) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::debug!(%room_id, error = %e, "nothing to reclaim");
                return;
            }
        };
        if let Some(control) = descriptor.control {
            let _ = self.mux.close(control);
        }
        let waiters = descriptor.take_waiters();
        if !waiters.is_empty() {
            let e = RequestError::Closing(room_id.clone());
            let response = Message::error(e.kind(), e.to_string());
            for waiter in waiters {
                self.respond(waiter, response.clone());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    pub(crate) fn housekeeping(&mut self) {
        let now = Instant::now();
        let evicted = self.cache.evict_expired(now);
        if evicted > 0 {
            tracing::trace!(evicted, "response cache evicted");
        }
        for conn in self.sessions.idle(now) {
            tracing::info!(%conn, "closing idle session");
            let _ = self.mux.close(conn);
            self.sessions.close(conn);
        }
    }

    fn reply(&self, conn: ConnectionId, request_id: RequestId, message: Message) {
        if let Err(e) = self.mux.send(conn, &Frame::new(request_id, message)) {
            tracing::debug!(%conn, %request_id, error = %e, "reply dropped");
        }
    }
}
