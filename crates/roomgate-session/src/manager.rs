//! The session manager: tracks every connection a server is serving.
//!
//! Sessions are keyed by [`ConnectionId`], with a second index from
//! [`ClientId`] to the connection currently bound to it. That index is
//! what enforces "one connection per client per server": binding a client
//! id that is already bound elsewhere displaces the older connection, and
//! the caller closes it.
//!
//! # Concurrency note
//!
//! `SessionManager` is a plain struct with `HashMap`s. It is owned by a
//! single control loop (the dispatcher's or a room server's) and never
//! shared, so it needs no locking.

use std::collections::{HashMap, HashSet};

use roomgate_protocol::{ClientId, RequestId, RoomId};
use roomgate_transport::ConnectionId;
use tokio::time::Instant;

use crate::{ClientSession, Location, SessionConfig, SessionError};

/// The result of binding a client id to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identified {
    pub client_id: ClientId,
    /// `true` if the id was assigned by this call.
    pub assigned: bool,
    /// `true` if this call started a new session for the client, as
    /// opposed to repeating `CONNECT` on an already identified connection.
    pub new_session: bool,
    /// An older connection that was bound to the same client id. It has
    /// been removed from the manager and should be closed.
    pub displaced: Option<ConnectionId>,
}

/// Manages all sessions of one server.
pub struct SessionManager {
    sessions: HashMap<ConnectionId, ClientSession>,
    by_client: HashMap<ClientId, ConnectionId>,
    /// The last room each client was sent to. Survives disconnects so a
    /// returning client can be told where it was.
    last_rooms: HashMap<ClientId, RoomId>,
    /// Every client id ever bound here. Assigned ids skip these.
    known: HashSet<ClientId>,
    next_client_id: u64,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            by_client: HashMap::new(),
            last_rooms: HashMap::new(),
            known: HashSet::new(),
            next_client_id: 1,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts tracking a newly accepted connection.
    pub fn open(&mut self, connection: ConnectionId, now: Instant) -> &ClientSession {
        self.sessions
            .entry(connection)
            .or_insert_with(|| ClientSession::new(connection, now))
    }

    /// Binds a client id to a connection, assigning a fresh id when the
    /// client did not present one.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`] if the connection is unknown.
    /// - [`SessionError::AlreadyIdentified`] if the connection is already
    ///   bound to a *different* client id.
    /// - [`SessionError::ClientIdsExhausted`] if no id is left to assign.
    pub fn identify(
        &mut self,
        connection: ConnectionId,
        requested: Option<ClientId>,
    ) -> Result<Identified, SessionError> {
        let current = self
            .sessions
            .get(&connection)
            .ok_or(SessionError::NotFound(connection))?
            .client_id;

        if let Some(existing) = current {
            return match requested {
                Some(id) if id != existing => Err(SessionError::AlreadyIdentified {
                    connection,
                    client_id: existing,
                }),
                _ => Ok(Identified {
                    client_id: existing,
                    assigned: false,
                    new_session: false,
                    displaced: None,
                }),
            };
        }

        let (client_id, assigned) = match requested {
            Some(id) => (id, false),
            None => (self.allocate_client_id()?, true),
        };
        self.known.insert(client_id);

        let displaced = self
            .by_client
            .insert(client_id, connection)
            .filter(|old| *old != connection);
        if let Some(old) = displaced {
            self.sessions.remove(&old);
            tracing::info!(%client_id, %old, new = %connection, "client re-bound to new connection");
        }

        if let Some(session) = self.sessions.get_mut(&connection) {
            session.client_id = Some(client_id);
        }

        Ok(Identified {
            client_id,
            assigned,
            new_session: true,
            displaced,
        })
    }

    /// The lowest unused id at or above the counter. Ids presented by
    /// clients do not move the counter.
    fn allocate_client_id(&mut self) -> Result<ClientId, SessionError> {
        loop {
            let id = ClientId(self.next_client_id);
            self.next_client_id = self
                .next_client_id
                .checked_add(1)
                .ok_or(SessionError::ClientIdsExhausted)?;
            if !self.known.contains(&id) {
                return Ok(id);
            }
        }
    }

    /// Records activity on a connection.
    pub fn touch(&mut self, connection: ConnectionId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&connection) {
            session.last_activity = now;
        }
    }

    /// Stops tracking a connection. Returns the session if it existed.
    pub fn close(&mut self, connection: ConnectionId) -> Option<ClientSession> {
        let session = self.sessions.remove(&connection)?;
        if let Some(client_id) = session.client_id {
            if self.by_client.get(&client_id) == Some(&connection) {
                self.by_client.remove(&client_id);
            }
        }
        Some(session)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<&ClientSession> {
        self.sessions.get(&connection)
    }

    /// The client bound to a connection, if `CONNECT` has been handled.
    pub fn client_of(&self, connection: ConnectionId) -> Option<ClientId> {
        self.sessions.get(&connection).and_then(|s| s.client_id)
    }

    /// The connection a client is currently bound to.
    pub fn connection_of(&self, client_id: ClientId) -> Option<ConnectionId> {
        self.by_client.get(&client_id).copied()
    }

    /// Moves a session to a new location, remembering rooms per client.
    pub fn set_location(
        &mut self,
        connection: ConnectionId,
        location: Location,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&connection)
            .ok_or(SessionError::NotFound(connection))?;
        let client_id = session
            .client_id
            .ok_or(SessionError::NotIdentified(connection))?;
        if let Location::Room(room_id) = &location {
            self.last_rooms.insert(client_id, room_id.clone());
        }
        session.location = location;
        Ok(())
    }

    /// The last room a client was sent to, even across reconnects.
    pub fn last_room(&self, client_id: ClientId) -> Option<&RoomId> {
        self.last_rooms.get(&client_id)
    }

    /// Marks a request as being processed. Returns `false` if it already
    /// was.
    pub fn begin_request(&mut self, connection: ConnectionId, request: RequestId) -> bool {
        self.sessions
            .get_mut(&connection)
            .is_some_and(|s| s.begin(request))
    }

    /// Marks a request as answered.
    pub fn finish_request(&mut self, connection: ConnectionId, request: RequestId) {
        if let Some(session) = self.sessions.get_mut(&connection) {
            session.finish(request);
        }
    }

    /// Connections silent for longer than the idle timeout.
    pub fn idle(&self, now: Instant) -> Vec<ConnectionId> {
        self.sessions
            .values()
            .filter(|s| s.idle_for(now) >= self.config.idle_timeout)
            .map(|s| s.connection)
            .collect()
    }

    /// Number of identified clients.
    pub fn client_count(&self) -> usize {
        self.by_client.len()
    }

    /// Number of tracked connections, identified or not.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Every identified client and its connection.
    pub fn clients(&self) -> impl Iterator<Item = (ClientId, ConnectionId)> + '_ {
        self.by_client.iter().map(|(c, conn)| (*c, *conn))
    }
}

// =========================================================================
// Tests
// =========================================================================
