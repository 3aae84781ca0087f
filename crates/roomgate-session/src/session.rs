//! Session types: the server's record of one client connection.
//!
//! A [`ClientSession`] tracks:
//! - WHICH connection it lives on (`ConnectionId`)
//! - WHO the client is, once `CONNECT` has been handled (`ClientId`)
//! - WHERE the client currently is (`Location`)
//! - WHEN it last sent anything (for idle sweeps)
//! - WHAT it still has in flight (request ids being processed)

use std::collections::HashSet;
use std::time::Duration;

use roomgate_protocol::{ClientId, RequestId, RoomId};
use roomgate_transport::ConnectionId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions that send nothing for this long are closed by the
    /// housekeeping sweep.
    ///
    /// Default: 60 seconds.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Where a client currently is, from the dispatcher's point of view.
///
/// ```text
///   Dispatcher ──(ROOM_ASSIGNED)──→ Room(id) ──(CONNECT again)──→ Dispatcher
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Dispatcher,
    Room(RoomId),
}

// ---------------------------------------------------------------------------
// ClientSession
// ---------------------------------------------------------------------------

/// One accepted connection and what the server knows about it.
///
/// Created on accept. Destroyed on disconnect, explicit leave, or idle
/// timeout.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub connection: ConnectionId,
    /// `None` until the client's `CONNECT` has been handled.
    pub client_id: Option<ClientId>,
    pub location: Location,
    pub connected_at: Instant,
    pub last_activity: Instant,
    in_flight: HashSet<RequestId>,
}

impl ClientSession {
    pub fn new(connection: ConnectionId, now: Instant) -> Self {
        Self {
            connection,
            client_id: None,
            location: Location::Dispatcher,
            connected_at: now,
            last_activity: now,
            in_flight: HashSet::new(),
        }
    }

    pub fn is_identified(&self) -> bool {
        self.client_id.is_some()
    }

    /// Request ids this session is still waiting on the server for.
    pub fn in_flight(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.in_flight.iter().copied()
    }

    pub(crate) fn begin(&mut self, request: RequestId) -> bool {
        self.in_flight.insert(request)
    }

    pub(crate) fn finish(&mut self, request: RequestId) -> bool {
        self.in_flight.remove(&request)
    }

    /// How long the session has been silent.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}
