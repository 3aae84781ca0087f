//! Server-side duplicate suppression.
//!
//! A client that times out resends the *same* request id. The server must
//! not apply that request twice. [`ResponseCache`] remembers, per
//! `(ClientId, RequestId)`, whether a request is still being processed or
//! what its response was:
//!
//! ```text
//!   admit() ──→ Fresh     → process, then complete()
//!           ──→ InFlight  → drop silently; the response goes to the
//!                           newest connection when it is ready
//!           ──→ Replay(m) → send m again, no side effects
//! ```
//!
//! Completed entries expire after a TTL that is longer than the client's
//! whole retry window, so every retry a client can still send finds its
//! entry.
//!
//! Request ids are only unique within one session. When a client starts a
//! new session its entries are dropped with
//! [`forget_client`](ResponseCache::forget_client), so a reused id is a new
//! request rather than a replay.

use std::collections::HashMap;
use std::time::Duration;

use roomgate_protocol::{ClientId, Message, RequestId};
use roomgate_transport::ConnectionId;
use tokio::time::Instant;

/// What to do with an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First time this id has been seen. Process it.
    Fresh,
    /// Still being processed. Do nothing now.
    InFlight,
    /// Already answered. Re-send this response.
    Replay(Message),
}

#[derive(Debug)]
enum EntryState {
    Pending,
    Done(Message),
}

#[derive(Debug)]
struct Entry {
    state: EntryState,
    reply_to: ConnectionId,
    updated: Instant,
}

/// Response cache keyed by `(ClientId, RequestId)`.
#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<(ClientId, RequestId), Entry>,
    ttl: Duration,
}

impl ResponseCache {
    /// Default TTL for completed responses.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Classifies a request and, for fresh ones, records it as pending.
    ///
    /// `connection` is where the request arrived. For an in-flight
    /// duplicate it becomes the new reply target, since the client may
    /// have reconnected since the first attempt.
    pub fn admit(
        &mut self,
        client: ClientId,
        request: RequestId,
        connection: ConnectionId,
        now: Instant,
    ) -> Admission {
        match self.entries.get_mut(&(client, request)) {
            None => {
                self.entries.insert(
                    (client, request),
                    Entry {
                        state: EntryState::Pending,
                        reply_to: connection,
                        updated: now,
                    },
                );
                Admission::Fresh
            }
            Some(entry) => {
                entry.reply_to = connection;
                match &entry.state {
                    EntryState::Pending => Admission::InFlight,
                    EntryState::Done(response) => Admission::Replay(response.clone()),
                }
            }
        }
    }

    /// Stores the response to a request. Returns the connection the
    /// response should be sent to.
    pub fn complete(
        &mut self,
        client: ClientId,
        request: RequestId,
        response: Message,
        now: Instant,
    ) -> Option<ConnectionId> {
        let entry = self.entries.get_mut(&(client, request))?;
        entry.state = EntryState::Done(response);
        entry.updated = now;
        Some(entry.reply_to)
    }

    /// Where the response to a pending request should go.
    pub fn reply_target(&self, client: ClientId, request: RequestId) -> Option<ConnectionId> {
        self.entries.get(&(client, request)).map(|e| e.reply_to)
    }

    /// Drops every entry of a client. Called when the client starts a new
    /// session. Responses still pending go to their original connection.
    /// Returns how many entries were dropped.
    pub fn forget_client(&mut self, client: ClientId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(owner, _), _| *owner != client);
        before - self.entries.len()
    }

    /// Removes completed entries older than the TTL. Pending entries are
    /// kept until they complete. Returns how many entries were dropped.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| match entry.state {
            EntryState::Pending => true,
            EntryState::Done(_) => now.saturating_duration_since(entry.updated) < ttl,
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}
