//! The dispatcher's table of room servers.
//!
//! Every room the dispatcher knows about has exactly one
//! [`RoomDescriptor`], which walks through the [`RoomPhase`] state
//! machine:
//!
//! ```text
//!            create            mark_ready           reclaim
//! (absent) ─────────▶ Spawning ──────────▶ Ready ──────────▶ Draining ─▶ Reclaimed
//!                        │                                                  ▲
//!                        └────────────────── fail ──────────────────────────┘
//! ```
//!
//! A reclaimed descriptor is removed from the table. Requesting the same
//! room again creates a fresh descriptor with a new *generation*, so a
//! late spawn outcome for the old one can be recognised and discarded.
//!
//! The registry is plain data owned by the dispatcher loop. Launches run
//! on their own tasks and report back through an mpsc channel as
//! [`SpawnOutcome`]s, which the loop feeds into [`Registry::mark_ready`]
//! or [`Registry::fail`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomgate_protocol::{
    ClientId, DEFAULT_MAX_FRAME_LEN, FrameDecoder, RequestId, RoomId, RoomListEntry, RoomPhase,
};
use roomgate_transport::ConnectionId;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::launcher::{LaunchedRoom, RoomLauncher, handshake};
use crate::{LaunchError, RegistryError, SpawnFailure};

// ---------------------------------------------------------------------------
// Spawn policy and outcomes
// ---------------------------------------------------------------------------

/// How hard to try when starting a room server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnPolicy {
    /// Attempts before the room is declared unavailable.
    pub max_attempts: u32,

    /// Bound on one attempt: launch plus readiness handshake.
    pub startup_timeout: Duration,

    /// Frame limit for the control link.
    pub max_frame_len: usize,
}

impl Default for SpawnPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            startup_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// A room server that launched and answered the readiness handshake.
#[derive(Debug)]
pub struct ReadyRoom {
    pub launched: LaunchedRoom,
    /// The control link, not yet registered with a multiplexer.
    pub control: TcpStream,
    pub decoder: FrameDecoder,
    pub clients: usize,
}

/// The result of a launch task, delivered to the dispatcher loop.
#[derive(Debug)]
pub struct SpawnOutcome {
    pub room_id: RoomId,
    pub generation: u64,
    pub result: Result<ReadyRoom, SpawnFailure>,
}

/// A request parked until its room finishes spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub connection: ConnectionId,
    pub client_id: ClientId,
    pub request_id: RequestId,
}

// ---------------------------------------------------------------------------
// RoomDescriptor
// ---------------------------------------------------------------------------

/// Everything the dispatcher knows about one room server.
#[derive(Debug)]
pub struct RoomDescriptor {
    pub room_id: RoomId,
    pub generation: u64,
    pub phase: RoomPhase,
    pub created_at: Instant,
    /// Clients on the room server, as last reported.
    pub clients: usize,
    /// Set once the room is ready.
    pub endpoint: Option<SocketAddr>,
    /// The dispatcher's end of the control link.
    pub control: Option<ConnectionId>,
    process: Option<LaunchedRoom>,
    waiters: Vec<Waiter>,
}

impl RoomDescriptor {
    fn new(room_id: RoomId, generation: u64) -> Self {
        Self {
            room_id,
            generation,
            phase: RoomPhase::Spawning,
            created_at: Instant::now(),
            clients: 0,
            endpoint: None,
            control: None,
            process: None,
            waiters: Vec::new(),
        }
    }

    fn transition(&mut self, to: RoomPhase) -> Result<(), RegistryError> {
        if !self.phase.can_transition_to(to) {
            return Err(RegistryError::InvalidTransition {
                room_id: self.room_id.clone(),
                from: self.phase,
                to,
            });
        }
        tracing::debug!(room_id = %self.room_id, from = %self.phase, %to, "room phase");
        self.phase = to;
        Ok(())
    }

    /// Requests waiting for this room to become ready.
    pub fn waiters(&self) -> &[Waiter] {
        &self.waiters
    }

    /// Takes the parked requests, leaving none behind.
    pub fn take_waiters(&mut self) -> Vec<Waiter> {
        std::mem::take(&mut self.waiters)
    }

    pub fn is_ready(&self) -> bool {
        self.phase == RoomPhase::Ready
    }

    fn terminate(&mut self) {
        if let Some(mut launched) = self.process.take() {
            launched.process.terminate();
        }
    }

    /// A row for `ROOM_LIST`.
    pub fn list_entry(&self) -> RoomListEntry {
        RoomListEntry {
            room_id: self.room_id.clone(),
            phase: self.phase,
            clients: self.clients,
            port: self.endpoint.map(|e| e.port()),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Room id → descriptor, plus the generation counter.
#[derive(Debug)]
pub struct Registry {
    rooms: BTreeMap<RoomId, RoomDescriptor>,
    next_generation: u64,
    policy: SpawnPolicy,
}

impl Registry {
    pub fn new(policy: SpawnPolicy) -> Self {
        Self {
            rooms: BTreeMap::new(),
            next_generation: 1,
            policy,
        }
    }

    pub fn policy(&self) -> &SpawnPolicy {
        &self.policy
    }

    pub fn lookup(&self, room_id: &RoomId) -> Option<&RoomDescriptor> {
        self.rooms.get(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Ids of every room in the table.
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    /// Registers a new room in `Spawning` and starts launching it.
    ///
    /// The launch runs on its own task; its [`SpawnOutcome`] arrives on
    /// `outcomes`. Returns the new descriptor's generation.
    pub fn create<L: RoomLauncher>(
        &mut self,
        room_id: RoomId,
        launcher: &Arc<L>,
        outcomes: &mpsc::UnboundedSender<SpawnOutcome>,
    ) -> Result<u64, RegistryError> {
        let generation = self.insert(room_id.clone())?;

        tracing::info!(%room_id, generation, "spawning room server");
        let launcher = Arc::clone(launcher);
        let outcomes = outcomes.clone();
        let policy = self.policy;
        tokio::spawn(async move {
            let result = launch_with_retries(launcher.as_ref(), &room_id, policy).await;
            // The loop may already be gone; the launched room dies with
            // the dropped outcome.
            let _ = outcomes.send(SpawnOutcome {
                room_id,
                generation,
                result,
            });
        });
        Ok(generation)
    }

    /// Adds a `Spawning` descriptor without launching anything.
    fn insert(&mut self, room_id: RoomId) -> Result<u64, RegistryError> {
        if self.rooms.contains_key(&room_id) {
            return Err(RegistryError::AlreadyExists(room_id));
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        self.rooms
            .insert(room_id.clone(), RoomDescriptor::new(room_id, generation));
        Ok(generation)
    }

    /// Parks a request until the room is ready (or has failed).
    pub fn add_waiter(&mut self, room_id: &RoomId, waiter: Waiter) -> Result<(), RegistryError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RegistryError::NotFound(room_id.clone()))?;
        if room.phase != RoomPhase::Spawning {
            return Err(RegistryError::InvalidTransition {
                room_id: room_id.clone(),
                from: room.phase,
                to: RoomPhase::Ready,
            });
        }
        if !room.waiters.contains(&waiter) {
            room.waiters.push(waiter);
        }
        Ok(())
    }

    /// Returns `true` if an outcome for `generation` would be applied.
    pub fn expects(&self, room_id: &RoomId, generation: u64) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|r| r.generation == generation && r.phase == RoomPhase::Spawning)
    }

    /// Applies a successful launch: `Spawning → Ready`.
    ///
    /// Returns the parked requests, which should now be answered. A stale
    /// outcome is rejected and its room server terminated.
    pub fn mark_ready(
        &mut self,
        room_id: &RoomId,
        generation: u64,
        launched: LaunchedRoom,
        control: ConnectionId,
        clients: usize,
    ) -> Result<Vec<Waiter>, RegistryError> {
        if !self.expects(room_id, generation) {
            let mut launched = launched;
            launched.process.terminate();
            tracing::warn!(%room_id, generation, "discarding stale room server");
            return Err(RegistryError::StaleGeneration {
                room_id: room_id.clone(),
                generation,
            });
        }
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RegistryError::NotFound(room_id.clone()))?;
        room.transition(RoomPhase::Ready)?;
        room.endpoint = Some(launched.endpoint);
        room.process = Some(launched);
        room.control = Some(control);
        room.clients = clients;

        tracing::info!(
            %room_id,
            generation,
            endpoint = ?room.endpoint,
            startup = ?room.created_at.elapsed(),
            "room server ready"
        );
        Ok(room.take_waiters())
    }

    /// Applies a failed launch: `Spawning → Reclaimed`, and the descriptor
    /// is removed. Returns the parked requests, which should be told the
    /// room is unavailable.
    pub fn fail(&mut self, room_id: &RoomId, generation: u64) -> Result<Vec<Waiter>, RegistryError> {
        if !self.expects(room_id, generation) {
            return Err(RegistryError::StaleGeneration {
                room_id: room_id.clone(),
                generation,
            });
        }
        let mut room = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| RegistryError::NotFound(room_id.clone()))?;
        room.transition(RoomPhase::Reclaimed)?;
        Ok(room.take_waiters())
    }

    /// Tears a room down: `Ready → Draining → Reclaimed` (or straight to
    /// `Reclaimed` while still spawning). Terminates the room server and
    /// removes the descriptor, which is returned so the caller can close
    /// the control link and answer any waiters.
    pub fn reclaim(&mut self, room_id: &RoomId) -> Result<RoomDescriptor, RegistryError> {
        let mut room = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| RegistryError::NotFound(room_id.clone()))?;
        if room.phase == RoomPhase::Ready {
            room.transition(RoomPhase::Draining)?;
        }
        room.transition(RoomPhase::Reclaimed)?;
        room.terminate();

        tracing::info!(
            %room_id,
            generation = room.generation,
            age = ?room.created_at.elapsed(),
            "room reclaimed"
        );
        Ok(room)
    }

    /// Records occupancy reported by the room server.
    pub fn update_occupancy(&mut self, room_id: &RoomId, clients: usize) -> Result<(), RegistryError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RegistryError::NotFound(room_id.clone()))?;
        room.clients = clients;
        Ok(())
    }

    /// The room whose control link is `connection`.
    pub fn room_for_control(&self, connection: ConnectionId) -> Option<&RoomId> {
        self.rooms
            .values()
            .find(|r| r.control == Some(connection))
            .map(|r| &r.room_id)
    }

    /// One entry per room, ordered by room id.
    pub fn list(&self) -> Vec<RoomListEntry> {
        self.rooms.values().map(RoomDescriptor::list_entry).collect()
    }
}

// ---------------------------------------------------------------------------
// Launch task
// ---------------------------------------------------------------------------

/// Launches a room server and opens its control link, retrying up to
/// `policy.max_attempts` times.
pub async fn launch_with_retries<L: RoomLauncher>(
    launcher: &L,
    room_id: &RoomId,
    policy: SpawnPolicy,
) -> Result<ReadyRoom, SpawnFailure> {
    let attempts = policy.max_attempts.max(1);
    let mut last = LaunchError::NoReadyLine;

    for attempt in 1..=attempts {
        match time::timeout(policy.startup_timeout, launch_once(launcher, room_id, policy)).await {
            Ok(Ok(ready)) => return Ok(ready),
            Ok(Err(e)) => {
                tracing::warn!(%room_id, attempt, attempts, error = %e, "room launch failed");
                last = e;
            }
            Err(_elapsed) => {
                tracing::warn!(
                    %room_id,
                    attempt,
                    attempts,
                    timeout = ?policy.startup_timeout,
                    "room launch timed out"
                );
                last = LaunchError::TimedOut(policy.startup_timeout);
            }
        }
    }

    Err(SpawnFailure {
        room_id: room_id.clone(),
        attempts,
        last,
    })
}

async fn launch_once<L: RoomLauncher>(
    launcher: &L,
    room_id: &RoomId,
    policy: SpawnPolicy,
) -> Result<ReadyRoom, LaunchError> {
    let launched = launcher.launch(room_id).await?;
    // On error `launched` is dropped here, which terminates the room.
    let (control, decoder, ready) = handshake(launched.endpoint, room_id, policy.max_frame_len).await?;
    Ok(ReadyRoom {
        launched,
        control,
        decoder,
        clients: ready.clients,
    })
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::TaskLauncher;

    fn room(id: &str) -> RoomId {
        RoomId::new(id).unwrap()
    }

    fn waiter(n: u64) -> Waiter {
        Waiter {
            connection: ConnectionId::new(n),
            client_id: ClientId(n),
            request_id: RequestId(1),
        }
    }

    async fn launched(id: &str) -> LaunchedRoom {
        TaskLauncher::default().launch(&room(id)).await.unwrap()
    }

    // =====================================================================
    // Bookkeeping
    // =====================================================================

    #[test]
    fn test_insert_twice_is_rejected() {
        let mut registry = Registry::new(SpawnPolicy::default());
        registry.insert(room("arena1")).unwrap();
        assert!(matches!(
            registry.insert(room("arena1")),
            Err(RegistryError::AlreadyExists(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_generations_increase() {
        let mut registry = Registry::new(SpawnPolicy::default());
        let first = registry.insert(room("arena1")).unwrap();
        let second = registry.insert(room("arena2")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_add_waiter_ignores_duplicates() {
        let mut registry = Registry::new(SpawnPolicy::default());
        registry.insert(room("arena1")).unwrap();
        registry.add_waiter(&room("arena1"), waiter(1)).unwrap();
        registry.add_waiter(&room("arena1"), waiter(1)).unwrap();
        registry.add_waiter(&room("arena1"), waiter(2)).unwrap();
        assert_eq!(registry.lookup(&room("arena1")).unwrap().waiters().len(), 2);
    }

    #[test]
    fn test_fail_removes_descriptor_and_returns_waiters() {
        let mut registry = Registry::new(SpawnPolicy::default());
        let generation = registry.insert(room("arena1")).unwrap();
        registry.add_waiter(&room("arena1"), waiter(1)).unwrap();

        let waiters = registry.fail(&room("arena1"), generation).unwrap();
        assert_eq!(waiters, vec![waiter(1)]);
        assert!(registry.lookup(&room("arena1")).is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_fail_for_stale_generation_is_rejected() {
        let mut registry = Registry::new(SpawnPolicy::default());
        let generation = registry.insert(room("arena1")).unwrap();
        assert!(matches!(
            registry.fail(&room("arena1"), generation + 1),
            Err(RegistryError::StaleGeneration { .. })
        ));
        assert!(registry.lookup(&room("arena1")).is_some());
    }

    #[test]
    fn test_reclaim_unknown_room_is_not_found() {
        let mut registry = Registry::new(SpawnPolicy::default());
        assert!(matches!(
            registry.reclaim(&room("nowhere")),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_reclaim_while_spawning_goes_straight_to_reclaimed() {
        let mut registry = Registry::new(SpawnPolicy::default());
        registry.insert(room("arena1")).unwrap();
        registry.add_waiter(&room("arena1"), waiter(1)).unwrap();

        let mut descriptor = registry.reclaim(&room("arena1")).unwrap();
        assert_eq!(descriptor.phase, RoomPhase::Reclaimed);
        assert_eq!(descriptor.take_waiters(), vec![waiter(1)]);
        assert!(registry.is_empty());
    }

    // =====================================================================
    // With real room servers
    // =====================================================================

    #[tokio::test]
    async fn test_mark_ready_then_reclaim() {
        let mut registry = Registry::new(SpawnPolicy::default());
        let generation = registry.insert(room("arena1")).unwrap();
        registry.add_waiter(&room("arena1"), waiter(1)).unwrap();

        let launched = launched("arena1").await;
        let endpoint = launched.endpoint;
        let waiters = registry
            .mark_ready(&room("arena1"), generation, launched, ConnectionId::new(9), 0)
            .unwrap();
        assert_eq!(waiters, vec![waiter(1)]);

        let descriptor = registry.lookup(&room("arena1")).unwrap();
        assert!(descriptor.is_ready());
        assert_eq!(descriptor.endpoint, Some(endpoint));
        assert_eq!(
            registry.room_for_control(ConnectionId::new(9)),
            Some(&room("arena1"))
        );

        let entry = &registry.list()[0];
        assert_eq!(entry.phase, RoomPhase::Ready);
        assert_eq!(entry.port, Some(endpoint.port()));

        let reclaimed = registry.reclaim(&room("arena1")).unwrap();
        assert_eq!(reclaimed.phase, RoomPhase::Reclaimed);
        assert!(registry.room_for_control(ConnectionId::new(9)).is_none());
    }

    #[tokio::test]
    async fn test_mark_ready_for_stale_generation_is_rejected() {
        let mut registry = Registry::new(SpawnPolicy::default());
        let old = registry.insert(room("arena1")).unwrap();
        registry.fail(&room("arena1"), old).unwrap();
        let current = registry.insert(room("arena1")).unwrap();

        let result = registry.mark_ready(
            &room("arena1"),
            old,
            launched("arena1").await,
            ConnectionId::new(1),
            0,
        );
        assert!(matches!(result, Err(RegistryError::StaleGeneration { .. })));
        assert!(registry.expects(&room("arena1"), current));
    }

    #[tokio::test]
    async fn test_launch_with_retries_succeeds_first_time() {
        let ready = launch_with_retries(&TaskLauncher::default(), &room("arena1"), SpawnPolicy::default())
            .await
            .unwrap();
        assert_eq!(ready.clients, 0);
    }
}
