//! `Dispatcher` builder and control loop.
//!
//! The dispatcher is the front door. Clients connect here first, get a
//! client id, and ask for a room; the dispatcher answers with the address
//! of the room's server, launching one if needed.
//!
//! Everything runs on one loop:
//!
//! ```text
//! loop {
//!     select! {
//!         shutdown           → reclaim every room, return
//!         mux.wait()         → client frames, control-link frames, disconnects
//!         outcomes.recv()    → a launch task finished
//!         housekeeping.tick  → evict old responses, close idle sessions
//!     }
//! }
//! ```
//!
//! Launches never block the loop: a room being launched is a `Spawning`
//! descriptor, and requests for it are parked on the descriptor until the
//! launch task's [`SpawnOutcome`] comes back.

use std::future::{Future, pending};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomgate_session::{ResponseCache, SessionManager};
use roomgate_tick::Ticker;
use roomgate_transport::Multiplexer;
use tokio::sync::mpsc;

use crate::registry::{Registry, SpawnOutcome};
use crate::{DispatcherConfig, RoomLauncher, RoomgateError};

/// Builder for configuring and starting a dispatcher.
///
/// # Example
///
/// ```rust,ignore
/// let dispatcher = DispatcherBuilder::new()
///     .bind("0.0.0.0:7000")
///     .grace(Duration::from_secs(10))
///     .build(TaskLauncher::default())
///     .await?;
/// dispatcher.run().await
/// ```
#[derive(Debug, Clone, Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to listen on.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind = addr.to_string();
        self
    }

    /// Sets the host handed to clients in `ROOM_ASSIGNED`.
    pub fn advertise_host(mut self, host: &str) -> Self {
        self.config.advertise_host = Some(host.to_string());
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.config.grace = grace;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn max_spawn_attempts(mut self, attempts: u32) -> Self {
        self.config.max_spawn_attempts = attempts;
        self
    }

    /// Binds the listener. Rooms will be started with `launcher`.
    pub async fn build<L: RoomLauncher>(self, launcher: L) -> Result<Dispatcher<L>, RoomgateError> {
        let config = self.config.validated();
        let mux = Multiplexer::bind(config.bind.as_str(), config.max_frame_len).await?;
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        Ok(Dispatcher {
            sessions: SessionManager::new(config.session.clone()),
            cache: ResponseCache::new(config.response_ttl),
            registry: Registry::new(config.spawn_policy()),
            housekeeping: Ticker::new(config.housekeeping.clone()),
            launcher: Arc::new(launcher),
            outcomes_tx,
            outcomes_rx,
            mux,
            config,
        })
    }
}

/// A bound dispatcher, made by [`DispatcherBuilder::build`]. Call
/// [`run`](Self::run) to start serving.
pub struct Dispatcher<L: RoomLauncher> {
    pub(crate) config: DispatcherConfig,
    pub(crate) mux: Multiplexer,
    pub(crate) sessions: SessionManager,
    pub(crate) cache: ResponseCache,
    pub(crate) registry: Registry,
    pub(crate) launcher: Arc<L>,
    pub(crate) outcomes_tx: mpsc::UnboundedSender<SpawnOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<SpawnOutcome>,
    housekeeping: Ticker,
}

impl<L: RoomLauncher> Dispatcher<L> {
    /// Returns the local address the dispatcher is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, RoomgateError> {
        Ok(self.mux.local_addr()?)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Serves until the process is terminated.
    pub async fn run(self) -> Result<(), RoomgateError> {
        self.run_until(pending()).await
    }

    /// Serves until `shutdown` completes, then reclaims every room.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<(), RoomgateError> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "dispatcher running");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                events = self.mux.wait() => {
                    for event in events {
                        self.handle_event(event);
                    }
                }
                Some(outcome) = self.outcomes_rx.recv() => self.handle_spawn_outcome(outcome),
                _ = self.housekeeping.tick() => self.housekeeping(),
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        let rooms = self.registry.room_ids();
        tracing::info!(rooms = rooms.len(), "dispatcher shutting down");
        for room_id in rooms {
            self.reclaim_room(&room_id);
        }
    }
}
