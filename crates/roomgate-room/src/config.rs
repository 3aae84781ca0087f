//! Room server configuration and lifecycle state machine.

use std::time::Duration;

use roomgate_protocol::DEFAULT_MAX_FRAME_LEN;
use roomgate_session::{ResponseCache, SessionConfig};
use roomgate_tick::TickConfig;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RoomServerConfig
// ---------------------------------------------------------------------------

/// Configuration for one room server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomServerConfig {
    /// Address to listen on. Port 0 lets the OS choose; the chosen
    /// address is reported back to the dispatcher.
    pub bind: String,

    /// How long the room may stay empty before it reports itself idle.
    pub grace: Duration,

    /// The grid runs from `0` to `dimension` on both axes.
    pub dimension: i32,

    /// How long answered requests stay in the response cache.
    pub response_ttl: Duration,

    /// Round length. Each tick ends a round and evicts expired cache
    /// entries.
    pub round: TickConfig,

    /// Idle-connection sweep.
    pub session: SessionConfig,

    pub max_frame_len: usize,

    /// Fixes item placement, for reproducible worlds.
    pub item_seed: Option<u64>,
}

impl Default for RoomServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            grace: Duration::from_secs(5),
            dimension: 8,
            response_ttl: ResponseCache::DEFAULT_TTL,
            round: TickConfig::default(),
            session: SessionConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            item_seed: None,
        }
    }
}

impl RoomServerConfig {
    /// Smallest grid that fits the fixed chest and a free centre.
    pub const MIN_DIMENSION: i32 = 2;

    /// Largest grid a room will build. Item placement walks every tile.
    pub const MAX_DIMENSION: i32 = 256;

    /// Clamp out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.dimension < Self::MIN_DIMENSION {
            tracing::warn!(
                dimension = self.dimension,
                min = Self::MIN_DIMENSION,
                "room dimension too small, clamping"
            );
            self.dimension = Self::MIN_DIMENSION;
        } else if self.dimension > Self::MAX_DIMENSION {
            tracing::warn!(
                dimension = self.dimension,
                max = Self::MAX_DIMENSION,
                "room dimension too large, clamping"
            );
            self.dimension = Self::MAX_DIMENSION;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// RoomServerState
// ---------------------------------------------------------------------------

/// The lifecycle of a room server process.
///
/// ```text
/// Serving → Draining → Stopped
///    └──────────────────↗      (control link lost)
/// ```
///
/// - **Serving**: accepting connections and gameplay requests.
/// - **Draining**: the grace period ran out with nobody connected. New
///   clients are answered with `RoomUnavailable` while the server waits
///   for the dispatcher to hang up the control link.
/// - **Stopped**: the loop exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomServerState {
    Serving,
    Draining,
    Stopped,
}

impl RoomServerState {
    /// Returns `true` while new clients may join.
    pub fn is_joinable(&self) -> bool {
        matches!(self, Self::Serving)
    }

    /// Returns `true` if transitioning to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Serving, Self::Draining)
                | (Self::Serving, Self::Stopped)
                | (Self::Draining, Self::Stopped)
        )
    }
}

impl std::fmt::Display for RoomServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serving => write!(f, "Serving"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
