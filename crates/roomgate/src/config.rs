//! Dispatcher configuration.

use std::time::Duration;

use roomgate_protocol::DEFAULT_MAX_FRAME_LEN;
use roomgate_session::{ResponseCache, SessionConfig};
use roomgate_tick::TickConfig;
use serde::{Deserialize, Serialize};

use crate::registry::SpawnPolicy;

/// Configuration for the central dispatcher.
///
/// All fields have defaults; override the ones you care about:
///
/// ```rust,ignore
/// let config = DispatcherConfig {
///     bind: "0.0.0.0:7000".into(),
///     advertise_host: Some("game.example.com".into()),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Address the dispatcher listens on.
    pub bind: String,

    /// Host name handed to clients in `ROOM_ASSIGNED`. Defaults to the IP
    /// the room server is listening on.
    pub advertise_host: Option<String>,

    /// How long a room may stay empty before it is reclaimed. Passed to
    /// every room server the dispatcher launches.
    pub grace: Duration,

    /// Upper bound for one launch attempt, covering process start and the
    /// readiness handshake.
    pub startup_timeout: Duration,

    /// Launch attempts per room before giving up.
    pub max_spawn_attempts: u32,

    /// How long answered requests stay in the response cache.
    pub response_ttl: Duration,

    /// Idle-connection sweep.
    pub session: SessionConfig,

    /// Housekeeping interval (cache eviction, idle sweep).
    pub housekeeping: TickConfig,

    pub max_frame_len: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let spawn = SpawnPolicy::default();
        Self {
            bind: "127.0.0.1:7000".to_string(),
            advertise_host: None,
            grace: Duration::from_secs(5),
            startup_timeout: spawn.startup_timeout,
            max_spawn_attempts: spawn.max_attempts,
            response_ttl: ResponseCache::DEFAULT_TTL,
            session: SessionConfig::default(),
            housekeeping: TickConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl DispatcherConfig {
    /// Clamp out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.max_spawn_attempts == 0 {
            tracing::warn!("max_spawn_attempts is 0, using 1");
            self.max_spawn_attempts = 1;
        }
        if self.startup_timeout.is_zero() {
            let fallback = SpawnPolicy::default().startup_timeout;
            tracing::warn!(?fallback, "startup_timeout is 0, using default");
            self.startup_timeout = fallback;
        }
        self.housekeeping = self.housekeeping.validated();
        self
    }

    /// The launch retry policy these settings describe.
    pub fn spawn_policy(&self) -> SpawnPolicy {
        SpawnPolicy {
            max_attempts: self.max_spawn_attempts,
            startup_timeout: self.startup_timeout,
            max_frame_len: self.max_frame_len,
        }
    }
}
