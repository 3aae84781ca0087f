//! # Roomgate
//!
//! A dispatcher that routes clients to per-room servers.
//!
//! Clients connect to the [`Dispatcher`] first. When one asks for a room,
//! the dispatcher looks it up in its [`Registry`]; if no server is running
//! for it, one is launched through a [`RoomLauncher`] and the request is
//! parked until the room answers its readiness handshake. The client then
//! talks to the room server directly until it leaves.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roomgate::{DispatcherBuilder, TaskLauncher};
//!
//! # async fn demo() -> Result<(), roomgate::RoomgateError> {
//! let dispatcher = DispatcherBuilder::new()
//!     .bind("127.0.0.1:7000")
//!     .build(TaskLauncher::default())
//!     .await?;
//! dispatcher.run().await
//! # }
//! ```
//!
//! The `roomgate` binary wraps the same API: `roomgate dispatcher` runs a
//! dispatcher, `roomgate room` runs a single room server (which is what
//! [`ProcessLauncher`] starts).

mod config;
mod dispatcher;
mod error;
mod handler;
mod launcher;
mod registry;

pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{LaunchError, RegistryError, RequestError, RoomgateError, SpawnFailure};
pub use launcher::{
    LaunchedRoom, ProcessLauncher, READY_PREFIX, RoomLauncher, RoomProcess, TaskLauncher,
    handshake, parse_ready_line,
};
pub use registry::{
    ReadyRoom, Registry, RoomDescriptor, SpawnOutcome, SpawnPolicy, Waiter, launch_with_retries,
};

/// Everything needed to run or talk to a Roomgate deployment.
pub mod prelude {
    pub use crate::{Dispatcher, DispatcherBuilder, DispatcherConfig, ProcessLauncher, RoomLauncher, RoomgateError, TaskLauncher};
    pub use roomgate_protocol::{ClientId, Direction, Message, Position, RoomId};
    pub use roomgate_room::{RoomServer, RoomServerConfig};
    pub use roomgate_session::{RequestClient, RetryPolicy};
}
