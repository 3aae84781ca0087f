//! Room servers for Roomgate.
//!
//! A room server owns the authoritative state of exactly one room: a
//! square grid, the clients standing on it, and the items placed on it.
//! The dispatcher starts one room server per active room and hands
//! clients its address; from then on clients talk to the room server
//! directly.
//!
//! # Key types
//!
//! - [`RoomServer`]: binds a listener and runs the room's control loop
//! - [`WorldState`]: the grid, clients, and items, with the gameplay rules
//! - [`RoomServerConfig`]: grace period, grid size, round length, ...
//! - [`RoomServerState`]: lifecycle state machine
//!
//! # Quick start
//!
//! ```rust,ignore
//! let room_id = RoomId::new("arena1")?;
//! let server = RoomServer::bind(room_id, RoomServerConfig::default()).await?;
//! println!("listening on {}", server.local_addr()?);
//! server.run().await?;
//! ```

mod config;
mod error;
mod server;
mod world;

pub use config::{RoomServerConfig, RoomServerState};
pub use error::RoomError;
pub use server::RoomServer;
pub use world::{CHEST_POSITION, WorldState};
