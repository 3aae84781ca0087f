//! Transport layer for Roomgate.
//!
//! Provides the [`Multiplexer`], which serves many framed TCP connections
//! from a single control loop, and [`ConnectionId`], the handle every
//! higher layer uses to address a connection.

mod error;
mod multiplexer;

pub use error::TransportError;
pub use multiplexer::{CloseReason, Multiplexer, Readiness, is_transient};

use std::fmt;

/// Opaque identifier for a connection within one multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
