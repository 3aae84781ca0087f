//! Client sessions and the request/retry protocol for Roomgate.
//!
//! This crate holds both halves of "a request is applied at most once,
//! even when responses get lost":
//!
//! 1. **Server side**: [`SessionManager`] tracks who is on which
//!    connection, and [`ResponseCache`] recognises retried request ids.
//! 2. **Client side**: [`RetryTracker`] decides when to resend, and
//!    [`RequestClient`] drives it over a real TCP connection.
//!
//! # How it fits in the stack
//!
//! ```text
//! Dispatcher / Room server (above)  ← own a SessionManager + ResponseCache
//!     ↕
//! Session Layer (this crate)
//!     ↕
//! Transport + Protocol (below)      ← ConnectionId, Frame, RequestId
//! ```

mod client;
mod error;
mod manager;
mod replay;
mod retry;
mod session;

pub use client::RequestClient;
pub use error::{ClientError, SessionError};
pub use manager::{Identified, SessionManager};
pub use replay::{Admission, ResponseCache};
pub use retry::{PendingRequest, RetryDecision, RetryPolicy, RetryTracker};
pub use session::{ClientSession, Location, SessionConfig};
