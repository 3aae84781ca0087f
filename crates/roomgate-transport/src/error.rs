use roomgate_protocol::FramingError;

use crate::ConnectionId;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Binding the listener failed.
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    /// Querying the listener's address failed.
    #[error("local address unavailable: {0}")]
    LocalAddr(#[source] std::io::Error),

    /// The multiplexer has no listener.
    #[error("not listening")]
    NotListening,

    /// The connection is not (or no longer) part of the multiplexer.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// An outgoing frame could not be encoded.
    #[error(transparent)]
    Framing(#[from] FramingError),
}
