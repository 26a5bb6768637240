//! # Transport Layer
//!
//! The connection engine never touches sockets directly. It hands its outbound
//! buffer to a [`Transport`] and receives inbound bytes as [`NodeEvent`]s on the
//! node's single event loop.
//!
//! ## Implementations
//! - **TCP**: tokio socket with reader and writer tasks ([`tcp`])
//! - **Memory**: in-process capture transport for embedding and tests ([`memory`])

pub mod memory;
pub mod tcp;

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

use crate::core::buffer::OutputBuffer;
use crate::error::Result;

/// Node-local identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Socket-side collaborator of a connection.
pub trait Transport: Send + Sync {
    /// Move as much of `buffer` to the socket as flow control allows.
    fn send(&self, buffer: &mut OutputBuffer) -> Result<()>;

    /// Whether the socket can still carry traffic.
    fn is_alive(&self) -> bool;

    /// Bytes handed to the socket but not yet written.
    fn write_buffer_size(&self) -> usize;

    /// Begin teardown. Disposal is reported later through [`NodeEvent::Disposed`].
    fn mark_for_close(&self, should_retry: bool);
}

/// Events delivered to the node loop by transports.
#[derive(Debug)]
pub enum NodeEvent {
    /// Bytes read from the socket.
    Received { conn_id: ConnectionId, data: Bytes },
    /// Pending writes drained below the high-water mark.
    Writable(ConnectionId),
    /// The peer closed the socket or a read failed.
    PeerClosed(ConnectionId),
    /// The socket is fully released; no further events follow for this id.
    Disposed {
        conn_id: ConnectionId,
        should_retry: bool,
    },
}

/// Address information recorded for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub address: SocketAddr,
    pub direction: Direction,
}
