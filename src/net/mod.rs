//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     Peer::connect → SocketFactory::connect → Transport
//!     → connection.rs (init request, pending table)
//!
//! Inbound TCP connection:
//!     → listener.rs (accept loop, connection limits)
//!     → tcp.rs (socket driver, frame codec, timeout sweep)
//!     → connection.rs (identification, frame dispatch)
//!
//! Local process:
//!     → loopback.rs (in-memory connection pair, no sockets)
//!
//! Connection states:
//!     Connected → Identified → Closing
//! ```
//!
//! # Design Decisions
//! - Frames are typed values; bytes only exist inside the codec
//! - Connections never hold a lock while calling out
//! - Every fatal failure goes through the same reset + destroy path

use std::fmt;

pub mod connection;
pub mod frame;
pub mod listener;
pub mod loopback;
pub(crate) mod operations;
pub mod tcp;
pub mod transport;

pub use connection::{Connection, ConnectionId, PeerDirectory, WeakConnection};
pub use frame::{Frame, FrameBody, FrameKind};
pub use transport::{SocketFactory, Transport};

/// Placeholder address of a peer that has not told us where it listens.
pub const EPHEMERAL_HOST_PORT: &str = "0.0.0.0:0";

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}
