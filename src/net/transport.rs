//! Capabilities a connection needs from the byte stream underneath it.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::errors::ChannelError;
use crate::net::connection::Connection;
use crate::net::frame::Frame;

/// A duplex frame stream owned by one [`Connection`].
///
/// Implementations deliver inbound frames and socket events by calling the
/// owning connection's `handle_frame` / `on_*` methods.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queue a frame for writing. An error means the local write failed.
    fn send(&self, frame: Frame) -> io::Result<()>;

    /// Tear the stream down. Idempotent.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;

    /// Remote address as observed on the socket, when there is one.
    fn remote_addr(&self) -> Option<String>;

    /// Called once the owning connection exists.
    fn start(&self, _conn: &Connection) {}
}

/// Opens outbound transports.
pub trait SocketFactory: Send + Sync + fmt::Debug {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, ChannelError>;
}
