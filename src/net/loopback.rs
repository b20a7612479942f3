//! In-process connection pair used by the local peer.
//!
//! Frames written on one side are dispatched synchronously on the other. The
//! outbound side owns the inbound one; the inbound side only holds a weak
//! link back, so the pair lives exactly as long as the outbound connection.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::ChannelContext;
use crate::net::connection::{Connection, WeakConnection};
use crate::net::frame::Frame;
use crate::net::transport::Transport;
use crate::net::Direction;

#[derive(Debug)]
enum Link {
    Owned(Connection),
    Borrowed(WeakConnection),
}

impl Link {
    fn get(&self) -> Option<Connection> {
        match self {
            Link::Owned(conn) => Some(conn.clone()),
            Link::Borrowed(weak) => weak.upgrade(),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoopbackTransport {
    own: Mutex<Option<WeakConnection>>,
    other: Mutex<Option<Link>>,
    destroyed: AtomicBool,
}

impl LoopbackTransport {
    fn own(&self) -> Option<Connection> {
        self.own
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(WeakConnection::upgrade)
    }

    fn other(&self) -> Option<Connection> {
        self.other
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Link::get)
    }

    fn link(&self, link: Link) {
        *self.other.lock().unwrap_or_else(|e| e.into_inner()) = Some(link);
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, frame: Frame) -> io::Result<()> {
        if self.is_destroyed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback destroyed"));
        }
        let other = self
            .other()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "loopback peer gone"))?;
        other.handle_frame(frame);
        Ok(())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(own) = self.own() {
            own.on_socket_closed();
        }
        if let Some(other) = self.other() {
            other.close(|| {});
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<String> {
        None
    }

    fn start(&self, conn: &Connection) {
        *self.own.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn.downgrade());
    }
}

/// Build a connected pair; the first element is the outbound side.
pub fn loopback_pair(ctx: Arc<ChannelContext>) -> (Connection, Connection) {
    let out_transport = Arc::new(LoopbackTransport::default());
    let in_transport = Arc::new(LoopbackTransport::default());

    let out = Connection::loopback(ctx.clone(), out_transport.clone(), Direction::Out);
    let inbound = Connection::loopback(ctx, in_transport.clone(), Direction::In);

    out_transport.link(Link::Owned(inbound.clone()));
    in_transport.link(Link::Borrowed(out.downgrade()));
    (out, inbound)
}
