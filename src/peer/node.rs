//! One peer and its connections.
//!
//! # Responsibilities
//! - Keep the connection list ordered: inbound at the head, outbound at the tail
//! - Open outbound connections on demand (remote peers only)
//! - Score the peer for selection
//! - Close every connection on request
//!
//! # Design Decisions
//! - The local peer is a separate variant with no socket factory; it talks to
//!   itself over a loopback pair
//! - Connections remove themselves from the list when they start closing

use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::call::{PendingCall, RequestObserver, RequestOptions};
use crate::channel::ChannelContext;
use crate::config::validation::split_host_port;
use crate::errors::ChannelError;
use crate::net::loopback::loopback_pair;
use crate::net::{Connection, ConnectionId, Direction, SocketFactory, Transport, EPHEMERAL_HOST_PORT};
use crate::peer::score::{weighted_random, Eligibility};

enum PeerKind {
    Remote(Arc<dyn SocketFactory>),
    Local,
}

struct PeerInner {
    host_port: String,
    kind: PeerKind,
    ctx: Arc<ChannelContext>,
    connections: Mutex<Vec<Connection>>,
}

#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("host_port", &self.inner.host_port)
            .field("local", &self.is_local())
            .field("connections", &self.lock().len())
            .finish()
    }
}

impl Peer {
    /// A remote peer reachable through `factory`.
    pub fn remote(ctx: Arc<ChannelContext>, host_port: impl Into<String>, factory: Arc<dyn SocketFactory>) -> Self {
        Self::build(ctx, host_port.into(), PeerKind::Remote(factory))
    }

    /// The local process. Never opens sockets.
    pub fn local(ctx: Arc<ChannelContext>) -> Self {
        let host_port = ctx.local_name.clone();
        Self::build(ctx, host_port, PeerKind::Local)
    }

    fn build(ctx: Arc<ChannelContext>, host_port: String, kind: PeerKind) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                host_port,
                kind,
                ctx,
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.inner.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn host_port(&self) -> &str {
        &self.inner.host_port
    }

    pub fn is_local(&self) -> bool {
        matches!(self.inner.kind, PeerKind::Local)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.inner.host_port == EPHEMERAL_HOST_PORT
    }

    /// Snapshot of the connection list, head first.
    pub fn connections(&self) -> Vec<Connection> {
        self.lock().clone()
    }

    /// Add a connection at its end of the list. Adding it twice is a no-op.
    pub fn add_connection(&self, conn: Connection) {
        {
            let mut conns = self.lock();
            if conns.iter().any(|c| c.id() == conn.id()) {
                return;
            }
            match conn.direction() {
                Direction::Out => conns.push(conn.clone()),
                Direction::In => conns.insert(0, conn.clone()),
            }
        }
        let peer = Arc::downgrade(&self.inner);
        let id = conn.id();
        conn.on_close(move |_| {
            if let Some(inner) = peer.upgrade() {
                Peer { inner }.remove_connection(id);
            }
        });
    }

    /// Remove a connection; `None` if it was not there.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<Connection> {
        let mut conns = self.lock();
        let index = conns.iter().position(|c| c.id() == id)?;
        Some(conns.remove(index))
    }

    /// Newest usable connection, scanning from the tail.
    pub fn out_connection(&self) -> Option<Connection> {
        self.lock().iter().rev().find(|c| !c.is_closing()).cloned()
    }

    /// Newest usable inbound-end connection, scanning from the head.
    pub fn in_connection(&self) -> Option<Connection> {
        self.lock().iter().find(|c| !c.is_closing()).cloned()
    }

    /// Whether a usable connection matches the filters.
    pub fn is_connected(&self, direction: Option<Direction>, identified: bool) -> bool {
        self.lock().iter().any(|c| {
            !c.is_closing()
                && direction.map_or(true, |d| c.direction() == d)
                && (!identified || c.is_identified())
        })
    }

    /// Reuse a usable connection or open a new outbound one.
    pub fn connect(&self, out_only: bool) -> Result<Connection, ChannelError> {
        let factory = match &self.inner.kind {
            PeerKind::Local => return Ok(self.connect_local()),
            PeerKind::Remote(factory) => factory,
        };
        if let Some(conn) = self.out_connection() {
            if !out_only || conn.direction() == Direction::Out {
                return Ok(conn);
            }
        }
        let transport = self.make_out_socket(factory.as_ref())?;
        let conn = Connection::outbound(self.inner.ctx.clone(), transport, &self.inner.host_port)?;
        self.add_connection(conn.clone());
        Ok(conn)
    }

    fn connect_local(&self) -> Connection {
        if let Some(conn) = self.in_connection() {
            return conn;
        }
        let (out, _inbound) = loopback_pair(self.inner.ctx.clone());
        self.add_connection(out.clone());
        out
    }

    fn make_out_socket(&self, factory: &dyn SocketFactory) -> Result<Arc<dyn Transport>, ChannelError> {
        let host_port = &self.inner.host_port;
        let (host, port) = split_host_port(host_port)
            .ok_or_else(|| ChannelError::InvalidDestination(format!("invalid host:port {}", host_port)))?;
        if host == "0.0.0.0" {
            return Err(ChannelError::InvalidDestination(format!(
                "cannot connect to ephemeral peer {}",
                host_port
            )));
        }
        if port == 0 {
            return Err(ChannelError::InvalidDestination(format!(
                "cannot connect to dynamic port {}",
                host_port
            )));
        }
        factory.connect(host, port)
    }

    /// Run `callback` once the current connection identifies, or with the
    /// error that prevented it.
    pub fn wait_for_identified(&self, callback: impl FnOnce(Result<(), ChannelError>) + Send + 'static) {
        match self.connect(false) {
            Ok(conn) => conn.on_identified(callback),
            Err(err) => callback(Err(err)),
        }
    }

    pub async fn identified(&self) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.wait_for_identified(move |res| {
            let _ = tx.send(res);
        });
        rx.await.unwrap_or(Err(ChannelError::ConnectionClosed))
    }

    /// Send a call over this peer. `observer` is told how it went.
    pub fn request(
        &self,
        options: RequestOptions,
        observer: Option<Arc<dyn RequestObserver>>,
    ) -> Result<PendingCall, ChannelError> {
        self.connect(false)?.request(options, observer)
    }

    /// Outstanding outbound calls across every connection.
    pub fn count_out_pending(&self) -> usize {
        self.lock().iter().map(Connection::pending_out).sum()
    }

    pub fn out_pending_weighted_random(&self) -> f64 {
        weighted_random(self.inner.ctx.random.next_f64(), self.count_out_pending())
    }

    pub fn eligibility(&self) -> Eligibility {
        match self.out_connection() {
            None => Eligibility::Unconnected,
            Some(conn) if conn.direction() != Direction::Out => Eligibility::NeedsOutbound,
            Some(conn) if !conn.is_identified() => Eligibility::Identifying,
            Some(_) => Eligibility::Ready,
        }
    }

    /// Selection score in (0, 1); see [`Eligibility`]. A peer reachable only
    /// through inbound connections starts an outbound connect.
    pub fn should_request(&self) -> f64 {
        let eligibility = self.eligibility();
        if eligibility == Eligibility::NeedsOutbound {
            if let Err(err) = self.connect(true) {
                tracing::debug!(peer = %self.inner.host_port, error = %err, "Background connect failed");
            }
        }
        eligibility.score(self.out_pending_weighted_random())
    }

    /// Close every connection; `callback` runs once all have closed.
    pub fn close(&self, callback: impl FnOnce() + Send + 'static) {
        let conns = self.connections();
        if conns.is_empty() {
            callback();
            return;
        }

        let remaining = Arc::new(AtomicIsize::new(conns.len() as isize));
        let callback: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(callback))));
        for conn in conns {
            let remaining = remaining.clone();
            let callback = callback.clone();
            let host_port = self.inner.host_port.clone();
            conn.close(move || {
                let left = remaining.fetch_sub(1, Ordering::SeqCst) - 1;
                if left < 0 {
                    tracing::error!(peer = %host_port, remaining = left, "Peer closed more connections than it had");
                    return;
                }
                if left == 0 {
                    let callback = callback.lock().unwrap_or_else(|e| e.into_inner()).take();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            });
        }
    }

    /// Async form of [`Peer::close`].
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        self.close(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::clock::FixedRandom;
    use crate::net::frame::{Frame, FrameBody, Init};
    use crate::test_support::{context, context_with_random, RecordingFactory, RecordingTransport};

    fn identify(conn: &Connection, host_port: &str) {
        conn.handle_frame(Frame::new(
            1,
            FrameBody::InitResponse(Init {
                host_port: host_port.into(),
                process_name: "remote".into(),
            }),
        ));
    }

    fn close_to(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() < 1e-9
    }

    fn inbound(ctx: &Arc<ChannelContext>, remote: &str) -> Connection {
        let transport = Arc::new(RecordingTransport::new(Some(remote)));
        Connection::inbound(ctx.clone(), transport).unwrap()
    }

    #[test]
    fn directions_keep_their_ends() {
        let ctx = context("127.0.0.1:4040");
        let factory = Arc::new(RecordingFactory::default());
        let peer = Peer::remote(ctx.clone(), "10.0.0.2:4040", factory);

        let out = peer.connect(false).unwrap();
        let first_in = inbound(&ctx, "10.0.0.2:5000");
        let second_in = inbound(&ctx, "10.0.0.2:5001");
        peer.add_connection(first_in.clone());
        peer.add_connection(second_in.clone());

        let ids: Vec<_> = peer.connections().iter().map(Connection::id).collect();
        assert_eq!(ids, vec![second_in.id(), first_in.id(), out.id()]);
        assert_eq!(peer.out_connection().unwrap().id(), out.id());
        assert_eq!(peer.in_connection().unwrap().id(), second_in.id());
    }

    #[test]
    fn closed_connections_leave_the_list() {
        let ctx = context("127.0.0.1:4040");
        let peer = Peer::remote(ctx, "10.0.0.2:4040", Arc::new(RecordingFactory::default()));
        let conn = peer.connect(false).unwrap();
        conn.on_read_error("bad frame");
        assert!(peer.connections().is_empty());
        assert!(peer.remove_connection(conn.id()).is_none());
    }

    #[test]
    fn connect_reuses_out_connection() {
        let ctx = context("127.0.0.1:4040");
        let factory = Arc::new(RecordingFactory::default());
        let peer = Peer::remote(ctx, "10.0.0.2:4040", factory.clone());
        let first = peer.connect(false).unwrap();
        let second = peer.connect(true).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(factory.connects(), vec![("10.0.0.2".to_string(), 4040)]);
    }

    #[test]
    fn refuses_ephemeral_and_dynamic_destinations() {
        let ctx = context("127.0.0.1:4040");
        let factory = Arc::new(RecordingFactory::default());
        let ephemeral = Peer::remote(ctx.clone(), EPHEMERAL_HOST_PORT, factory.clone());
        assert!(ephemeral.is_ephemeral());
        assert!(matches!(ephemeral.connect(false), Err(ChannelError::InvalidDestination(_))));

        let dynamic = Peer::remote(ctx, "10.0.0.2:0", factory.clone());
        assert!(matches!(dynamic.connect(false), Err(ChannelError::InvalidDestination(_))));
        assert!(factory.connects().is_empty());
    }

    #[test]
    fn local_peer_uses_loopback() {
        let ctx = context("127.0.0.1:4040");
        let peer = Peer::local(ctx);
        assert!(peer.is_local());
        let conn = peer.connect(true).unwrap();
        assert!(conn.is_identified());
        assert_eq!(peer.connect(false).unwrap().id(), conn.id());
        assert_eq!(peer.eligibility(), Eligibility::Ready);
    }

    #[test]
    fn wait_for_identified_fires_once() {
        let ctx = context("127.0.0.1:4040");
        let peer = Peer::remote(ctx, "10.0.0.2:4040", Arc::new(RecordingFactory::default()));
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        peer.wait_for_identified(move |res| sink.lock().unwrap().push(res));

        let conn = peer.out_connection().unwrap();
        identify(&conn, "10.0.0.2:4040");
        conn.on_socket_closed();
        assert_eq!(*results.lock().unwrap(), vec![Ok(())]);
    }

    #[test]
    fn wait_for_identified_reports_connect_failure() {
        let ctx = context("127.0.0.1:4040");
        let peer = Peer::remote(ctx, "10.0.0.2:0", Arc::new(RecordingFactory::default()));
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        peer.wait_for_identified(move |res| sink.lock().unwrap().push(res));
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ChannelError::InvalidDestination(_))));
    }

    #[test]
    fn wait_for_identified_fails_once_on_early_close() {
        let ctx = context("127.0.0.1:4040");
        let peer = Peer::remote(ctx, "10.0.0.2:4040", Arc::new(RecordingFactory::default()));
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        peer.wait_for_identified(move |res| sink.lock().unwrap().push(res));

        let conn = peer.out_connection().unwrap();
        conn.on_read_error("garbage before init");
        conn.on_socket_closed();
        identify(&conn, "10.0.0.2:4040");

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ChannelError::ReadProtocol { .. })));
    }

    #[test]
    fn wait_for_identified_on_closing_connection_fails_at_once() {
        let ctx = context("127.0.0.1:4040");
        let peer = Peer::remote(ctx, "10.0.0.2:4040", Arc::new(RecordingFactory::broken()));
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        peer.wait_for_identified(move |res| sink.lock().unwrap().push(res));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ChannelError::WriteProtocol { .. })));
    }

    #[test]
    fn closing_connection_reports_recorded_error() {
        let ctx = context("127.0.0.1:4040");
        let transport = Arc::new(RecordingTransport::new(None));
        let conn = Connection::outbound(ctx, transport, "10.0.0.2:4040").unwrap();
        conn.reset_all(ChannelError::LocalSocketClose);

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        conn.on_identified(move |res| sink.lock().unwrap().push(res));
        assert_eq!(*results.lock().unwrap(), vec![Err(ChannelError::LocalSocketClose)]);
    }

    #[test]
    fn scores_follow_connectivity() {
        let ctx = context_with_random("127.0.0.1:4040", Arc::new(FixedRandom(0.5)));
        let factory = Arc::new(RecordingFactory::default());
        let peer = Peer::remote(ctx.clone(), "10.0.0.2:4040", factory.clone());

        assert!(close_to(peer.should_request(), 0.15));

        let conn = peer.connect(false).unwrap();
        assert!(close_to(peer.should_request(), 0.35));

        identify(&conn, "10.0.0.2:4040");
        assert!(close_to(peer.should_request(), 0.7));

        conn.request(RequestOptions::new("bob", "echo"), None).unwrap();
        assert_eq!(peer.count_out_pending(), 1);
        assert!(close_to(peer.should_request(), 0.4 + 0.25 * 0.6));
    }

    #[test]
    fn inbound_only_peer_starts_connecting() {
        let ctx = context_with_random("127.0.0.1:4040", Arc::new(FixedRandom(0.5)));
        let factory = Arc::new(RecordingFactory::default());
        let peer = Peer::remote(ctx.clone(), "10.0.0.2:4040", factory.clone());
        peer.add_connection(inbound(&ctx, "10.0.0.2:5000"));

        assert!(close_to(peer.should_request(), 0.25));
        assert_eq!(factory.connects().len(), 1);
        assert_eq!(peer.eligibility(), Eligibility::Identifying);
    }

    #[test]
    fn close_waits_for_every_connection() {
        let ctx = context("127.0.0.1:4040");
        let peer = Peer::remote(ctx.clone(), "10.0.0.2:4040", Arc::new(RecordingFactory::default()));
        let out = peer.connect(false).unwrap();
        let conn_in = inbound(&ctx, "10.0.0.2:5000");
        peer.add_connection(conn_in.clone());

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        peer.close(move || flag.store(true, Ordering::SeqCst));
        assert!(!done.load(Ordering::SeqCst));

        out.on_socket_closed();
        assert!(!done.load(Ordering::SeqCst));
        conn_in.on_socket_closed();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn close_without_connections_is_immediate() {
        let peer = Peer::local(context("127.0.0.1:4040"));
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        peer.close(move || flag.store(true, Ordering::SeqCst));
        assert!(done.load(Ordering::SeqCst));
    }
}
