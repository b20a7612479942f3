//! Peer registry.
//!
//! # Responsibilities
//! - Map host:port to a single `Peer`
//! - Register identified inbound connections under their peer
//! - Choose the best peer for an outbound request
//! - Evict peers that left the membership

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::future::join_all;

use crate::channel::ChannelContext;
use crate::net::{Connection, PeerDirectory, SocketFactory};
use crate::peer::node::Peer;

struct RegistryInner {
    ctx: Arc<ChannelContext>,
    factory: Arc<dyn SocketFactory>,
    peers: DashMap<String, Peer>,
    self_peer: Peer,
}

#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("local", &self.inner.ctx.local_name)
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

impl PeerRegistry {
    /// Create a registry and make it the directory inbound connections
    /// register with.
    pub fn new(ctx: Arc<ChannelContext>, factory: Arc<dyn SocketFactory>) -> Self {
        let self_peer = Peer::local(ctx.clone());
        let inner = Arc::new(RegistryInner {
            ctx: ctx.clone(),
            factory,
            peers: DashMap::new(),
            self_peer,
        });
        let weak = Arc::downgrade(&inner);
        let directory: Weak<dyn PeerDirectory> = weak;
        if !ctx.attach_directory(directory) {
            tracing::warn!(local = %ctx.local_name, "Channel context already has a peer registry");
        }
        Self { inner }
    }

    /// The peer for `host_port`, created on first use. The local address
    /// always maps to the self peer.
    pub fn get_or_create(&self, host_port: &str) -> Peer {
        self.inner.get_or_create(host_port)
    }

    pub fn get(&self, host_port: &str) -> Option<Peer> {
        self.inner.peers.get(host_port).map(|peer| peer.clone())
    }

    /// Forget a peer without closing it.
    pub fn delete(&self, host_port: &str) -> Option<Peer> {
        self.inner.peers.remove(host_port).map(|(_, peer)| peer)
    }

    pub fn len(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.peers.is_empty()
    }

    pub fn host_ports(&self) -> Vec<String> {
        self.inner.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn self_peer(&self) -> Peer {
        self.inner.self_peer.clone()
    }

    /// The peer with the highest selection score, skipping `exclude` and
    /// peers scoring zero. Ties go to the first peer seen.
    pub fn choose_peer(&self, exclude: &HashSet<String>) -> Option<Peer> {
        // Scoring may open connections, so no map guard is held while it runs.
        let candidates: Vec<Peer> = self
            .inner
            .peers
            .iter()
            .filter(|entry| !exclude.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        let mut best: Option<(f64, Peer)> = None;
        for peer in candidates {
            let score = peer.should_request();
            if score <= 0.0 {
                continue;
            }
            if best.as_ref().map_or(true, |(top, _)| score > *top) {
                best = Some((score, peer));
            }
        }
        best.map(|(_, peer)| peer)
    }

    /// Drop and close every peer whose address is not in `host_ports`.
    pub fn retain(&self, host_ports: &[String]) -> Vec<Peer> {
        let keep: HashSet<&str> = host_ports.iter().map(String::as_str).collect();
        let evicted: Vec<Peer> = self
            .host_ports()
            .into_iter()
            .filter(|host_port| !keep.contains(host_port.as_str()))
            .filter_map(|host_port| self.delete(&host_port))
            .collect();

        for peer in &evicted {
            tracing::info!(peer = %peer.host_port(), "Evicting peer");
            peer.close(|| {});
        }
        evicted
    }

    /// Close every peer, the self peer included, and wait for their
    /// connections to finish closing.
    pub async fn close_all(&self) {
        let mut peers: Vec<Peer> = self.inner.peers.iter().map(|entry| entry.value().clone()).collect();
        peers.push(self.inner.self_peer.clone());
        join_all(peers.iter().map(Peer::shutdown)).await;
        tracing::debug!(local = %self.inner.ctx.local_name, peers = peers.len(), "All peers closed");
    }
}

impl RegistryInner {
    fn get_or_create(&self, host_port: &str) -> Peer {
        if host_port == self.ctx.local_name {
            return self.self_peer.clone();
        }
        self.peers
            .entry(host_port.to_string())
            .or_insert_with(|| Peer::remote(self.ctx.clone(), host_port, self.factory.clone()))
            .clone()
    }
}

impl PeerDirectory for RegistryInner {
    fn register_inbound(&self, remote_name: &str, conn: &Connection) {
        self.get_or_create(remote_name).add_connection(conn.clone());
    }

    fn forget_unidentified(&self, remote_addr: &str) {
        if self.peers.remove(remote_addr).is_some() {
            tracing::debug!(remote_addr, "Forgot ephemeral peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::clock::SequenceRandom;
    use crate::net::frame::{Frame, FrameBody, Init};
    use crate::net::EPHEMERAL_HOST_PORT;
    use crate::test_support::{context, context_with_random, RecordingFactory, RecordingTransport};

    fn registry(ctx: Arc<ChannelContext>) -> (PeerRegistry, Arc<RecordingFactory>) {
        let factory = Arc::new(RecordingFactory::default());
        (PeerRegistry::new(ctx, factory.clone()), factory)
    }

    fn accept(ctx: &Arc<ChannelContext>, remote_addr: &str, announced: &str) -> Connection {
        let transport = Arc::new(RecordingTransport::new(Some(remote_addr)));
        let conn = Connection::inbound(ctx.clone(), transport).unwrap();
        conn.handle_frame(Frame::new(
            1,
            FrameBody::InitRequest(Init {
                host_port: announced.into(),
                process_name: "client".into(),
            }),
        ));
        conn
    }

    #[test]
    fn one_peer_per_address() {
        let (peers, _) = registry(context("127.0.0.1:4040"));
        let a = peers.get_or_create("10.0.0.2:4040");
        let b = peers.get_or_create("10.0.0.2:4040");
        assert_eq!(peers.len(), 1);
        a.connect(false).unwrap();
        assert_eq!(b.connections().len(), 1);
    }

    #[test]
    fn local_address_is_the_self_peer() {
        let (peers, _) = registry(context("127.0.0.1:4040"));
        assert!(peers.get_or_create("127.0.0.1:4040").is_local());
        assert!(peers.is_empty());
    }

    #[test]
    fn identified_inbound_joins_its_peer() {
        let ctx = context("127.0.0.1:4040");
        let (peers, _) = registry(ctx.clone());
        let conn = accept(&ctx, "10.0.0.3:6000", "10.0.0.3:4040");

        let peer = peers.get("10.0.0.3:4040").unwrap();
        assert_eq!(peer.connections()[0].id(), conn.id());
        assert!(peer.is_connected(Some(crate::net::Direction::In), true));
    }

    #[test]
    fn ephemeral_peer_is_forgotten_on_close() {
        let ctx = context("127.0.0.1:4040");
        let (peers, _) = registry(ctx.clone());
        let conn = accept(&ctx, "10.0.0.3:6000", EPHEMERAL_HOST_PORT);
        assert!(peers.get("10.0.0.3:6000").is_some());

        conn.on_socket_closed();
        assert!(peers.get("10.0.0.3:6000").is_none());
    }

    #[test]
    fn choose_peer_prefers_connected() {
        let ctx = context_with_random("127.0.0.1:4040", Arc::new(SequenceRandom::new(vec![0.9, 0.1])));
        let (peers, _) = registry(ctx.clone());
        peers.get_or_create("10.0.0.2:4040");
        let connected = peers.get_or_create("10.0.0.3:4040");
        connected.connect(false).unwrap();

        let chosen = peers.choose_peer(&HashSet::new()).unwrap();
        assert_eq!(chosen.host_port(), "10.0.0.3:4040");

        let exclude: HashSet<String> = ["10.0.0.3:4040".to_string()].into_iter().collect();
        let chosen = peers.choose_peer(&exclude).unwrap();
        assert_eq!(chosen.host_port(), "10.0.0.2:4040");
    }

    #[test]
    fn choose_peer_on_empty_registry() {
        let (peers, _) = registry(context("127.0.0.1:4040"));
        assert!(peers.choose_peer(&HashSet::new()).is_none());
    }

    #[test]
    fn retain_evicts_and_closes() {
        let ctx = context("127.0.0.1:4040");
        let (peers, _) = registry(ctx);
        let gone = peers.get_or_create("10.0.0.2:4040");
        peers.get_or_create("10.0.0.3:4040");
        let conn = gone.connect(false).unwrap();

        let evicted = peers.retain(&["10.0.0.3:4040".to_string()]);
        assert_eq!(evicted.len(), 1);
        assert_eq!(peers.host_ports(), vec!["10.0.0.3:4040".to_string()]);
        assert!(conn.is_closing());
    }

    #[tokio::test]
    async fn close_all_waits_for_sockets() {
        let ctx = context("127.0.0.1:4040");
        let (peers, _) = registry(ctx);
        let conn = peers.get_or_create("10.0.0.2:4040").connect(false).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let closing = peers.clone();
        let task = tokio::spawn(async move {
            closing.close_all().await;
            flag.store(true, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        assert!(!done.load(Ordering::SeqCst));

        conn.on_socket_closed();
        task.await.unwrap();
        assert!(done.load(Ordering::SeqCst));
    }
}
