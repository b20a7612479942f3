//! Channel: the entry point tying peers, circuits and the listener together.
//!
//! # Responsibilities
//! - Hold the shared wiring every connection reads (`ChannelContext`)
//! - Put circuits in front of the user's request handler
//! - Route outbound requests to a named peer or the best available one
//! - Accept inbound TCP connections until shutdown
//! - Apply reloaded configuration
//!
//! # Data Flow
//! ```text
//! Channel::request(host_port) → PeerRegistry → Peer → Connection
//! Channel::listen → Listener::accept → TcpTransport → Connection::inbound
//!     → (init) PeerRegistry
//!     → (call) CircuitHandler → user handler
//! ConfigWatcher → Channel::apply_config → health policy swap + service sweep
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc};

use crate::call::{PendingCall, RequestHandler, RequestObserver, RequestOptions};
use crate::circuit::{CircuitHandler, CircuitRegistry};
use crate::clock::{Clock, RandomSource, SystemClock, ThreadRandom};
use crate::config::{ChannelConfig, ConnectionConfig, HealthPolicy};
use crate::errors::ChannelError;
use crate::net::listener::{Listener, ListenerError};
use crate::net::tcp::{FrameCodec, TcpSocketFactory, TcpTransport};
use crate::net::{Connection, PeerDirectory, SocketFactory};
use crate::observability::stats::{MetricsStatSink, NullStatSink};
use crate::observability::{StatSink, Tracer};
use crate::peer::PeerRegistry;

pub const DEFAULT_PROCESS_NAME: &str = "peer-transport";

/// Wiring shared by every connection of a channel.
pub struct ChannelContext {
    pub local_name: String,
    pub process_name: String,
    pub connection: ConnectionConfig,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub stats: Arc<dyn StatSink>,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub handler: Arc<dyn RequestHandler>,
    directory: OnceLock<Weak<dyn PeerDirectory>>,
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("local_name", &self.local_name)
            .field("process_name", &self.process_name)
            .field("connection", &self.connection)
            .field("tracing", &self.tracer.is_some())
            .finish()
    }
}

impl ChannelContext {
    pub fn new(local_name: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            local_name: local_name.into(),
            process_name: DEFAULT_PROCESS_NAME.to_string(),
            connection: ConnectionConfig::default(),
            clock: Arc::new(SystemClock::new()),
            random: Arc::new(ThreadRandom),
            stats: Arc::new(NullStatSink),
            tracer: None,
            handler,
            directory: OnceLock::new(),
        }
    }

    pub fn from_config(config: &ChannelConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let stats: Arc<dyn StatSink> = if config.observability.stats_enabled {
            Arc::new(MetricsStatSink)
        } else {
            Arc::new(NullStatSink)
        };
        Self::new(config.host_port.clone(), handler)
            .with_process_name(config.process_name.clone())
            .with_connection_config(config.connection.clone())
            .with_stats(stats)
    }

    pub fn with_process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Set where identified inbound connections register. Only the first
    /// call wins.
    pub(crate) fn attach_directory(&self, directory: Weak<dyn PeerDirectory>) -> bool {
        self.directory.set(directory).is_ok()
    }

    pub(crate) fn peer_directory(&self) -> Option<Arc<dyn PeerDirectory>> {
        self.directory.get().and_then(Weak::upgrade)
    }
}

pub struct Channel {
    config: ChannelConfig,
    ctx: Arc<ChannelContext>,
    peers: PeerRegistry,
    circuits: Option<Arc<CircuitRegistry>>,
    outbound: Arc<CircuitRegistry>,
    policy: Arc<ArcSwap<HealthPolicy>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("host_port", &self.ctx.local_name)
            .field("peers", &self.peers)
            .field("circuits", &self.circuits)
            .finish()
    }
}

impl Channel {
    /// Build a channel from its configuration.
    pub fn new(config: ChannelConfig, handler: Arc<dyn RequestHandler>, factory: Arc<dyn SocketFactory>) -> Self {
        let ctx = ChannelContext::from_config(&config, handler);
        Self::with_context(config, ctx, factory)
    }

    /// Build a channel dialing peers over TCP with `codec`.
    pub fn tcp(config: ChannelConfig, handler: Arc<dyn RequestHandler>, codec: Arc<dyn FrameCodec>) -> Self {
        let factory = Arc::new(TcpSocketFactory::new(codec, config.connection.clone()));
        Self::new(config, handler, factory)
    }

    /// Build a channel around a prepared context. The context's handler is
    /// wrapped with circuits when they are enabled.
    pub fn with_context(config: ChannelConfig, mut ctx: ChannelContext, factory: Arc<dyn SocketFactory>) -> Self {
        let policy = Arc::new(ArcSwap::from_pointee(config.health));
        let circuits = config.circuits.enabled.then(|| {
            let circuits = Arc::new(CircuitRegistry::new(policy.clone(), ctx.clock.clone()));
            if let Some(owned) = &config.circuits.owned_services {
                circuits.update_services(owned);
            }
            ctx.handler = Arc::new(CircuitHandler::new(circuits.clone(), ctx.handler.clone()));
            circuits
        });
        let outbound = Arc::new(CircuitRegistry::new(policy.clone(), ctx.clock.clone()));

        let ctx = Arc::new(ctx);
        let peers = PeerRegistry::new(ctx.clone(), factory);
        tracing::info!(
            host_port = %ctx.local_name,
            process_name = %ctx.process_name,
            circuits = circuits.is_some(),
            "Channel created"
        );
        Self {
            config,
            ctx,
            peers,
            circuits,
            outbound,
            policy,
        }
    }

    pub fn host_port(&self) -> &str {
        &self.ctx.local_name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ChannelContext> {
        &self.ctx
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Circuits guarding inbound requests, if enabled.
    pub fn circuits(&self) -> Option<&Arc<CircuitRegistry>> {
        self.circuits.as_ref()
    }

    /// Circuits tracking the health of outbound calls.
    pub fn outbound_circuits(&self) -> &Arc<CircuitRegistry> {
        &self.outbound
    }

    pub fn policy(&self) -> HealthPolicy {
        **self.policy.load()
    }

    /// Send a call to the peer at `host_port`.
    pub fn request(&self, host_port: &str, options: RequestOptions) -> Result<PendingCall, ChannelError> {
        let observer = self.outbound_observer(&options);
        self.peers.get_or_create(host_port).request(options, Some(observer))
    }

    /// Send a call to the best-scoring known peer not in `exclude`.
    pub fn request_any(&self, options: RequestOptions, exclude: &HashSet<String>) -> Result<PendingCall, ChannelError> {
        let peer = self
            .peers
            .choose_peer(exclude)
            .ok_or_else(|| ChannelError::NoPeerAvailable(options.service.clone()))?;
        let observer = self.outbound_observer(&options);
        peer.request(options, Some(observer))
    }

    fn outbound_observer(&self, options: &RequestOptions) -> Arc<dyn RequestObserver> {
        let caller = options.caller_name().unwrap_or(&self.ctx.process_name);
        self.outbound
            .get_circuit(caller, &options.service, &options.endpoint)
            .monitor_call()
    }

    /// Apply a reloaded configuration. Only the health policy and the owned
    /// service list take effect at runtime; without a list no circuit is
    /// collected.
    pub fn apply_config(&self, config: &ChannelConfig) {
        if config.health != **self.policy.load() {
            self.policy.store(Arc::new(config.health));
            tracing::info!(
                period_ms = config.health.period_ms,
                max_error_rate = config.health.max_error_rate,
                min_requests = config.health.min_requests,
                probation_ms = config.health.probation_ms,
                "Health policy reloaded"
            );
        }
        if let (Some(circuits), Some(owned)) = (&self.circuits, &config.circuits.owned_services) {
            circuits.update_services(owned);
        }
    }

    /// Apply every config pushed by a `ConfigWatcher` until the sender
    /// goes away.
    pub async fn follow_config(&self, mut updates: mpsc::UnboundedReceiver<ChannelConfig>) {
        while let Some(config) = updates.recv().await {
            self.apply_config(&config);
        }
    }

    /// Accept inbound connections until `shutdown` fires.
    pub async fn listen(
        &self,
        listener: Listener,
        codec: Arc<dyn FrameCodec>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, addr, permit)) => {
                        let transport = TcpTransport::accepted(
                            stream,
                            codec.clone(),
                            self.ctx.connection.clone(),
                            Some(permit),
                        );
                        if let Err(err) = Connection::inbound(self.ctx.clone(), transport) {
                            tracing::warn!(peer_addr = %addr, error = %err, "Rejected inbound connection");
                        }
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    Err(e) => return Err(e),
                },
                _ = shutdown.recv() => {
                    tracing::info!(host_port = %self.ctx.local_name, "Listener stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Close every connection of every peer.
    pub async fn close(&self) {
        self.peers.close_all().await;
        tracing::info!(host_port = %self.ctx.local_name, "Channel closed");
    }
}
