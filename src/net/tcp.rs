//! Tokio TCP transport.
//!
//! # Responsibilities
//! - Connect outbound sockets with a timeout
//! - Decode inbound bytes into frames through the pluggable codec
//! - Serialize outbound frames from a queue
//! - Drive the connection's timeout sweep
//!
//! # Data Flow
//! ```text
//! socket read → BytesMut → FrameCodec::decode → Connection::handle_frame
//! Connection::send_frame → mpsc queue → FrameCodec::encode → socket write
//! interval tick → Connection::sweep_timeouts
//! ```
//!
//! # Design Decisions
//! - One task per socket owns both halves; the connection never awaits
//! - Destroy is a watch flag the task selects on
//! - The task always ends by reporting the socket closed

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::config::ConnectionConfig;
use crate::errors::ChannelError;
use crate::net::connection::Connection;
use crate::net::frame::Frame;
use crate::net::listener::ConnectionPermit;
use crate::net::transport::{SocketFactory, Transport};

/// Byte layout of frames on a stream.
pub trait FrameCodec: Send + Sync + fmt::Debug + 'static {
    fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> io::Result<()>;

    /// Decode one frame if `src` holds a complete one, consuming its bytes.
    fn decode(&self, src: &mut BytesMut) -> io::Result<Option<Frame>>;
}

enum Source {
    Connect(String),
    Accepted(TcpStream),
}

/// Everything the driver task takes ownership of.
struct Driver {
    source: Source,
    outgoing: mpsc::UnboundedReceiver<Frame>,
    permit: Option<ConnectionPermit>,
}

pub struct TcpTransport {
    remote_addr: Option<String>,
    codec: Arc<dyn FrameCodec>,
    config: ConnectionConfig,
    queue: mpsc::UnboundedSender<Frame>,
    destroyed: watch::Sender<bool>,
    driver: Mutex<Option<Driver>>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("remote_addr", &self.remote_addr)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl TcpTransport {
    fn new(
        source: Source,
        remote_addr: Option<String>,
        codec: Arc<dyn FrameCodec>,
        config: ConnectionConfig,
        permit: Option<ConnectionPermit>,
    ) -> Self {
        let (queue, outgoing) = mpsc::unbounded_channel();
        let (destroyed, _) = watch::channel(false);
        Self {
            remote_addr,
            codec,
            config,
            queue,
            destroyed,
            driver: Mutex::new(Some(Driver {
                source,
                outgoing,
                permit,
            })),
        }
    }

    /// Wrap a socket accepted by the listener. The permit is released when
    /// the socket closes.
    pub fn accepted(
        stream: TcpStream,
        codec: Arc<dyn FrameCodec>,
        config: ConnectionConfig,
        permit: Option<ConnectionPermit>,
    ) -> Arc<Self> {
        let remote_addr = stream.peer_addr().ok().map(|addr| addr.to_string());
        Arc::new(Self::new(Source::Accepted(stream), remote_addr, codec, config, permit))
    }
}

impl Transport for TcpTransport {
    fn send(&self, frame: Frame) -> io::Result<()> {
        if self.is_destroyed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket destroyed"));
        }
        self.queue
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "socket writer stopped"))
    }

    fn destroy(&self) {
        self.destroyed.send_replace(true);
    }

    fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn start(&self, conn: &Connection) {
        let Some(driver) = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(conn = %conn.id(), error = %e, "No runtime to drive socket");
                return;
            }
        };
        handle.spawn(drive(
            driver,
            conn.clone(),
            self.codec.clone(),
            self.config.clone(),
            self.destroyed.subscribe(),
        ));
    }
}

async fn drive(
    driver: Driver,
    conn: Connection,
    codec: Arc<dyn FrameCodec>,
    config: ConnectionConfig,
    mut destroyed: watch::Receiver<bool>,
) {
    let Driver {
        source,
        mut outgoing,
        permit,
    } = driver;

    let stream = match source {
        Source::Accepted(stream) => stream,
        Source::Connect(addr) => {
            let connect = tokio::time::timeout(
                Duration::from_millis(config.connect_timeout_ms),
                TcpStream::connect(addr.clone()),
            );
            tokio::select! {
                res = connect => match res {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        conn.on_socket_error(e.to_string());
                        conn.on_socket_closed();
                        return;
                    }
                    Err(_) => {
                        conn.on_socket_error(format!("connect to {} timed out", addr));
                        conn.on_socket_closed();
                        return;
                    }
                },
                _ = destroy_requested(&mut destroyed) => {
                    conn.on_socket_closed();
                    return;
                }
            }
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(conn = %conn.id(), error = %e, "Failed to set TCP_NODELAY");
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(config.read_buffer_size);
    let mut write_buf = BytesMut::new();
    let mut sweep = tokio::time::interval(Duration::from_millis(config.timeout_check_interval_ms));

    loop {
        tokio::select! {
            res = reader.read_buf(&mut read_buf) => match res {
                Ok(0) => break,
                Ok(_) => {
                    if !decode_all(codec.as_ref(), &mut read_buf, &conn) {
                        break;
                    }
                }
                Err(e) => {
                    conn.on_socket_error(e.to_string());
                    break;
                }
            },
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    write_buf.clear();
                    let res = match codec.encode(&frame, &mut write_buf) {
                        Ok(()) => writer.write_all(&write_buf).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = res {
                        conn.on_write_error(e.to_string());
                        break;
                    }
                }
                None => break,
            },
            _ = sweep.tick() => conn.sweep_timeouts(),
            _ = destroy_requested(&mut destroyed) => break,
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::trace!(conn = %conn.id(), error = %e, "Socket shutdown failed");
    }
    drop(permit);
    conn.on_socket_closed();
}

/// Resolves once the transport is destroyed or dropped. The watch guard
/// never outlives this future, so the driver stays `Send`.
async fn destroy_requested(destroyed: &mut watch::Receiver<bool>) {
    let _ = destroyed.wait_for(|d| *d).await;
}

/// Dispatch every complete frame in `buf`. False when the stream is corrupt.
fn decode_all(codec: &dyn FrameCodec, buf: &mut BytesMut, conn: &Connection) -> bool {
    loop {
        match codec.decode(buf) {
            Ok(Some(frame)) => conn.handle_frame(frame),
            Ok(None) => return true,
            Err(e) => {
                conn.on_read_error(e.to_string());
                return false;
            }
        }
    }
}

/// Opens tokio TCP transports.
#[derive(Debug, Clone)]
pub struct TcpSocketFactory {
    codec: Arc<dyn FrameCodec>,
    config: ConnectionConfig,
}

impl TcpSocketFactory {
    pub fn new(codec: Arc<dyn FrameCodec>, config: ConnectionConfig) -> Self {
        Self { codec, config }
    }

}

impl SocketFactory for TcpSocketFactory {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Transport>, ChannelError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ChannelError::InvalidDestination(format!(
                "cannot connect to {}:{} outside a tokio runtime",
                host, port
            )));
        }
        let addr = format!("{}:{}", host, port);
        Ok(Arc::new(TcpTransport::new(
            Source::Connect(addr.clone()),
            Some(addr),
            self.codec.clone(),
            self.config.clone(),
            None,
        )))
    }
}
