//! One multiplexed connection to a peer.
//!
//! # Responsibilities
//! - Drive the identification handshake in both directions
//! - Dispatch typed frames by kind
//! - Own the pending-operation table of outbound calls
//! - Fail every pending operation exactly once when the connection dies
//!
//! # Design Decisions
//! - `closing` is monotonic; once set no frame is dispatched and no call starts
//! - An operation is completed by whichever path removes it from the table,
//!   so an error frame racing a socket close resolves it once
//! - `reset_all` never touches the transport; callers destroy it separately
//! - No lock is held while calling handlers, observers or the transport

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::call::{
    IncomingRequest, IncomingResponse, PendingCall, RequestObserver, RequestOptions, ResponseChunk,
};
use crate::channel::ChannelContext;
use crate::errors::ChannelError;
use crate::net::frame::{
    append_parts, CallContinuation, CallError, CallRequest, CallResponse, Frame, FrameBody, Init,
    TraceIds,
};
use crate::net::operations::{CallTags, OutOperation, OutStage, Operations};
use crate::net::transport::Transport;
use crate::net::{Direction, EPHEMERAL_HOST_PORT};
use crate::observability::{Span, Stat};
use crate::response::{ResponseBuilder, ResponseSink};

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where identified inbound connections are registered.
pub trait PeerDirectory: Send + Sync {
    /// An inbound connection identified itself as `remote_name`.
    fn register_inbound(&self, remote_name: &str, conn: &Connection);

    /// The remote only ever reported the ephemeral placeholder.
    fn forget_unidentified(&self, remote_addr: &str);
}

type IdentifyCallback = Box<dyn FnOnce(Result<(), ChannelError>) + Send>;
type CloseListener = Box<dyn FnOnce(&ChannelError) + Send>;
type CloseCallback = Box<dyn FnOnce() + Send>;

struct PartialRequest {
    head: CallRequest,
    args: Vec<Vec<u8>>,
}

#[derive(Default)]
struct ConnectionState {
    remote_name: Option<String>,
    /// Identified with the ephemeral placeholder instead of a listening address.
    ephemeral: bool,
    closing: bool,
    close_error: Option<ChannelError>,
    socket_closed: bool,
    ops: Operations,
    partial_requests: HashMap<u32, PartialRequest>,
    identify_waiters: Vec<IdentifyCallback>,
    close_listeners: Vec<CloseListener>,
    close_callbacks: Vec<CloseCallback>,
}

struct ConnectionInner {
    id: ConnectionId,
    direction: Direction,
    remote_addr: String,
    ctx: Arc<ChannelContext>,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
}

/// Cheap-to-clone handle on a connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Non-owning handle, used where a strong one would form a cycle.
#[derive(Clone, Debug)]
pub struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("remote_addr", &self.inner.remote_addr)
            .finish()
    }
}

impl Connection {
    /// Open the outbound side and send the init request.
    pub fn outbound(
        ctx: Arc<ChannelContext>,
        transport: Arc<dyn Transport>,
        remote_addr: &str,
    ) -> Result<Self, ChannelError> {
        if remote_addr == ctx.local_name {
            return Err(ChannelError::SelfConnection(remote_addr.to_string()));
        }
        let conn = Self::build(ctx, transport, Direction::Out, remote_addr.to_string(), None);
        conn.inner.transport.start(&conn);

        let id = conn.lock().ops.next_id();
        conn.send_frame(Frame::new(id, FrameBody::InitRequest(conn.local_init())));
        tracing::debug!(conn = %conn.id(), remote_addr, "Outbound connection opened");
        Ok(conn)
    }

    /// Wrap an accepted socket; identification happens on its init request.
    pub fn inbound(ctx: Arc<ChannelContext>, transport: Arc<dyn Transport>) -> Result<Self, ChannelError> {
        let remote_addr = transport
            .remote_addr()
            .unwrap_or_else(|| EPHEMERAL_HOST_PORT.to_string());
        if remote_addr == ctx.local_name {
            return Err(ChannelError::SelfConnection(remote_addr));
        }
        let conn = Self::build(ctx, transport, Direction::In, remote_addr, None);
        conn.inner.transport.start(&conn);
        tracing::debug!(conn = %conn.id(), remote_addr = %conn.remote_addr(), "Inbound connection accepted");
        Ok(conn)
    }

    /// One side of an in-process connection pair, identified from the start.
    pub(crate) fn loopback(ctx: Arc<ChannelContext>, transport: Arc<dyn Transport>, direction: Direction) -> Self {
        let local_name = ctx.local_name.clone();
        let conn = Self::build(ctx, transport, direction, local_name.clone(), Some(local_name));
        conn.inner.transport.start(&conn);
        conn
    }

    fn build(
        ctx: Arc<ChannelContext>,
        transport: Arc<dyn Transport>,
        direction: Direction,
        remote_addr: String,
        remote_name: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                direction,
                remote_addr,
                ctx,
                transport,
                state: Mutex::new(ConnectionState {
                    remote_name,
                    ..Default::default()
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local_init(&self) -> Init {
        Init {
            host_port: self.inner.ctx.local_name.clone(),
            process_name: self.inner.ctx.process_name.clone(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Name learned from the handshake; `None` until identified.
    pub fn remote_name(&self) -> Option<String> {
        self.lock().remote_name.clone()
    }

    pub fn is_identified(&self) -> bool {
        self.lock().remote_name.is_some()
    }

    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    pub fn close_error(&self) -> Option<ChannelError> {
        self.lock().close_error.clone()
    }

    /// Outbound calls still waiting on this connection.
    pub fn pending_out(&self) -> usize {
        self.lock().ops.pending_out()
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    /// Run `callback` once: on identification, or with the close error.
    pub fn on_identified(&self, callback: impl FnOnce(Result<(), ChannelError>) + Send + 'static) {
        let mut st = self.lock();
        if st.closing {
            let err = st.close_error.clone().unwrap_or(ChannelError::ConnectionClosed);
            drop(st);
            callback(Err(err));
            return;
        }
        if st.remote_name.is_some() {
            drop(st);
            callback(Ok(()));
            return;
        }
        st.identify_waiters.push(Box::new(callback));
    }

    /// Run `listener` once when the connection starts closing.
    pub fn on_close(&self, listener: impl FnOnce(&ChannelError) + Send + 'static) {
        let mut st = self.lock();
        if st.closing {
            let err = st.close_error.clone().unwrap_or(ChannelError::ConnectionClosed);
            drop(st);
            listener(&err);
            return;
        }
        st.close_listeners.push(Box::new(listener));
    }

    /// Start an outbound call.
    pub fn request(
        &self,
        options: RequestOptions,
        observer: Option<Arc<dyn RequestObserver>>,
    ) -> Result<PendingCall, ChannelError> {
        let ctx = &self.inner.ctx;
        let now = ctx.clock.now_ms();
        let ttl_ms = options.ttl_ms.unwrap_or(ctx.connection.request_ttl_ms);
        let tags = CallTags {
            service: options.caller_name().unwrap_or(&ctx.process_name).to_string(),
            target_service: options.service.clone(),
            target_endpoint: options.endpoint.clone(),
        };
        let span = ctx.tracer.as_ref().map(|_| {
            let mut span = match &options.parent_span {
                Some(parent) => parent.child(options.endpoint.clone(), ctx.random.as_ref()),
                None => Span::root(options.endpoint.clone(), ctx.random.as_ref()),
            };
            span.annotate("cs", now);
            span
        });
        let trace_ids = span.as_ref().map(|span| TraceIds {
            trace_id: span.trace_id,
            span_id: span.span_id,
            parent_id: span.parent_id,
        });

        let (reply, rx) = oneshot::channel();
        let id = {
            let mut st = self.lock();
            if st.closing {
                return Err(st.close_error.clone().unwrap_or(ChannelError::ConnectionClosed));
            }
            let id = st.ops.next_id();
            st.ops.add_out(
                id,
                OutOperation {
                    started_ms: now,
                    deadline_ms: now.saturating_add(ttl_ms),
                    tags: tags.clone(),
                    observer: observer.clone(),
                    span,
                    stage: OutStage::Awaiting(reply),
                },
            );
            id
        };

        if let Some(observer) = &observer {
            observer.on_request();
        }
        ctx.stats.emit(tagged(Stat::counter("outbound.calls.sent", 1), &tags));

        let RequestOptions {
            service,
            endpoint,
            headers,
            arg2,
            arg3,
            ..
        } = options;
        self.send_frame(Frame::new(
            id,
            FrameBody::CallRequest(CallRequest {
                is_last: true,
                ttl_ms,
                service,
                headers,
                tracing: trace_ids,
                args: vec![Bytes::from(endpoint.into_bytes()), arg2, arg3],
            }),
        ));
        Ok(PendingCall::new(id, rx))
    }

    /// Send a ping; the receiver fires on the matching ping response.
    pub fn ping(&self) -> Result<oneshot::Receiver<()>, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut st = self.lock();
            if st.closing {
                return Err(st.close_error.clone().unwrap_or(ChannelError::ConnectionClosed));
            }
            let id = st.ops.next_id();
            st.ops.add_ping(id, tx);
            id
        };
        self.send_frame(Frame::new(id, FrameBody::PingRequest));
        Ok(rx)
    }

    pub(crate) fn send_frame(&self, frame: Frame) {
        if self.inner.transport.is_destroyed() {
            tracing::trace!(conn = %self.id(), kind = %frame.kind(), "Dropping frame for destroyed transport");
            return;
        }
        if let Err(e) = self.inner.transport.send(frame) {
            self.on_write_error(e.to_string());
        }
    }

    /// Dispatch one decoded frame.
    pub fn handle_frame(&self, frame: Frame) {
        if self.is_closing() {
            tracing::trace!(conn = %self.id(), kind = %frame.kind(), "Ignoring frame on closing connection");
            return;
        }
        let id = frame.id;
        match frame.body {
            FrameBody::InitRequest(init) => self.handle_init_request(id, init),
            FrameBody::InitResponse(init) => self.handle_init_response(init),
            FrameBody::CallRequest(req) => self.handle_call_request(id, req),
            FrameBody::CallRequestContinuation(cont) => self.handle_call_request_cont(id, cont),
            FrameBody::CallResponse(res) => self.handle_call_response(id, res),
            FrameBody::CallResponseContinuation(cont) => self.handle_call_response_cont(id, cont),
            FrameBody::CallError(err) => self.handle_call_error(id, err),
            FrameBody::PingRequest => self.send_frame(Frame::new(id, FrameBody::PingResponse)),
            FrameBody::PingResponse => self.handle_ping_response(id),
        }
    }

    fn handle_init_request(&self, id: u32, init: Init) {
        if self.inner.direction != Direction::In || self.is_identified() {
            self.on_handler_error(ChannelError::Handler("unexpected init request".into()));
            return;
        }
        let ephemeral = init.host_port == EPHEMERAL_HOST_PORT;
        let remote_name = if ephemeral {
            self.inner.remote_addr.clone()
        } else {
            init.host_port
        };
        if remote_name == self.inner.ctx.local_name {
            self.on_handler_error(ChannelError::SelfConnection(remote_name));
            return;
        }

        self.send_frame(Frame::new(id, FrameBody::InitResponse(self.local_init())));
        let waiters = {
            let mut st = self.lock();
            st.remote_name = Some(remote_name.clone());
            st.ephemeral = ephemeral;
            mem::take(&mut st.identify_waiters)
        };
        tracing::debug!(
            conn = %self.id(),
            remote_name = %remote_name,
            process_name = %init.process_name,
            "Inbound connection identified"
        );
        if let Some(directory) = self.inner.ctx.peer_directory() {
            directory.register_inbound(&remote_name, self);
        }
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    fn handle_init_response(&self, init: Init) {
        if self.inner.direction != Direction::Out || self.is_identified() {
            self.on_handler_error(ChannelError::Handler("unexpected init response".into()));
            return;
        }
        let waiters = {
            let mut st = self.lock();
            st.remote_name = Some(init.host_port.clone());
            mem::take(&mut st.identify_waiters)
        };
        tracing::debug!(
            conn = %self.id(),
            remote_name = %init.host_port,
            process_name = %init.process_name,
            "Outbound connection identified"
        );
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    fn handle_call_request(&self, id: u32, req: CallRequest) {
        let remote_name = {
            let mut st = self.lock();
            if self.inner.direction == Direction::In && st.remote_name.is_none() {
                drop(st);
                self.on_handler_error(ChannelError::Handler("call request before init request".into()));
                return;
            }
            if !req.is_last {
                let args = req.args.iter().map(|arg| arg.to_vec()).collect();
                st.partial_requests.insert(id, PartialRequest { head: req, args });
                return;
            }
            st.remote_name.clone()
        };
        self.dispatch_request(id, req, remote_name);
    }

    fn handle_call_request_cont(&self, id: u32, cont: CallContinuation) {
        let (complete, remote_name) = {
            let mut st = self.lock();
            let Some(partial) = st.partial_requests.get_mut(&id) else {
                drop(st);
                tracing::info!(conn = %self.id(), id, "Got call request continuation for unknown id");
                return;
            };
            append_parts(&mut partial.args, &cont.args);
            if !cont.is_last {
                return;
            }
            (st.partial_requests.remove(&id), st.remote_name.clone())
        };
        if let Some(PartialRequest { mut head, args }) = complete {
            head.args = args.into_iter().map(Bytes::from).collect();
            self.dispatch_request(id, head, remote_name);
        }
    }

    fn dispatch_request(&self, id: u32, req: CallRequest, remote_name: Option<String>) {
        let ctx = &self.inner.ctx;
        let request = IncomingRequest {
            id,
            service: req.service,
            headers: req.headers,
            args: req.args,
            ttl_ms: req.ttl_ms,
            remote_name,
            tracing: req.tracing,
        };
        ctx.stats.emit(
            Stat::counter("inbound.calls.recvd", 1)
                .with_tag("calling-service", request.caller_name().unwrap_or_default())
                .with_tag("service", request.service.clone())
                .with_tag("endpoint", request.endpoint()),
        );

        let span = match (&ctx.tracer, request.tracing) {
            (Some(_), Some(ids)) => {
                let mut span = Span {
                    name: request.endpoint(),
                    trace_id: ids.trace_id,
                    span_id: ids.span_id,
                    parent_id: ids.parent_id,
                    annotations: Vec::new(),
                };
                span.annotate("sr", ctx.clock.now_ms());
                Some(span)
            }
            _ => None,
        };
        let builder = ResponseBuilder::new(id, Arc::new(self.clone()), ctx.clock.clone())
            .with_span(span, ctx.tracer.clone());
        ctx.handler.handle_request(request, builder);
    }

    fn handle_call_response(&self, id: u32, res: CallResponse) {
        let ctx = &self.inner.ctx;
        let mut st = self.lock();
        let Some(op) = st.ops.pop_out(id) else {
            drop(st);
            tracing::info!(conn = %self.id(), id, "Got call response for unknown id");
            return;
        };
        let OutOperation {
            started_ms,
            deadline_ms,
            tags,
            observer,
            span,
            stage,
        } = op;
        let reply = match stage {
            OutStage::Awaiting(reply) => reply,
            OutStage::Streaming(chunks) => {
                st.ops.add_out(
                    id,
                    OutOperation {
                        started_ms,
                        deadline_ms,
                        tags,
                        observer,
                        span,
                        stage: OutStage::Streaming(chunks),
                    },
                );
                drop(st);
                tracing::warn!(conn = %self.id(), id, "Duplicate call response");
                return;
            }
        };
        let chunks = if res.is_last {
            None
        } else {
            let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
            st.ops.add_out(
                id,
                OutOperation {
                    started_ms,
                    deadline_ms,
                    tags: tags.clone(),
                    observer: None,
                    span: None,
                    stage: OutStage::Streaming(chunk_tx),
                },
            );
            Some(chunk_rx)
        };
        drop(st);

        let now = ctx.clock.now_ms();
        let ok = res.code == 0;
        let span = span.map(|mut span| {
            span.annotate("cr", now);
            span
        });
        if let (Some(tracer), Some(span)) = (&ctx.tracer, &span) {
            tracer.report(span.clone());
        }
        ctx.stats.emit(tagged(
            Stat::timing("outbound.calls.latency", now.saturating_sub(started_ms)),
            &tags,
        ));
        if ok {
            ctx.stats.emit(tagged(Stat::counter("outbound.calls.success", 1), &tags));
        } else {
            ctx.stats.emit(tagged(Stat::counter("outbound.calls.app-errors", 1), &tags).with_tag("type", "not-ok"));
        }

        let response = IncomingResponse::new(id, ok, res.headers, res.args, span, chunks);
        if let Some(observer) = observer {
            observer.on_request_response(&response);
        }
        let _ = reply.send(Ok(response));
    }

    fn handle_call_response_cont(&self, id: u32, cont: CallContinuation) {
        let chunks = {
            let mut st = self.lock();
            let chunks = match st.ops.out_mut(id) {
                Some(OutOperation {
                    stage: OutStage::Streaming(chunks),
                    ..
                }) => Some(chunks.clone()),
                _ => None,
            };
            if chunks.is_some() && cont.is_last {
                st.ops.pop_out(id);
            }
            chunks
        };
        match chunks {
            Some(chunks) => {
                let _ = chunks.send(ResponseChunk::Parts {
                    args: cont.args,
                    is_last: cont.is_last,
                });
            }
            None => {
                tracing::info!(conn = %self.id(), id, "Got call response continuation without a streaming response");
            }
        }
    }

    fn handle_call_error(&self, id: u32, err: CallError) {
        let op = self.lock().ops.pop_out(id);
        let Some(op) = op else {
            tracing::info!(conn = %self.id(), id, code = %err.code, "Got error frame for unknown id");
            return;
        };
        let error = ChannelError::CallFailed {
            code: err.code,
            message: err.message,
        };
        self.fail_operation(op, &error);
    }

    fn handle_ping_response(&self, id: u32) {
        let waiter = self.lock().ops.pop_ping(id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => tracing::info!(conn = %self.id(), id, "Got ping response for unknown id"),
        }
    }

    /// Complete an operation that already left the table with `err`.
    fn fail_operation(&self, op: OutOperation, err: &ChannelError) {
        match op.stage {
            OutStage::Awaiting(reply) => {
                self.inner.ctx.stats.emit(
                    tagged(Stat::counter("outbound.calls.system-errors", 1), &op.tags)
                        .with_tag("type", err.type_tag()),
                );
                if let Some(observer) = &op.observer {
                    observer.on_request_error(err);
                }
                let _ = reply.send(Err(err.clone()));
            }
            OutStage::Streaming(chunks) => {
                let _ = chunks.send(ResponseChunk::Error(err.clone()));
            }
        }
    }

    /// Mark the connection closing and fail every pending operation with
    /// `err`. Idempotent; the transport is left alone.
    pub fn reset_all(&self, err: ChannelError) {
        let (first, ops, pings, waiters, listeners) = {
            let mut st = self.lock();
            let first = !st.closing;
            st.closing = true;
            if first {
                st.close_error = Some(err.clone());
            }
            st.partial_requests.clear();
            let (ops, pings) = st.ops.drain();
            (
                first,
                ops,
                pings,
                mem::take(&mut st.identify_waiters),
                mem::take(&mut st.close_listeners),
            )
        };

        if first {
            tracing::info!(
                conn = %self.id(),
                direction = %self.inner.direction,
                remote_addr = %self.inner.remote_addr,
                pending = ops.len(),
                error = %err,
                "Resetting connection"
            );
        }
        for (_, op) in ops {
            self.fail_operation(op, &err);
        }
        drop(pings);
        for waiter in waiters {
            waiter(Err(err.clone()));
        }
        for listener in listeners {
            listener(&err);
        }
    }

    /// The byte stream could not be decoded.
    pub fn on_read_error(&self, message: impl Into<String>) {
        let err = ChannelError::ReadProtocol {
            message: message.into(),
            remote_name: self.remote_name(),
            local_name: self.inner.ctx.local_name.clone(),
        };
        tracing::warn!(conn = %self.id(), error = %err, "Read failed");
        self.reset_all(err);
        self.inner.transport.destroy();
    }

    /// A local write failed.
    pub fn on_write_error(&self, message: impl Into<String>) {
        let err = ChannelError::WriteProtocol {
            message: message.into(),
            remote_name: self.remote_name(),
            local_name: self.inner.ctx.local_name.clone(),
        };
        tracing::warn!(conn = %self.id(), error = %err, "Write failed");
        self.reset_all(err);
        self.inner.transport.destroy();
    }

    pub fn on_handler_error(&self, err: ChannelError) {
        tracing::warn!(conn = %self.id(), error = %err, "Connection handler failed");
        self.reset_all(err);
        self.inner.transport.destroy();
    }

    pub fn on_timed_out(&self, err: ChannelError) {
        tracing::warn!(conn = %self.id(), error = %err, "Destroying socket from timeouts");
        self.reset_all(err);
        self.inner.transport.destroy();
    }

    pub fn on_socket_error(&self, message: impl Into<String>) {
        let err = ChannelError::Socket {
            message: message.into(),
            direction: self.inner.direction,
            remote_addr: self.inner.remote_addr.clone(),
        };
        tracing::warn!(conn = %self.id(), error = %err, "Socket error");
        if !self.is_closing() {
            self.reset_all(err);
        }
    }

    /// The socket is gone, whoever closed it.
    pub fn on_socket_closed(&self) {
        let remote_name = self.remote_name();
        self.reset_all(ChannelError::SocketClosed {
            reason: "remote closed".into(),
            direction: self.inner.direction,
            remote_addr: self.inner.remote_addr.clone(),
            remote_name: remote_name.clone(),
        });
        let (callbacks, ephemeral) = {
            let mut st = self.lock();
            st.socket_closed = true;
            (mem::take(&mut st.close_callbacks), st.ephemeral)
        };
        if ephemeral {
            if let Some(directory) = self.inner.ctx.peer_directory() {
                directory.forget_unidentified(&self.inner.remote_addr);
            }
        }
        for callback in callbacks {
            callback();
        }
    }

    /// Check the pending table against the clock; any expired call times
    /// the whole connection out.
    pub fn sweep_timeouts(&self) {
        let now = self.inner.ctx.clock.now_ms();
        let expired = self.lock().ops.first_expired(now);
        if let Some((id, elapsed_ms)) = expired {
            self.on_timed_out(ChannelError::TimedOut { id, elapsed_ms });
        }
    }

    /// Close locally. `callback` runs once the socket has closed, right away
    /// if it already has.
    pub fn close(&self, callback: impl FnOnce() + Send + 'static) {
        let mut st = self.lock();
        if st.socket_closed {
            drop(st);
            callback();
            return;
        }
        st.close_callbacks.push(Box::new(callback));
        drop(st);

        self.reset_all(ChannelError::LocalSocketClose);
        self.inner.transport.destroy();
    }
}

impl ResponseSink for Connection {
    fn send_response_frame(&self, frame: Frame) {
        self.send_frame(frame);
    }
}

fn tagged(stat: Stat, tags: &CallTags) -> Stat {
    stat.with_tag("service", tags.service.clone())
        .with_tag("target-service", tags.target_service.clone())
        .with_tag("target-endpoint", tags.target_endpoint.clone())
}
