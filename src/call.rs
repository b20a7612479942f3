//! Call-level types shared by connections, peers, circuits and handlers.
//!
//! # Responsibilities
//! - Describe an outbound request and hand back a single-fire completion
//! - Describe an inbound request as dispatched to a handler
//! - Describe an inbound response, streamed or complete
//! - Define the handler and observer seams

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::errors::ChannelError;
use crate::net::frame::{append_parts, TraceIds};
use crate::observability::Span;
use crate::response::ResponseBuilder;

/// Header carrying the caller's service name.
pub const CALLER_NAME_HEADER: &str = "cn";

/// Options for one outbound call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub service: String,
    pub endpoint: String,
    pub headers: BTreeMap<String, String>,
    pub arg2: Bytes,
    pub arg3: Bytes,
    /// Overrides the connection's default time-to-live.
    pub ttl_ms: Option<u64>,
    pub parent_span: Option<Span>,
}

impl RequestOptions {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_caller(self, caller: impl Into<String>) -> Self {
        self.with_header(CALLER_NAME_HEADER, caller)
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }

    pub fn with_args(mut self, arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) -> Self {
        self.arg2 = arg2.into();
        self.arg3 = arg3.into();
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn caller_name(&self) -> Option<&str> {
        self.headers.get(CALLER_NAME_HEADER).map(String::as_str)
    }
}

/// Handle on an in-flight outbound call. Resolves exactly once.
#[derive(Debug)]
pub struct PendingCall {
    id: u32,
    rx: oneshot::Receiver<Result<IncomingResponse, ChannelError>>,
}

impl PendingCall {
    pub(crate) fn new(id: u32, rx: oneshot::Receiver<Result<IncomingResponse, ChannelError>>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Non-blocking check; `None` while the call is still pending.
    pub fn try_result(&mut self) -> Option<Result<IncomingResponse, ChannelError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ChannelError::ConnectionClosed)),
        }
    }

    /// Wait for the response head or the failure.
    pub async fn response(self) -> Result<IncomingResponse, ChannelError> {
        self.rx.await.unwrap_or(Err(ChannelError::ConnectionClosed))
    }
}

/// Continuation of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseChunk {
    Parts { args: Vec<Bytes>, is_last: bool },
    Error(ChannelError),
}

/// Response to an outbound call as seen by the caller.
#[derive(Debug)]
pub struct IncomingResponse {
    pub id: u32,
    pub ok: bool,
    pub headers: BTreeMap<String, String>,
    pub args: Vec<Bytes>,
    pub span: Option<Span>,
    chunks: Option<mpsc::UnboundedReceiver<ResponseChunk>>,
}

impl IncomingResponse {
    pub(crate) fn new(
        id: u32,
        ok: bool,
        headers: BTreeMap<String, String>,
        args: Vec<Bytes>,
        span: Option<Span>,
        chunks: Option<mpsc::UnboundedReceiver<ResponseChunk>>,
    ) -> Self {
        Self {
            id,
            ok,
            headers,
            args,
            span,
            chunks,
        }
    }

    /// True when more frames follow the first one.
    pub fn is_streaming(&self) -> bool {
        self.chunks.is_some()
    }

    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    pub fn arg2(&self) -> Option<&Bytes> {
        self.arg(1)
    }

    pub fn arg3(&self) -> Option<&Bytes> {
        self.arg(2)
    }

    pub async fn next_chunk(&mut self) -> Option<ResponseChunk> {
        match self.chunks.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Drain every continuation and return the reassembled args.
    pub async fn collect(mut self) -> Result<Vec<Vec<u8>>, ChannelError> {
        let mut args: Vec<Vec<u8>> = self.args.iter().map(|a| a.to_vec()).collect();
        if self.chunks.is_none() {
            return Ok(args);
        }
        while let Some(chunk) = self.next_chunk().await {
            match chunk {
                ResponseChunk::Parts { args: parts, is_last } => {
                    append_parts(&mut args, &parts);
                    if is_last {
                        return Ok(args);
                    }
                }
                ResponseChunk::Error(err) => return Err(err),
            }
        }
        Err(ChannelError::ConnectionClosed)
    }
}

/// Inbound call handed to a [`RequestHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub id: u32,
    pub service: String,
    pub headers: BTreeMap<String, String>,
    pub args: Vec<Bytes>,
    pub ttl_ms: u64,
    pub remote_name: Option<String>,
    pub tracing: Option<TraceIds>,
}

impl IncomingRequest {
    pub fn caller_name(&self) -> Option<&str> {
        self.headers
            .get(CALLER_NAME_HEADER)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Endpoint name carried in arg1.
    pub fn endpoint(&self) -> String {
        self.args
            .first()
            .map(|arg1| String::from_utf8_lossy(arg1).into_owned())
            .unwrap_or_default()
    }

    pub fn arg2(&self) -> Bytes {
        self.args.get(1).cloned().unwrap_or_default()
    }

    pub fn arg3(&self) -> Bytes {
        self.args.get(2).cloned().unwrap_or_default()
    }
}

/// Serves inbound calls.
///
/// The handler owns the response: it builds it from `res` and must finish it
/// with a frame or an error.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, req: IncomingRequest, res: ResponseBuilder);
}

impl fmt::Debug for dyn RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestHandler")
    }
}

/// Observes the lifecycle of outbound calls.
pub trait RequestObserver: Send + Sync {
    fn on_request(&self) {}
    fn on_request_error(&self, err: &ChannelError);
    fn on_request_response(&self, res: &IncomingResponse);
}
