//! Outbound response subsystem.
//!
//! # Data Flow
//! ```text
//! Connection receives call-request
//!     → ResponseBuilder (id, sink, span) handed to the RequestHandler
//!     → wrappers attach observers (circuit monitor)
//!     → build() → ResponseStream
//!     → stream.rs (state machine, frames)
//!     → argstream.rs (arg2/arg3 multiplexing when streamed)
//!     → ResponseSink (the connection) writes frames
//!
//! States:
//!     Initial → Streaming → Done
//!         ↘         ↘
//!          Error ←───┘
//! ```
//!
//! # Design Decisions
//! - Misuse is returned as an error and also reported to observers; it never
//!   touches the connection
//! - Finish is reported exactly once per response

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::errors::{ChannelError, ErrorCode};
use crate::net::frame::Frame;
use crate::observability::{Span, Tracer};

pub mod argstream;
pub mod stream;

pub use argstream::OutArgStream;
pub use stream::ResponseStream;

/// Where a response writes its frames.
pub trait ResponseSink: Send + Sync {
    fn send_response_frame(&self, frame: Frame);
}

/// Framing state of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Initial,
    Streaming,
    Done,
    Error,
}

impl ResponseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseState::Done | ResponseState::Error)
    }
}

impl fmt::Display for ResponseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseState::Initial => "Initial",
            ResponseState::Streaming => "Streaming",
            ResponseState::Done => "Done",
            ResponseState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// How a response ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    NotOk,
    Error { code: ErrorCode, message: String },
}

/// Reported once when a response completes.
#[derive(Debug, Clone, PartialEq)]
pub struct Finish {
    pub id: u32,
    pub start_ms: Option<u64>,
    pub end_ms: u64,
    pub outcome: Outcome,
    pub span: Option<Span>,
}

/// Watches one response.
pub trait ResponseObserver: Send + Sync {
    fn on_response_error(&self, _err: &ChannelError) {}
    fn on_response_finish(&self, _finish: &Finish) {}
}

#[derive(Debug, Clone, Default)]
pub struct ResponseOptions {
    pub streamed: bool,
    pub headers: BTreeMap<String, String>,
}

impl ResponseOptions {
    pub fn streamed() -> Self {
        Self {
            streamed: true,
            ..Default::default()
        }
    }
}

/// Everything needed to build the response to one inbound call.
pub struct ResponseBuilder {
    id: u32,
    sink: Arc<dyn ResponseSink>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn ResponseObserver>>,
    span: Option<Span>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl fmt::Debug for ResponseBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBuilder")
            .field("id", &self.id)
            .field("observers", &self.observers.len())
            .field("span", &self.span)
            .finish()
    }
}

impl ResponseBuilder {
    pub fn new(id: u32, sink: Arc<dyn ResponseSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            id,
            sink,
            clock,
            observers: Vec::new(),
            span: None,
            tracer: None,
        }
    }

    pub fn with_span(mut self, span: Option<Span>, tracer: Option<Arc<dyn Tracer>>) -> Self {
        self.span = span;
        self.tracer = tracer;
        self
    }

    /// Attach an observer to the response this builder produces.
    pub fn observe(mut self, observer: Arc<dyn ResponseObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn build(self, options: ResponseOptions) -> ResponseStream {
        ResponseStream::new(
            self.id,
            options,
            self.sink,
            self.clock,
            self.observers,
            self.span,
            self.tracer,
        )
    }

    /// Shorthand for a single-frame response.
    pub fn unstreamed(self) -> ResponseStream {
        self.build(ResponseOptions::default())
    }
}
