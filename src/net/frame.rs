//! Typed frames exchanged with the frame codec.
//!
//! The codec turns bytes into these values and back; nothing in this crate
//! looks at the byte layout.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::errors::ErrorCode;

/// Kind of a frame, for dispatch and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    InitRequest,
    InitResponse,
    CallRequest,
    CallRequestContinuation,
    CallResponse,
    CallResponseContinuation,
    CallError,
    PingRequest,
    PingResponse,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::InitRequest => "init-request",
            FrameKind::InitResponse => "init-response",
            FrameKind::CallRequest => "call-request",
            FrameKind::CallRequestContinuation => "call-request-continuation",
            FrameKind::CallResponse => "call-response",
            FrameKind::CallResponseContinuation => "call-response-continuation",
            FrameKind::CallError => "call-error",
            FrameKind::PingRequest => "ping-request",
            FrameKind::PingResponse => "ping-response",
        };
        f.write_str(name)
    }
}

/// Identification payload of init frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub host_port: String,
    pub process_name: String,
}

/// Tracing ids propagated with a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceIds {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: Option<u64>,
}

/// First frame of an inbound or outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub is_last: bool,
    pub ttl_ms: u64,
    pub service: String,
    pub headers: BTreeMap<String, String>,
    pub tracing: Option<TraceIds>,
    pub args: Vec<Bytes>,
}

/// First frame of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub is_last: bool,
    /// 0 for ok, 1 for an application-level failure.
    pub code: u8,
    pub headers: BTreeMap<String, String>,
    pub args: Vec<Bytes>,
}

/// Continuation of a streamed call request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContinuation {
    pub is_last: bool,
    pub args: Vec<Bytes>,
}

/// Error answer to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub code: ErrorCode,
    pub message: String,
}

/// Frame body by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    InitRequest(Init),
    InitResponse(Init),
    CallRequest(CallRequest),
    CallRequestContinuation(CallContinuation),
    CallResponse(CallResponse),
    CallResponseContinuation(CallContinuation),
    CallError(CallError),
    PingRequest,
    PingResponse,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(id: u32, body: FrameBody) -> Self {
        Self { id, body }
    }

    pub fn kind(&self) -> FrameKind {
        match self.body {
            FrameBody::InitRequest(_) => FrameKind::InitRequest,
            FrameBody::InitResponse(_) => FrameKind::InitResponse,
            FrameBody::CallRequest(_) => FrameKind::CallRequest,
            FrameBody::CallRequestContinuation(_) => FrameKind::CallRequestContinuation,
            FrameBody::CallResponse(_) => FrameKind::CallResponse,
            FrameBody::CallResponseContinuation(_) => FrameKind::CallResponseContinuation,
            FrameBody::CallError(_) => FrameKind::CallError,
            FrameBody::PingRequest => FrameKind::PingRequest,
            FrameBody::PingResponse => FrameKind::PingResponse,
        }
    }
}

/// Append continuation parts to accumulated args.
///
/// The first part continues the last arg already present; the rest open new
/// args in order.
pub fn append_parts(args: &mut Vec<Vec<u8>>, parts: &[Bytes]) {
    let mut parts = parts.iter();
    let Some(first) = parts.next() else {
        return;
    };
    if args.is_empty() {
        args.push(first.to_vec());
    } else if let Some(last) = args.last_mut() {
        last.extend_from_slice(first);
    }
    for part in parts {
        args.push(part.to_vec());
    }
}
