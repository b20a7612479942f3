//! Error taxonomy for the transport core.
//!
//! # Categories
//! - Admission errors (`BadRequest`, `Declined`): answered synchronously,
//!   never fatal to the connection
//! - Transport errors (`Socket`, `SocketClosed`, `LocalSocketClose`,
//!   `ReadProtocol`, `WriteProtocol`, `TimedOut`): fatal to the connection,
//!   fanned out to every pending operation exactly once
//! - Framing misuse (`ResponseFrameState`, `ResponseAlreadyDone`,
//!   `ResponseAlreadyStarted`): surfaced on the affected response only
//! - Peer lifecycle (`ConnectionClosed`, `SelfConnection`, `InvalidDestination`):
//!   surfaced to the waiting caller
//!
//! `ChannelError` is `Clone` because a single connection reset hands the same
//! error to every outstanding operation.

use std::fmt;

use crate::net::Direction;

/// Wire-level error codes carried by `call-error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout,
    Cancelled,
    Busy,
    Declined,
    UnexpectedError,
    BadRequest,
    NetworkError,
    ProtocolError,
}

impl ErrorCode {
    /// Name used on the wire and in stat tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::Busy => "Busy",
            ErrorCode::Declined => "Declined",
            ErrorCode::UnexpectedError => "UnexpectedError",
            ErrorCode::BadRequest => "BadRequest",
            ErrorCode::NetworkError => "NetworkError",
            ErrorCode::ProtocolError => "ProtocolError",
        }
    }

    /// Parse a wire name back into a code.
    pub fn parse(name: &str) -> Option<Self> {
        let code = match name {
            "Timeout" => ErrorCode::Timeout,
            "Cancelled" => ErrorCode::Cancelled,
            "Busy" => ErrorCode::Busy,
            "Declined" => ErrorCode::Declined,
            "UnexpectedError" => ErrorCode::UnexpectedError,
            "BadRequest" => ErrorCode::BadRequest,
            "NetworkError" => ErrorCode::NetworkError,
            "ProtocolError" => ErrorCode::ProtocolError,
            _ => return None,
        };
        Some(code)
    }

    /// Whether an outcome with this code counts against a circuit's health.
    ///
    /// Caller mistakes and our own refusals do not say anything about the
    /// health of the service behind the circuit.
    pub fn is_unhealthy(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::Busy
                | ErrorCode::UnexpectedError
                | ErrorCode::NetworkError
                | ErrorCode::ProtocolError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every error the transport core can produce.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("declined: {0}")]
    Declined(String),

    #[error("socket error on {direction} connection to {remote_addr}: {message}")]
    Socket {
        message: String,
        direction: Direction,
        remote_addr: String,
    },

    #[error("socket closed ({reason}) on {direction} connection to {remote_addr}")]
    SocketClosed {
        reason: String,
        direction: Direction,
        remote_addr: String,
        remote_name: Option<String>,
    },

    #[error("connection closed locally")]
    LocalSocketClose,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("read protocol error from {remote_name:?} at {local_name}: {message}")]
    ReadProtocol {
        message: String,
        remote_name: Option<String>,
        local_name: String,
    },

    #[error("write protocol error to {remote_name:?} at {local_name}: {message}")]
    WriteProtocol {
        message: String,
        remote_name: Option<String>,
        local_name: String,
    },

    #[error("request {id} timed out after {elapsed_ms}ms")]
    TimedOut { id: u32, elapsed_ms: u64 },

    #[error("call failed with {code}: {message}")]
    CallFailed { code: ErrorCode, message: String },

    #[error("cannot send {attempted} in {state} state")]
    ResponseFrameState { attempted: String, state: String },

    #[error("response already done, cannot send {attempted}")]
    ResponseAlreadyDone { attempted: String },

    #[error("response already started (state {state})")]
    ResponseAlreadyStarted { state: String },

    #[error("refusing to create self connection to {0}")]
    SelfConnection(String),

    #[error("invalid destination {0}")]
    InvalidDestination(String),

    #[error("no peer available for {0}")]
    NoPeerAvailable(String),

    #[error("handler error: {0}")]
    Handler(String),
}

impl ChannelError {
    /// The wire code used when this error is reported in a `call-error` frame.
    pub fn code(&self) -> ErrorCode {
        match self {
            ChannelError::BadRequest(_) => ErrorCode::BadRequest,
            ChannelError::Declined(_) | ChannelError::NoPeerAvailable(_) => ErrorCode::Declined,
            ChannelError::Socket { .. }
            | ChannelError::SocketClosed { .. }
            | ChannelError::LocalSocketClose
            | ChannelError::ConnectionClosed => ErrorCode::NetworkError,
            ChannelError::ReadProtocol { .. } | ChannelError::WriteProtocol { .. } => {
                ErrorCode::ProtocolError
            }
            ChannelError::TimedOut { .. } => ErrorCode::Timeout,
            ChannelError::CallFailed { code, .. } => *code,
            ChannelError::ResponseFrameState { .. }
            | ChannelError::ResponseAlreadyDone { .. }
            | ChannelError::ResponseAlreadyStarted { .. }
            | ChannelError::SelfConnection(_)
            | ChannelError::InvalidDestination(_)
            | ChannelError::Handler(_) => ErrorCode::UnexpectedError,
        }
    }

    /// Stat tag describing the error kind.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ChannelError::BadRequest(_) => "bad-request",
            ChannelError::Declined(_) => "declined",
            ChannelError::Socket { .. } => "socket",
            ChannelError::SocketClosed { .. } => "socket-closed",
            ChannelError::LocalSocketClose => "local-socket-close",
            ChannelError::ConnectionClosed => "connection-closed",
            ChannelError::ReadProtocol { .. } => "read-protocol",
            ChannelError::WriteProtocol { .. } => "write-protocol",
            ChannelError::TimedOut { .. } => "timeout",
            ChannelError::CallFailed { .. } => "call-failed",
            ChannelError::ResponseFrameState { .. } => "response-frame-state",
            ChannelError::ResponseAlreadyDone { .. } => "response-already-done",
            ChannelError::ResponseAlreadyStarted { .. } => "response-already-started",
            ChannelError::SelfConnection(_) => "self-connection",
            ChannelError::InvalidDestination(_) => "invalid-destination",
            ChannelError::NoPeerAvailable(_) => "no-peer-available",
            ChannelError::Handler(_) => "handler",
        }
    }

    /// True for errors that tear the whole connection down.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChannelError::Socket { .. }
                | ChannelError::SocketClosed { .. }
                | ChannelError::LocalSocketClose
                | ChannelError::ConnectionClosed
                | ChannelError::ReadProtocol { .. }
                | ChannelError::WriteProtocol { .. }
                | ChannelError::TimedOut { .. }
        )
    }
}
