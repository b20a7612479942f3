//! Peer transport core: peers, multiplexed connections, circuits and
//! response framing for a TChannel-style RPC channel.
//!
//! # Architecture Overview
//!
//! ```text
//!     outbound call                                    inbound call
//!          │                                                ▲
//!          ▼                                                │
//!   ┌─────────────┐    ┌──────────────┐    ┌──────────┐    ┌┴──────────────┐
//!   │   channel   │───▶│ peer registry│───▶│   peer   │───▶│  connection   │◀──── frames
//!   └─────────────┘    └──────────────┘    └──────────┘    └───────┬───────┘      (codec)
//!                                                                  │
//!                                                                  ▼
//!                                          ┌──────────────┐    ┌──────────────┐
//!                                          │   response   │◀───│   circuits   │
//!                                          │    stream    │    │  + handler   │
//!                                          └──────────────┘    └──────────────┘
//! ```

pub mod call;
pub mod channel;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod errors;
pub mod health;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod peer;
pub mod response;

#[cfg(test)]
pub(crate) mod test_support;

pub use call::{IncomingRequest, IncomingResponse, RequestHandler, RequestOptions};
pub use channel::{Channel, ChannelContext};
pub use config::ChannelConfig;
pub use errors::{ChannelError, ErrorCode};
pub use lifecycle::Shutdown;
