//! Peer subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound request:
//!     → registry.rs (choose_peer: highest score wins)
//!     → node.rs (connect: reuse or open outbound connection)
//!     → Connection::request
//!
//! Inbound identification:
//!     Connection (init request) → PeerDirectory::register_inbound
//!     → registry.rs (get_or_create) → node.rs (add_connection at head)
//!
//! Membership change:
//!     → registry.rs (retain: evict + close)
//! ```
//!
//! # Design Decisions
//! - Inbound connections sit at the head of a peer's list, outbound at the tail
//! - Selection scores are banded by connectivity; see `score.rs`

pub mod node;
pub mod registry;
pub mod score;

pub use node::Peer;
pub use registry::PeerRegistry;
pub use score::{weighted_random, Eligibility};
