//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → broadcast → Channel::listen stops accepting
//!     → Channel::close drains every peer
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, then close connections
//! - Shutdown is a broadcast so any number of listeners can subscribe

pub mod shutdown;

pub use shutdown::Shutdown;
