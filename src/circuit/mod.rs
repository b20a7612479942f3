//! Circuit breaking of inbound requests.
//!
//! # Data Flow
//! ```text
//! Connection dispatches call-request
//!     → CircuitHandler
//!     → registry.rs (cn header + service check, circuit lookup)
//!     → breaker.rs (admit or decline)
//!     → next handler, response observed by the circuit
//!
//! Membership change:
//!     → registry.rs (update_services: drop unowned circuits)
//! ```
//!
//! # Design Decisions
//! - Circuits are keyed by caller, service and endpoint; one instance per key
//! - Health is tracked by `health::HealthTracker`, shared policy via `ArcSwap`
//! - Circuits double as outbound request observers

pub mod breaker;
pub mod registry;

pub use breaker::{circuit_key, Circuit, DECLINED_MESSAGE};
pub use registry::{CircuitHandler, CircuitRegistry};
