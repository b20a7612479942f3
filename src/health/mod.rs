//! Health tracking subsystem.
//!
//! # Data Flow
//! ```text
//! Request outcome observed (passive.rs):
//!     Circuit monitor sees error / finish
//!     → HealthTracker records it
//!     → state.rs decides on a transition
//!
//! State machine (state.rs):
//!     Healthy → Unhealthy → (probation) → trial → Healthy | Unhealthy
//! ```
//!
//! # Design Decisions
//! - Health is per circuit, not per peer; peers are ranked by connectivity
//! - Clock is injected; no timers are armed
//! - Policy is shared by every circuit of a registry

pub mod passive;
pub mod state;

pub use crate::config::HealthPolicy;
pub use passive::HealthTracker;
pub use state::{Admission, AlwaysAdmit, HealthKind, HealthState, Ticket, Transition};
