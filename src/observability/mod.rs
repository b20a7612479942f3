//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → stats.rs (counters, gauges, timings keyed for statsd)
//!     → spans.rs (call spans with annotations)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → `metrics` facade recorder installed by the embedding process
//!     → Tracer reporter (external)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON optional) for machine parsing
//! - Stats are plain values handed to a sink; the sink decides where they go
//! - Tracing is optional to reduce overhead when not needed

pub mod logging;
pub mod spans;
pub mod stats;

pub use spans::{Span, Tracer};
pub use stats::{Stat, StatKind, StatSink};
