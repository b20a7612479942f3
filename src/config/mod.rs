//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ChannelConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Channel::apply_config swaps the circuit health policy
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only the health policy is hot-swappable
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::ConfigError;
pub use schema::ChannelConfig;
pub use schema::CircuitConfig;
pub use schema::ConnectionConfig;
pub use schema::HealthPolicy;
pub use schema::ListenerConfig;
pub use schema::ObservabilityConfig;
