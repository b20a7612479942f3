//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a channel.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for a channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Address this process identifies as (e.g., "10.0.0.1:4040").
    pub host_port: String,

    /// Process name sent during the identification handshake.
    pub process_name: String,

    /// Circuit health policy shared by every circuit.
    pub health: HealthPolicy,

    /// Per-connection settings.
    pub connection: ConnectionConfig,

    /// Inbound listener settings.
    pub listener: ListenerConfig,

    /// Circuit breaking of inbound requests.
    pub circuits: CircuitConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host_port: "127.0.0.1:4040".to_string(),
            process_name: "peer-transport".to_string(),
            health: HealthPolicy::default(),
            connection: ConnectionConfig::default(),
            listener: ListenerConfig::default(),
            circuits: CircuitConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Health policy for one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Length of the outcome sampling window in milliseconds.
    pub period_ms: u64,

    /// Error ratio above which a circuit turns unhealthy.
    pub max_error_rate: f64,

    /// Minimum sample size before the error ratio is considered.
    pub min_requests: u64,

    /// Cooldown in milliseconds before a trial request is admitted.
    pub probation_ms: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            max_error_rate: 0.5,
            min_requests: 10,
            probation_ms: 5000,
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Outbound connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Default time-to-live of an outbound request in milliseconds.
    pub request_ttl_ms: u64,

    /// How often pending operations are checked for expiry, in milliseconds.
    pub timeout_check_interval_ms: u64,

    /// Initial read buffer capacity for TCP transports.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            request_ttl_ms: 30_000,
            timeout_check_interval_ms: 1000,
            read_buffer_size: 8 * 1024,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:4040").
    pub bind_address: String,

    /// Maximum concurrent inbound connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4040".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Circuit breaking configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Wrap the inbound handler with per-(caller, service, endpoint) circuits.
    pub enabled: bool,

    /// Services this node currently owns; circuits for others are collected.
    /// Unset leaves every circuit in place.
    pub owned_services: Option<Vec<String>>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            owned_services: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON instead of the human format.
    pub json_logs: bool,

    /// Forward stats to the `metrics` facade.
    pub stats_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            stats_enabled: true,
        }
    }
}
