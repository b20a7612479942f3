//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (rates in [0, 1], durations > 0)
//! - Check the advertised host:port is usable as a peer identity
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ChannelConfig → Result<(), Vec<ValidationError>>

use crate::config::schema::ChannelConfig;

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Split a `host:port` string, rejecting anything without a numeric port.
pub fn split_host_port(host_port: &str) -> Option<(&str, u16)> {
    let (host, port) = host_port.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}

/// Validate a configuration, collecting every error found.
pub fn validate_config(config: &ChannelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if split_host_port(&config.host_port).is_none() {
        errors.push(ValidationError::new(
            "host_port",
            format!("'{}' is not a host:port pair", config.host_port),
        ));
    }

    let health = &config.health;
    if !(0.0..=1.0).contains(&health.max_error_rate) {
        errors.push(ValidationError::new(
            "health.max_error_rate",
            format!("{} is outside [0, 1]", health.max_error_rate),
        ));
    }
    if health.period_ms == 0 {
        errors.push(ValidationError::new("health.period_ms", "must be greater than zero"));
    }
    if health.probation_ms == 0 {
        errors.push(ValidationError::new("health.probation_ms", "must be greater than zero"));
    }

    if config.connection.timeout_check_interval_ms == 0 {
        errors.push(ValidationError::new(
            "connection.timeout_check_interval_ms",
            "must be greater than zero",
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new(
            "listener.max_connections",
            "must be greater than zero",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ChannelConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ChannelConfig::default();
        config.host_port = "nonsense".into();
        config.health.max_error_rate = 1.5;
        config.health.period_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["host_port", "health.max_error_rate", "health.period_ms"]
        );
    }

    #[test]
    fn splits_host_port() {
        assert_eq!(split_host_port("10.0.0.1:4040"), Some(("10.0.0.1", 4040)));
        assert_eq!(split_host_port("0.0.0.0:0"), Some(("0.0.0.0", 0)));
        assert_eq!(split_host_port("host"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("host:http"), None);
    }
}
