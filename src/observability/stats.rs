//! Stat events and the statsd key adapter.
//!
//! # Responsibilities
//! - Define the stat event shape produced by connections and responses
//! - Map each stat name to its fixed dot-delimited statsd key
//! - Forward stats to the `metrics` facade
//!
//! # Keys
//! - outbound: `tchannel.<name>.<service>.<target-service>.<target-endpoint>[.<type>|.<retry-count>|.<peer>.<retry-count>]`
//! - inbound: `tchannel.<name>.<calling-service>.<service>.<endpoint>[.<type>]`
//! - anything else: `tchannel.bad-stat-object`
//!
//! # Design Decisions
//! - Tag values are sanitized so they cannot introduce new key segments
//! - Missing tags become `no-<field>` rather than empty segments

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Kind of measurement a stat carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Counter,
    Gauge,
    Timing,
}

/// One stat event.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub name: String,
    pub kind: StatKind,
    pub tags: BTreeMap<String, String>,
    pub value: f64,
}

impl Stat {
    pub fn new(name: impl Into<String>, kind: StatKind, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            tags: BTreeMap::new(),
            value,
        }
    }

    pub fn counter(name: impl Into<String>, value: u64) -> Self {
        Self::new(name, StatKind::Counter, value as f64)
    }

    pub fn timing(name: impl Into<String>, millis: u64) -> Self {
        Self::new(name, StatKind::Timing, millis as f64)
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Consumer of stat events.
pub trait StatSink: Send + Sync + fmt::Debug {
    fn emit(&self, stat: Stat);
}

/// Drops every stat.
#[derive(Debug, Default)]
pub struct NullStatSink;

impl StatSink for NullStatSink {
    fn emit(&self, _stat: Stat) {}
}

/// Keeps every stat in memory; handy for inspection in tests and tools.
#[derive(Debug, Default, Clone)]
pub struct RecordingStatSink {
    stats: Arc<Mutex<Vec<Stat>>>,
}

impl RecordingStatSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Vec<Stat> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Names of recorded stats, in emission order.
    pub fn names(&self) -> Vec<String> {
        self.stats().into_iter().map(|s| s.name).collect()
    }
}

impl StatSink for RecordingStatSink {
    fn emit(&self, stat: Stat) {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).push(stat);
    }
}

/// Records stats through the `metrics` facade under their statsd keys.
#[derive(Debug, Default)]
pub struct MetricsStatSink;

impl StatSink for MetricsStatSink {
    fn emit(&self, stat: Stat) {
        let key = stat_key(&stat);
        if key == BAD_STAT_KEY {
            tracing::error!(stat_name = %stat.name, stat_kind = ?stat.kind, "Trying to emit an invalid stat object");
        }
        match stat.kind {
            StatKind::Counter => metrics::counter!(key).increment(stat.value as u64),
            StatKind::Gauge => metrics::gauge!(key).set(stat.value),
            StatKind::Timing => metrics::histogram!(key).record(stat.value),
        }
    }
}

pub const BAD_STAT_KEY: &str = "tchannel.bad-stat-object";

/// Sanitize one tag value for use as a key segment.
pub fn clean(value: Option<&str>, field: &str) -> String {
    match value {
        None | Some("") => format!("no-{}", field),
        Some(value) => value
            .chars()
            .map(|c| match c {
                ':' | '/' | '.' | '{' | '}' => '-',
                other => other,
            })
            .collect(),
    }
}

/// Statsd key for a stat event.
pub fn stat_key(stat: &Stat) -> String {
    let prefix = format!("tchannel.{}", stat.name);
    let outbound = || {
        format!(
            "{}.{}.{}.{}",
            prefix,
            clean(stat.tag("service"), "service"),
            clean(stat.tag("target-service"), "target-service"),
            clean(stat.tag("target-endpoint"), "endpoint"),
        )
    };
    let inbound = || {
        format!(
            "{}.{}.{}.{}",
            prefix,
            clean(stat.tag("calling-service"), "calling-service"),
            clean(stat.tag("service"), "service"),
            clean(stat.tag("endpoint"), "endpoint"),
        )
    };
    let retry_count = || stat.tag("retry-count").unwrap_or("0").to_string();

    match stat.name.as_str() {
        "outbound.calls.sent" | "outbound.calls.success" | "outbound.calls.latency" => outbound(),
        "outbound.calls.system-errors"
        | "outbound.calls.operational-errors"
        | "outbound.calls.app-errors" => {
            format!("{}.{}", outbound(), clean(stat.tag("type"), "type"))
        }
        "outbound.calls.retries" => format!("{}.{}", outbound(), retry_count()),
        "outbound.calls.per-attempt-latency" => format!(
            "{}.{}.{}",
            outbound(),
            clean(stat.tag("peer"), "peer"),
            retry_count()
        ),
        "inbound.calls.recvd" | "inbound.calls.success" | "inbound.calls.latency" => inbound(),
        "inbound.calls.system-errors" | "inbound.calls.app-errors" => {
            format!("{}.{}", inbound(), clean(stat.tag("type"), "type"))
        }
        _ => BAD_STAT_KEY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleans_separators() {
        assert_eq!(clean(Some("a:b/c.d{e}"), "x"), "a-b-c-d-e-");
        assert_eq!(clean(Some(""), "service"), "no-service");
        assert_eq!(clean(None, "endpoint"), "no-endpoint");
    }

    #[test]
    fn outbound_sent_key() {
        let stat = Stat::counter("outbound.calls.sent", 1)
            .with_tag("service", "alice")
            .with_tag("target-service", "bob")
            .with_tag("target-endpoint", "Echo::echo");
        assert_eq!(
            stat_key(&stat),
            "tchannel.outbound.calls.sent.alice.bob.Echo--echo"
        );
    }

    #[test]
    fn outbound_error_key_carries_type() {
        let stat = Stat::counter("outbound.calls.system-errors", 1)
            .with_tag("service", "alice")
            .with_tag("target-service", "bob")
            .with_tag("target-endpoint", "echo")
            .with_tag("type", "timeout");
        assert_eq!(
            stat_key(&stat),
            "tchannel.outbound.calls.system-errors.alice.bob.echo.timeout"
        );
    }

    #[test]
    fn per_attempt_latency_key() {
        let stat = Stat::timing("outbound.calls.per-attempt-latency", 12)
            .with_tag("service", "alice")
            .with_tag("target-service", "bob")
            .with_tag("target-endpoint", "echo")
            .with_tag("peer", "10.0.0.1:4040")
            .with_tag("retry-count", "2");
        assert_eq!(
            stat_key(&stat),
            "tchannel.outbound.calls.per-attempt-latency.alice.bob.echo.10-0-0-1-4040.2"
        );
    }

    #[test]
    fn inbound_key_with_missing_tags() {
        let stat = Stat::counter("inbound.calls.recvd", 1).with_tag("service", "bob");
        assert_eq!(
            stat_key(&stat),
            "tchannel.inbound.calls.recvd.no-calling-service.bob.no-endpoint"
        );
    }

    #[test]
    fn unknown_name_routes_to_fallback() {
        let stat = Stat::counter("something.else", 1);
        assert_eq!(stat_key(&stat), BAD_STAT_KEY);
    }

    #[test]
    fn metrics_sink_accepts_every_kind() {
        // no recorder installed: the facade turns these into no-ops
        let sink = MetricsStatSink;
        sink.emit(Stat::counter("outbound.calls.sent", 1));
        sink.emit(Stat::new("inbound.calls.recvd", StatKind::Gauge, 3.0));
        sink.emit(Stat::timing("bogus", 5));
    }
}
