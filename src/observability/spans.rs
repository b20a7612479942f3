//! Distributed tracing spans.
//!
//! # Responsibilities
//! - Carry trace/span ids across a call
//! - Collect timestamped annotations (`cs`, `sr`, `ss`, `cr`)
//! - Hand finished spans to an external reporter
//!
//! # Design Decisions
//! - Optional: no tracer configured means no span bookkeeping
//! - The reporter is a trait; shipping spans anywhere is not our job

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::clock::RandomSource;

/// One timestamped annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub value: &'static str,
    pub timestamp_ms: u64,
}

/// A span for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub name: String,
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: Option<u64>,
    pub annotations: Vec<Annotation>,
}

impl Span {
    /// Start a new root span with random ids.
    pub fn root(name: impl Into<String>, random: &dyn RandomSource) -> Self {
        let trace_id = random_id(random);
        Self {
            name: name.into(),
            trace_id,
            span_id: trace_id,
            parent_id: None,
            annotations: Vec::new(),
        }
    }

    /// Start a child span in the same trace.
    pub fn child(&self, name: impl Into<String>, random: &dyn RandomSource) -> Self {
        Self {
            name: name.into(),
            trace_id: self.trace_id,
            span_id: random_id(random),
            parent_id: Some(self.span_id),
            annotations: Vec::new(),
        }
    }

    pub fn annotate(&mut self, value: &'static str, timestamp_ms: u64) {
        self.annotations.push(Annotation {
            value,
            timestamp_ms,
        });
    }

    pub fn has_annotation(&self, value: &str) -> bool {
        self.annotations.iter().any(|a| a.value == value)
    }
}

fn random_id(random: &dyn RandomSource) -> u64 {
    (random.next_f64() * u64::MAX as f64) as u64
}

/// Receives completed spans.
pub trait Tracer: Send + Sync + fmt::Debug {
    fn report(&self, span: Span);
}

/// Keeps reported spans in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<Span>>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Tracer for RecordingTracer {
    fn report(&self, span: Span) {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).push(span);
    }
}
