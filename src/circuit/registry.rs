//! Circuit registry and the inbound handler wrapper built on it.
//!
//! # Responsibilities
//! - Keep exactly one `Circuit` per (caller, service, endpoint)
//! - Validate inbound requests before they reach a circuit
//! - Drop circuits of services this node no longer owns
//! - Swap the shared health policy on config reload

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::call::{IncomingRequest, RequestHandler};
use crate::circuit::breaker::{circuit_key, Circuit};
use crate::clock::Clock;
use crate::config::HealthPolicy;
use crate::errors::ErrorCode;
use crate::health::{Admission, AlwaysAdmit, HealthTracker};
use crate::response::ResponseBuilder;

pub const MISSING_CALLER_MESSAGE: &str = "All requests must have the cn (caller service name) header";
pub const MISSING_SERVICE_MESSAGE: &str = "All requests must have a service name";

pub struct CircuitRegistry {
    circuits: DashMap<String, Arc<Circuit>>,
    policy: Arc<ArcSwap<HealthPolicy>>,
    clock: Arc<dyn Clock>,
    next: Arc<dyn Admission>,
}

impl fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitRegistry")
            .field("circuits", &self.circuits.len())
            .field("policy", &**self.policy.load())
            .finish()
    }
}

impl CircuitRegistry {
    pub fn new(policy: Arc<ArcSwap<HealthPolicy>>, clock: Arc<dyn Clock>) -> Self {
        Self::with_admission(policy, clock, Arc::new(AlwaysAdmit))
    }

    /// Registry whose circuits also consult `next` before admitting.
    pub fn with_admission(policy: Arc<ArcSwap<HealthPolicy>>, clock: Arc<dyn Clock>, next: Arc<dyn Admission>) -> Self {
        Self {
            circuits: DashMap::new(),
            policy,
            clock,
            next,
        }
    }

    /// The circuit for the triple, created on first use.
    pub fn get_circuit(&self, caller: &str, service: &str, endpoint: &str) -> Arc<Circuit> {
        let key = circuit_key(caller, service, endpoint);
        self.circuits
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(circuit = %key, "Creating circuit");
                let health = HealthTracker::new(key.as_str(), self.policy.clone(), self.clock.clone());
                Arc::new(Circuit::new(caller, service, endpoint, health, self.next.clone()))
            })
            .clone()
    }

    pub fn get(&self, caller: &str, service: &str, endpoint: &str) -> Option<Arc<Circuit>> {
        self.circuits
            .get(&circuit_key(caller, service, endpoint))
            .map(|circuit| circuit.clone())
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn policy(&self) -> HealthPolicy {
        **self.policy.load()
    }

    /// Route an inbound request through its circuit, or reject it outright
    /// when it cannot be attributed to one.
    pub fn handle_request(&self, req: IncomingRequest, res: ResponseBuilder, next: &dyn RequestHandler) {
        let Some(caller) = req.caller_name().map(str::to_string) else {
            reject(req.id, res, MISSING_CALLER_MESSAGE);
            return;
        };
        if req.service.is_empty() {
            reject(req.id, res, MISSING_SERVICE_MESSAGE);
            return;
        }
        let circuit = self.get_circuit(&caller, &req.service, &req.endpoint());
        circuit.handle_request(req, res, next);
    }

    /// Keep only circuits of services in `owned`.
    pub fn update_services(&self, owned: &[String]) {
        let owned: HashSet<&str> = owned.iter().map(String::as_str).collect();
        let before = self.circuits.len();
        self.circuits.retain(|_, circuit| owned.contains(circuit.service()));
        let removed = before.saturating_sub(self.circuits.len());
        if removed > 0 {
            tracing::info!(removed, remaining = self.circuits.len(), "Collected circuits of unowned services");
        }
    }

    /// Drop every circuit of `service`.
    pub fn collect_service(&self, service: &str) {
        self.circuits.retain(|_, circuit| circuit.service() != service);
        tracing::debug!(service, "Collected service circuits");
    }

    /// Replace the policy of every circuit at once.
    pub fn update_policy(&self, policy: HealthPolicy) {
        self.policy.store(Arc::new(policy));
        tracing::info!(
            period_ms = policy.period_ms,
            max_error_rate = policy.max_error_rate,
            min_requests = policy.min_requests,
            probation_ms = policy.probation_ms,
            "Circuit policy updated"
        );
    }
}

fn reject(id: u32, res: ResponseBuilder, message: &str) {
    tracing::debug!(id, reason = message, "Rejecting request");
    if let Err(err) = res.unstreamed().send_error(ErrorCode::BadRequest, message) {
        tracing::warn!(id, error = %err, "Failed to send bad request response");
    }
}

/// Request handler that puts circuits in front of another handler.
#[derive(Debug)]
pub struct CircuitHandler {
    circuits: Arc<CircuitRegistry>,
    next: Arc<dyn RequestHandler>,
}

impl CircuitHandler {
    pub fn new(circuits: Arc<CircuitRegistry>, next: Arc<dyn RequestHandler>) -> Self {
        Self { circuits, next }
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }
}

impl RequestHandler for CircuitHandler {
    fn handle_request(&self, req: IncomingRequest, res: ResponseBuilder) {
        self.circuits.handle_request(req, res, self.next.as_ref());
    }
}
