//! One circuit: the health of a (caller, service, endpoint) triple.
//!
//! # States
//! - Healthy: requests pass through, outcomes are sampled per period
//! - Unhealthy: requests are declined until probation elapses, then a
//!   single trial request decides the way back
//!
//! # Design Decisions
//! - Admission happens in `HealthTracker::admit`, so the trial request is
//!   handed out exactly once
//! - Each admitted request settles its circuit at most once, whether it ends
//!   through a finished response, a framing error or a dropped response
//! - Outcomes travel with the request's [`Ticket`], so a trial can only be
//!   decided by the trial itself

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::call::{IncomingRequest, IncomingResponse, RequestHandler, RequestObserver};
use crate::errors::{ChannelError, ErrorCode};
use crate::health::{Admission, HealthKind, HealthState, HealthTracker, Ticket};
use crate::response::{Finish, Outcome, ResponseBuilder, ResponseObserver};

/// Message sent back when a circuit declines a request.
pub const DECLINED_MESSAGE: &str = "Service is not healthy";

pub struct Circuit {
    name: String,
    caller: String,
    service: String,
    endpoint: String,
    health: HealthTracker,
    next: Arc<dyn Admission>,
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("name", &self.name)
            .field("state", &self.health.kind())
            .finish()
    }
}

impl Circuit {
    pub fn new(caller: &str, service: &str, endpoint: &str, health: HealthTracker, next: Arc<dyn Admission>) -> Self {
        Self {
            name: circuit_key(caller, service, endpoint),
            caller: caller.to_string(),
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            health,
            next,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn kind(&self) -> HealthKind {
        self.health.kind()
    }

    pub fn snapshot(&self) -> HealthState {
        self.health.snapshot()
    }

    /// Whether a request would be let through right now. Does not record
    /// anything.
    pub fn should_request(&self) -> bool {
        self.health.should_request(self.next.as_ref())
    }

    /// Decline the request or forward it to `next` with its outcome wired
    /// back into this circuit.
    pub fn handle_request(self: &Arc<Self>, req: IncomingRequest, res: ResponseBuilder, next: &dyn RequestHandler) {
        let Some(ticket) = self.health.admit(self.next.as_ref()) else {
            tracing::debug!(circuit = %self.name, id = req.id, "Declining request");
            if let Err(err) = res.unstreamed().send_error(ErrorCode::Declined, DECLINED_MESSAGE) {
                tracing::warn!(circuit = %self.name, error = %err, "Failed to send declined response");
            }
            return;
        };

        let monitor = Arc::new(RequestMonitor {
            circuit: self.clone(),
            ticket,
            settled: AtomicBool::new(false),
        });
        next.handle_request(req, res.observe(monitor));
    }

    /// Observer for one outbound call. Outbound calls are never declined,
    /// only recorded.
    pub fn monitor_call(self: &Arc<Self>) -> Arc<dyn RequestObserver> {
        Arc::new(CallMonitor {
            circuit: self.clone(),
            ticket: OnceLock::new(),
        })
    }

    fn record(&self, ticket: Ticket, failed: bool) {
        if failed {
            self.health.on_request_error(ticket);
        } else {
            self.health.on_request_response(ticket);
        }
    }
}

/// Feeds the outcome of one outbound call into its circuit.
#[derive(Debug)]
struct CallMonitor {
    circuit: Arc<Circuit>,
    ticket: OnceLock<Ticket>,
}

impl CallMonitor {
    fn ticket(&self) -> Ticket {
        *self.ticket.get_or_init(|| self.circuit.health.on_request())
    }
}

impl RequestObserver for CallMonitor {
    fn on_request(&self) {
        self.ticket();
    }

    fn on_request_error(&self, err: &ChannelError) {
        self.circuit.record(self.ticket(), err.code().is_unhealthy());
    }

    fn on_request_response(&self, _res: &IncomingResponse) {
        self.circuit.record(self.ticket(), false);
    }
}

/// Feeds the outcome of one admitted inbound request into its circuit.
struct RequestMonitor {
    circuit: Arc<Circuit>,
    ticket: Ticket,
    settled: AtomicBool,
}

impl RequestMonitor {
    fn settle(&self, failed: bool) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.circuit.record(self.ticket, failed);
    }
}

/// A response dropped before it finished counts as a failure.
impl Drop for RequestMonitor {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            tracing::warn!(circuit = %self.circuit.name, "Response dropped without finishing");
            self.settle(true);
        }
    }
}

impl ResponseObserver for RequestMonitor {
    fn on_response_error(&self, _err: &ChannelError) {
        self.settle(true);
    }

    fn on_response_finish(&self, finish: &Finish) {
        let failed = match &finish.outcome {
            Outcome::Error { code, .. } => code.is_unhealthy(),
            Outcome::Ok | Outcome::NotOk => false,
        };
        self.settle(failed);
    }
}

/// `caller::service::endpoint`
pub fn circuit_key(caller: &str, service: &str, endpoint: &str) -> String {
    format!("{}::{}::{}", caller, service, endpoint)
}
