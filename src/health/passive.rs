//! Passive health tracking (failure detection).
//!
//! # Responsibilities
//! - Observe request outcomes
//! - Feed them into the health state machine under one lock
//! - Log state transitions
//!
//! # Design Decisions
//! - The policy is read through an `ArcSwap` so config reloads apply to
//!   every tracker without rebuilding it
//! - Admission and the `on_request` bookkeeping happen atomically so two
//!   concurrent callers can never both become the trial request
//! - Each issued request gets a fresh [`Ticket`]; its outcome must be
//!   reported with that ticket

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

use crate::clock::Clock;
use crate::config::HealthPolicy;
use crate::health::state::{Admission, HealthKind, HealthState, Ticket, Transition};

/// Health of one named subject (a circuit), with its policy and clock.
#[derive(Debug)]
pub struct HealthTracker {
    name: String,
    policy: Arc<ArcSwap<HealthPolicy>>,
    clock: Arc<dyn Clock>,
    state: Mutex<HealthState>,
    next_ticket: AtomicU64,
}

impl HealthTracker {
    pub fn new(name: impl Into<String>, policy: Arc<ArcSwap<HealthPolicy>>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            name: name.into(),
            policy,
            clock,
            state: Mutex::new(HealthState::healthy(now)),
            next_ticket: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn kind(&self) -> HealthKind {
        self.lock().kind()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> HealthState {
        self.lock().clone()
    }

    /// Whether a request would be admitted right now.
    pub fn should_request(&self, next: &dyn Admission) -> bool {
        let policy = self.policy.load();
        self.lock().should_request(self.clock.now_ms(), &policy, next)
    }

    fn issue(&self) -> Ticket {
        Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed))
    }

    /// Admit and record the request in one step. `None` means declined.
    pub fn admit(&self, next: &dyn Admission) -> Option<Ticket> {
        let policy = self.policy.load();
        let now = self.clock.now_ms();
        let mut state = self.lock();
        if !state.should_request(now, &policy, next) {
            return None;
        }
        let ticket = self.issue();
        state.on_request(now, &policy, ticket);
        Some(ticket)
    }

    /// Record a request issued without asking for admission.
    pub fn on_request(&self) -> Ticket {
        let policy = self.policy.load();
        let ticket = self.issue();
        self.lock().on_request(self.clock.now_ms(), &policy, ticket);
        ticket
    }

    pub fn on_request_error(&self, ticket: Ticket) {
        let policy = self.policy.load();
        let transition = self.lock().on_request_error(self.clock.now_ms(), &policy, ticket);
        self.log_transition(transition);
    }

    pub fn on_request_response(&self, ticket: Ticket) {
        let policy = self.policy.load();
        let transition = self.lock().on_request_response(self.clock.now_ms(), &policy, ticket);
        self.log_transition(transition);
    }

    fn log_transition(&self, transition: Option<Transition>) {
        match transition {
            Some(Transition::Tripped { errors, total }) => {
                tracing::warn!(circuit = %self.name, errors, total, "Circuit became unhealthy");
            }
            Some(Transition::ProbationRestarted) => {
                tracing::info!(circuit = %self.name, "Trial request failed, probation restarted");
            }
            Some(Transition::Recovered) => {
                tracing::info!(circuit = %self.name, "Circuit recovered");
            }
            None => {}
        }
    }
}
