//! Circuit health state machine.
//!
//! # States
//! - Healthy: requests admitted, outcomes sampled over a rolling window
//! - Unhealthy: requests declined until probation elapses, then one trial
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: samples >= min_requests && error rate > max_error_rate
//! Unhealthy → Healthy: trial request succeeds
//! Unhealthy → Unhealthy: trial request fails (probation restarts)
//! ```
//!
//! # Design Decisions
//! - Time is passed in, never read, so the machine is deterministic
//! - The window resets lazily when an outcome lands a full period after it opened
//! - Every issued request carries a [`Ticket`]; while Unhealthy only the
//!   trial's own ticket can end probation, so late outcomes of requests
//!   admitted before the trip are ignored

use std::fmt;

use crate::config::HealthPolicy;

/// Gate consulted after the health state has admitted a request.
///
/// Circuits only care about health, so they use [`AlwaysAdmit`].
pub trait Admission: Send + Sync + fmt::Debug {
    fn should_request(&self) -> bool;
}

/// Admission gate that never objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAdmit;

impl Admission for AlwaysAdmit {
    fn should_request(&self) -> bool {
        true
    }
}

/// Which variant a [`HealthState`] currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthKind {
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthKind::Healthy => f.write_str("healthy"),
            HealthKind::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Identity of one issued request, handed back with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(pub u64);

/// A state change produced by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The window's error rate crossed the threshold.
    Tripped { errors: u64, total: u64 },
    /// The trial request failed; probation starts over.
    ProbationRestarted,
    /// The trial request succeeded.
    Recovered,
}

/// Health of one circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy {
        window_start_ms: u64,
        successes: u64,
        errors: u64,
    },
    Unhealthy {
        since_ms: u64,
        trial: Option<Ticket>,
    },
}

impl HealthState {
    /// A fresh Healthy state whose window opens at `now_ms`.
    pub fn healthy(now_ms: u64) -> Self {
        HealthState::Healthy {
            window_start_ms: now_ms,
            successes: 0,
            errors: 0,
        }
    }

    /// An Unhealthy state whose probation starts at `now_ms`.
    pub fn unhealthy(now_ms: u64) -> Self {
        HealthState::Unhealthy {
            since_ms: now_ms,
            trial: None,
        }
    }

    pub fn kind(&self) -> HealthKind {
        match self {
            HealthState::Healthy { .. } => HealthKind::Healthy,
            HealthState::Unhealthy { .. } => HealthKind::Unhealthy,
        }
    }

    /// Outcomes recorded in the current window (zero while Unhealthy).
    pub fn sample_size(&self) -> u64 {
        match self {
            HealthState::Healthy {
                successes, errors, ..
            } => successes + errors,
            HealthState::Unhealthy { .. } => 0,
        }
    }

    /// Errors recorded in the current window (zero while Unhealthy).
    pub fn error_count(&self) -> u64 {
        match self {
            HealthState::Healthy { errors, .. } => *errors,
            HealthState::Unhealthy { .. } => 0,
        }
    }

    /// Decide whether a request may go through. Does not mutate; call
    /// [`HealthState::on_request`] once the request is actually issued.
    pub fn should_request(&self, now_ms: u64, policy: &HealthPolicy, next: &dyn Admission) -> bool {
        match self {
            HealthState::Healthy { .. } => next.should_request(),
            HealthState::Unhealthy { since_ms, trial } => {
                trial.is_none()
                    && now_ms.saturating_sub(*since_ms) >= policy.probation_ms
                    && next.should_request()
            }
        }
    }

    /// Record that an admitted request was issued. Once probation has
    /// elapsed the first request issued becomes the trial.
    pub fn on_request(&mut self, now_ms: u64, policy: &HealthPolicy, ticket: Ticket) {
        if let HealthState::Unhealthy { since_ms, trial } = self {
            if trial.is_none() && now_ms.saturating_sub(*since_ms) >= policy.probation_ms {
                *trial = Some(ticket);
            }
        }
    }

    /// Whether `ticket` is the outstanding trial request.
    fn is_trial(&self, ticket: Ticket) -> bool {
        matches!(self, HealthState::Unhealthy { trial: Some(t), .. } if *t == ticket)
    }

    /// Record a failed outcome.
    pub fn on_request_error(&mut self, now_ms: u64, policy: &HealthPolicy, ticket: Ticket) -> Option<Transition> {
        match self {
            HealthState::Healthy { .. } => {
                self.roll_window(now_ms, policy);
                if let HealthState::Healthy { errors, .. } = self {
                    *errors += 1;
                }
                self.evaluate(now_ms, policy)
            }
            HealthState::Unhealthy { .. } => {
                if !self.is_trial(ticket) {
                    return None;
                }
                *self = HealthState::unhealthy(now_ms);
                Some(Transition::ProbationRestarted)
            }
        }
    }

    /// Record a successful outcome.
    pub fn on_request_response(&mut self, now_ms: u64, policy: &HealthPolicy, ticket: Ticket) -> Option<Transition> {
        match self {
            HealthState::Healthy { .. } => {
                self.roll_window(now_ms, policy);
                if let HealthState::Healthy { successes, .. } = self {
                    *successes += 1;
                }
                self.evaluate(now_ms, policy)
            }
            HealthState::Unhealthy { .. } => {
                if !self.is_trial(ticket) {
                    return None;
                }
                *self = HealthState::healthy(now_ms);
                Some(Transition::Recovered)
            }
        }
    }

    fn roll_window(&mut self, now_ms: u64, policy: &HealthPolicy) {
        if let HealthState::Healthy {
            window_start_ms, ..
        } = self
        {
            if now_ms.saturating_sub(*window_start_ms) >= policy.period_ms {
                *self = HealthState::healthy(now_ms);
            }
        }
    }

    fn evaluate(&mut self, now_ms: u64, policy: &HealthPolicy) -> Option<Transition> {
        let HealthState::Healthy {
            successes, errors, ..
        } = *self
        else {
            return None;
        };
        let total = successes + errors;
        if total == 0 || total < policy.min_requests {
            return None;
        }
        let rate = errors as f64 / total as f64;
        if rate > policy.max_error_rate {
            *self = HealthState::unhealthy(now_ms);
            return Some(Transition::Tripped { errors, total });
        }
        None
    }
}
