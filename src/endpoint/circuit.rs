//! Circuit breaker state machine for a single endpoint.
//!
//! States:
//! - `Closed`: normal operation, the endpoint is eligible for traffic
//! - `Open`: the endpoint is excluded from selection
//! - `HalfOpen`: eligible for at most one trial call at a time
//!
//! Transitions:
//! - `Closed → Open` when consecutive failures reach the threshold
//! - `Open → HalfOpen` after the open duration elapses (driven by the
//!   periodic health monitor)
//! - `HalfOpen → Closed` when the trial call succeeds
//! - `HalfOpen → Open` when the trial call fails
//!
//! An `Open` circuit never transitions directly to `Closed`.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Circuit state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Excluded from selection until the open duration elapses.
    Open,
    /// One trial call allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change produced by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    /// The circuit tripped open.
    Opened,
    /// A trial call succeeded and the circuit closed.
    Closed,
    /// The open duration elapsed and a trial window opened.
    HalfOpened,
}

/// Per-endpoint circuit breaker.
///
/// Not internally synchronized; the owning registry serializes access
/// through the endpoint's health mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Consecutive failures that trip the circuit.
    threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    open_duration: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold,
            open_duration,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Current consecutive-failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Records a successful call.
    ///
    /// Resets the consecutive-failure counter. A success during the
    /// half-open trial closes the circuit.
    pub fn record_success(&mut self) -> Option<CircuitTransition> {
        self.consecutive_failures = 0;

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                Some(CircuitTransition::Closed)
            }
            _ => None,
        }
    }

    /// Records a failed call.
    ///
    /// Reaching the threshold while closed trips the circuit open; any
    /// failure during the half-open trial snaps it straight back open.
    pub fn record_failure(&mut self) -> Option<CircuitTransition> {
        self.consecutive_failures += 1;

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                Some(CircuitTransition::Opened)
            }
            CircuitState::Closed if self.consecutive_failures >= self.threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                Some(CircuitTransition::Opened)
            }
            _ => None,
        }
    }

    /// Promotes an open circuit to half-open once the open duration has
    /// elapsed. Called by the periodic health monitor.
    pub fn try_promote(&mut self) -> Option<CircuitTransition> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) if opened.elapsed() >= self.open_duration => {
                self.state = CircuitState::HalfOpen;
                Some(CircuitTransition::HalfOpened)
            }
            _ => None,
        }
    }

    /// How long the circuit has been open, if it is.
    pub fn open_for(&self) -> Option<Duration> {
        match self.state {
            CircuitState::Open => self.opened_at.map(|t| t.elapsed()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn force_opened_at(&mut self, at: Instant) {
        self.opened_at = Some(at);
    }
}
