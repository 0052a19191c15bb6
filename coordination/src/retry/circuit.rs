//! Per-backend circuit.
//!
//! Tracks consecutive failures per backend name. Once failures reach the
//! threshold the circuit *opens* and calls to that backend short-circuit
//! without touching the network. After a cooldown the circuit is
//! *half-open*: the next call goes through as a trial call, and its outcome
//! either closes the circuit or re-opens it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Circuit state for a single backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendCircuit {
    consecutive_failures: HashMap<String, u32>,
    last_failure: HashMap<String, Instant>,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time after the last failure before Open → HalfOpen.
    pub cooldown: Duration,
}

impl BackendCircuit {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            consecutive_failures: HashMap::new(),
            last_failure: HashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn record_success(&mut self, backend: &str) {
        self.consecutive_failures.remove(backend);
        self.last_failure.remove(backend);
    }

    /// Returns the state after recording.
    pub fn record_failure(&mut self, backend: &str) -> CircuitState {
        *self
            .consecutive_failures
            .entry(backend.to_string())
            .or_insert(0) += 1;
        self.last_failure.insert(backend.to_string(), Instant::now());
        self.state(backend)
    }

    pub fn state(&self, backend: &str) -> CircuitState {
        if self.failure_count(backend) < self.failure_threshold {
            return CircuitState::Closed;
        }
        match self.last_failure.get(backend) {
            Some(at) if at.elapsed() < self.cooldown => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    /// Whether a call may go through (Closed or HalfOpen).
    pub fn is_available(&self, backend: &str) -> bool {
        !matches!(self.state(backend), CircuitState::Open)
    }

    pub fn failure_count(&self, backend: &str) -> u32 {
        self.consecutive_failures.get(backend).copied().unwrap_or(0)
    }
}

impl Default for BackendCircuit {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
