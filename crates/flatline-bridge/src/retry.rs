//! Async retry executor around the adapter.
//!
//! Before every attempt it checks the run budget, then walks the job's
//! backend chain (primary first) to the first backend whose circuit is not
//! open. It sleeps the policy's jittered backoff between attempts and
//! reports exhaustion as a fatal `exhausted` error so the caller treats the
//! slot as failed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use flatline_coordination::retry::{BackendCircuit, CircuitState, RetryDecision, RetryPolicy};
use flatline_coordination::review::ReviewOutcome;
use flatline_coordination::{
    InvocationError, InvocationErrorKind, ReviewRequest, ReviewResult, RunBudget, TokenUsage,
};
use tracing::{debug, info, warn};

use crate::adapter;
use crate::backend::ReasoningBackend;
use crate::fanout::ReviewJob;

pub struct RetryExecutor {
    policy: RetryPolicy,
    circuit: Mutex<BackendCircuit>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, circuit: BackendCircuit) -> Self {
        Self {
            policy,
            circuit: Mutex::new(circuit),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn circuit_state(&self, backend: &str) -> CircuitState {
        match self.circuit.lock() {
            Ok(c) => c.state(backend),
            Err(poisoned) => poisoned.into_inner().state(backend),
        }
    }

    fn with_circuit<R>(&self, f: impl FnOnce(&mut BackendCircuit) -> R) -> R {
        match self.circuit.lock() {
            Ok(mut c) => f(&mut c),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// First backend in the job's chain whose circuit admits a call.
    fn pick<'a>(&self, job: &'a ReviewJob) -> Option<&'a Arc<dyn ReasoningBackend>> {
        std::iter::once(&job.backend)
            .chain(job.fallbacks.iter())
            .find(|b| self.with_circuit(|c| c.is_available(b.name())))
    }

    /// Invoke with retries. The returned result's `attempts`, `latency_ms`,
    /// `usage` and `cost_micros` cover every attempt, including backoff
    /// sleeps; `backend` names the backend that served the last attempt.
    pub async fn invoke(&self, job: &ReviewJob, timeout: Duration, budget: &RunBudget) -> ReviewResult {
        let request = &job.request;
        let slot = job.slot;
        let primary = job.backend.name().to_string();
        let mut slept = Duration::ZERO;
        let mut total_latency = 0u64;
        let mut usage = TokenUsage::default();
        let mut cost_micros = 0u64;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let (mut result, served_by) = match budget.admit() {
                Err(error) => (refused(&primary, request, slot, error), None),
                Ok(()) => match self.pick(job) {
                    Some(backend) => {
                        if backend.name() != primary {
                            info!(
                                primary = %primary,
                                fallback = backend.name(),
                                role = %request.role(),
                                slot,
                                "Primary circuit open; falling back"
                            );
                        }
                        let result = adapter::invoke(backend.as_ref(), request, slot, timeout).await;
                        (result, Some(backend.name().to_string()))
                    }
                    None => (short_circuit(&primary, request, slot), None),
                },
            };
            total_latency += result.latency_ms;
            usage += result.usage;
            cost_micros += result.cost_micros;
            budget.charge(result.cost_micros);

            let err = match &result.outcome {
                ReviewOutcome::Completed { .. } => {
                    if let Some(name) = &served_by {
                        self.with_circuit(|c| c.record_success(name));
                    }
                    result.attempts = attempt;
                    result.latency_ms = total_latency + slept.as_millis() as u64;
                    result.usage = usage;
                    result.cost_micros = cost_micros;
                    return result;
                }
                ReviewOutcome::Failed { error } => error.clone(),
            };
            if let Some(name) = served_by.as_deref().filter(|_| err.is_transient()) {
                let state = self.with_circuit(|c| c.record_failure(name));
                if state == CircuitState::Open {
                    warn!(backend = %name, "Backend circuit open");
                }
            }

            match self.policy.decide(attempt, &err, slept, jitter()) {
                RetryDecision::Retry { delay } => {
                    debug!(
                        backend = %result.backend,
                        role = %request.role(),
                        slot,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying invocation"
                    );
                    tokio::time::sleep(delay).await;
                    slept += delay;
                }
                RetryDecision::GiveUp { reason } => {
                    let error = if err.is_transient() {
                        InvocationError::exhausted(&err, attempt, &reason)
                    } else {
                        err
                    };
                    warn!(
                        backend = %result.backend,
                        role = %request.role(),
                        slot,
                        attempts = attempt,
                        error = %error,
                        "Invocation failed"
                    );
                    result.outcome = ReviewOutcome::Failed { error };
                    result.attempts = attempt;
                    result.latency_ms = total_latency + slept.as_millis() as u64;
                    result.usage = usage;
                    result.cost_micros = cost_micros;
                    return result;
                }
            }
        }
    }
}

/// Result for a call that never reached a backend.
fn refused(backend: &str, request: &ReviewRequest, slot: usize, error: InvocationError) -> ReviewResult {
    ReviewResult {
        role: request.role(),
        slot,
        backend: backend.to_string(),
        outcome: ReviewOutcome::Failed { error },
        latency_ms: 0,
        attempts: 1,
        usage: TokenUsage::default(),
        cost_micros: 0,
    }
}

/// Result for a call refused by an open circuit on every backend in the chain.
fn short_circuit(backend: &str, request: &ReviewRequest, slot: usize) -> ReviewResult {
    refused(
        backend,
        request,
        slot,
        InvocationError::new(
            InvocationErrorKind::Overloaded,
            format!("circuit open for backend {backend}"),
        ),
    )
}

/// Uniform sample in `[0, 1)` drawn from a v4 UUID's random bits.
fn jitter() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128() as u64;
    (bits >> 11) as f64 / (1u64 << 53) as f64
}
