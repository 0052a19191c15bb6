//! End-of-iteration decision: continue, finalize, or halt.

use chrono::{DateTime, Utc};

use super::breaker::{BreakerConfig, CircuitBreakerState, HaltReason};
use super::state::{BridgeState, ConvergenceConfig, FinalizeReason, IterationRecord, RunMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationVerdict {
    Continue,
    Finalize(FinalizeReason),
    Halt(HaltReason),
}

/// Decide what follows the iteration in `record`, which must already be
/// folded into `state` and `breaker`.
///
/// Checks run in a fixed order and the first hit wins: autonomous blocker,
/// reviewers unavailable, same issue, flatline, no progress, depth reached,
/// cycle limit, wall clock.
pub fn evaluate(
    state: &BridgeState,
    breaker: &CircuitBreakerState,
    record: &IterationRecord,
    breaker_cfg: &BreakerConfig,
    convergence: &ConvergenceConfig,
    now: DateTime<Utc>,
) -> IterationVerdict {
    if state.mode == RunMode::Autonomous {
        let blockers: Vec<_> = record.blockers().map(|b| b.id.clone()).collect();
        if !blockers.is_empty() {
            return IterationVerdict::Halt(HaltReason::BlockerFound {
                finding_ids: blockers,
            });
        }
    }
    if record.reviewers_ok == 0 {
        return IterationVerdict::Halt(HaltReason::ReviewersUnavailable {
            iteration: record.iteration,
            errors: record.invocation_errors.clone(),
        });
    }
    if let Some(reason) = breaker.same_issue(breaker_cfg) {
        return IterationVerdict::Halt(reason);
    }
    if state.is_flatlined(convergence) {
        return IterationVerdict::Finalize(FinalizeReason::Flatline);
    }
    if let Some(reason) = breaker.no_progress(breaker_cfg) {
        return IterationVerdict::Halt(reason);
    }
    if state.iteration >= state.depth {
        return IterationVerdict::Finalize(FinalizeReason::DepthReached);
    }
    if let Some(reason) = breaker.cycle_limit(breaker_cfg) {
        return IterationVerdict::Halt(reason);
    }
    if let Some(reason) = breaker.wall_clock(breaker_cfg, now) {
        return IterationVerdict::Halt(reason);
    }
    IterationVerdict::Continue
}
