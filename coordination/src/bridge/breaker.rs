//! Run-level circuit breaker.
//!
//! Counters live in [`CircuitBreakerState`], owned by one run and persisted
//! with it; nothing here is global, so concurrent runs (and tests) never
//! share counters.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::{Finding, FindingId};

/// Breaker limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive iterations the same finding may appear before halting.
    pub same_issue_threshold: u32,
    /// Consecutive iterations without an integrated finding before halting.
    pub no_progress_threshold: u32,
    pub max_iterations: u32,
    /// Wall-clock budget for the whole run.
    pub wall_clock_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            same_issue_threshold: 3,
            no_progress_threshold: 3,
            max_iterations: 20,
            wall_clock_secs: 3600,
        }
    }
}

impl BreakerConfig {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }
}

/// Why a run halted. Every variant is a control error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum HaltReason {
    SameIssue {
        finding_id: FindingId,
        occurrences: u32,
    },
    NoProgress {
        iterations: u32,
    },
    CycleLimit {
        iterations: u32,
    },
    WallClockTimeout {
        elapsed_secs: u64,
        budget_secs: u64,
    },
    BlockerFound {
        finding_ids: Vec<FindingId>,
    },
    /// No primary reviewer produced a result in an iteration.
    ReviewersUnavailable {
        iteration: u32,
        errors: Vec<String>,
    },
    /// A failed transaction could not be restored from its snapshot.
    IntegrityFailure {
        message: String,
    },
    /// The run's metered spend reached its limit.
    BudgetExhausted {
        spent_micros: u64,
        limit_micros: u64,
    },
    Cancelled,
}

impl HaltReason {
    /// Short machine label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SameIssue { .. } => "same_issue",
            Self::NoProgress { .. } => "no_progress",
            Self::CycleLimit { .. } => "cycle_limit",
            Self::WallClockTimeout { .. } => "wall_clock_timeout",
            Self::BlockerFound { .. } => "blocker_found",
            Self::ReviewersUnavailable { .. } => "reviewers_unavailable",
            Self::IntegrityFailure { .. } => "integrity_failure",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SameIssue {
                finding_id,
                occurrences,
            } => write!(
                f,
                "finding {} recurred in {occurrences} consecutive iterations",
                finding_id.short()
            ),
            Self::NoProgress { iterations } => {
                write!(f, "{iterations} consecutive iterations integrated nothing")
            }
            Self::CycleLimit { iterations } => {
                write!(f, "iteration limit reached after {iterations} iterations")
            }
            Self::WallClockTimeout {
                elapsed_secs,
                budget_secs,
            } => write!(f, "wall-clock budget of {budget_secs}s exhausted ({elapsed_secs}s elapsed)"),
            Self::BlockerFound { finding_ids } => write!(
                f,
                "{} blocker finding(s) in autonomous mode",
                finding_ids.len()
            ),
            Self::ReviewersUnavailable { iteration, errors } => write!(
                f,
                "no reviewer produced a result in iteration {iteration} ({})",
                errors.join("; ")
            ),
            Self::IntegrityFailure { message } => {
                write!(f, "integration could not be restored: {message}")
            }
            Self::BudgetExhausted {
                spent_micros,
                limit_micros,
            } => write!(
                f,
                "spend budget of {limit_micros} micro-USD exhausted ({spent_micros} spent)"
            ),
            Self::Cancelled => write!(f, "run cancelled"),
        }
    }
}

/// A recorded breaker trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip {
    pub iteration: u32,
    pub at: DateTime<Utc>,
    pub reason: HaltReason,
}

/// Per-run breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub total_iterations: u32,
    pub consecutive_no_progress: u32,
    /// Consecutive iterations each finding identity has appeared in.
    pub finding_streaks: BTreeMap<FindingId, u32>,
    pub trips: Vec<Trip>,
}

impl CircuitBreakerState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            total_iterations: 0,
            consecutive_no_progress: 0,
            finding_streaks: BTreeMap::new(),
            trips: Vec::new(),
        }
    }

    /// Update counters after an iteration. Findings absent this iteration
    /// lose their streak; praise and low-value findings never build one.
    pub fn observe(&mut self, findings: &[Finding], integrated: usize) {
        self.total_iterations += 1;
        if integrated == 0 {
            self.consecutive_no_progress += 1;
        } else {
            self.consecutive_no_progress = 0;
        }

        let mut next = BTreeMap::new();
        for f in findings.iter().filter(|f| f.category.counts_toward_recurrence()) {
            if next.contains_key(&f.id) {
                continue;
            }
            let streak = self.finding_streaks.get(&f.id).copied().unwrap_or(0) + 1;
            next.insert(f.id.clone(), streak);
        }
        self.finding_streaks = next;
    }

    pub fn same_issue(&self, cfg: &BreakerConfig) -> Option<HaltReason> {
        self.finding_streaks
            .iter()
            .find(|(_, streak)| **streak >= cfg.same_issue_threshold)
            .map(|(id, streak)| HaltReason::SameIssue {
                finding_id: id.clone(),
                occurrences: *streak,
            })
    }

    pub fn no_progress(&self, cfg: &BreakerConfig) -> Option<HaltReason> {
        (self.consecutive_no_progress >= cfg.no_progress_threshold).then_some(
            HaltReason::NoProgress {
                iterations: self.consecutive_no_progress,
            },
        )
    }

    pub fn cycle_limit(&self, cfg: &BreakerConfig) -> Option<HaltReason> {
        (self.total_iterations >= cfg.max_iterations).then_some(HaltReason::CycleLimit {
            iterations: self.total_iterations,
        })
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn wall_clock(&self, cfg: &BreakerConfig, now: DateTime<Utc>) -> Option<HaltReason> {
        let elapsed = self.elapsed(now);
        (elapsed >= cfg.wall_clock()).then(|| HaltReason::WallClockTimeout {
            elapsed_secs: elapsed.as_secs(),
            budget_secs: cfg.wall_clock_secs,
        })
    }

    pub fn trip(&mut self, iteration: u32, reason: HaltReason) {
        tracing::warn!(
            run_id = %self.run_id,
            iteration,
            trigger = reason.label(),
            reason = %reason,
            "Circuit breaker tripped"
        );
        self.trips.push(Trip {
            iteration,
            at: Utc::now(),
            reason,
        });
    }
}
