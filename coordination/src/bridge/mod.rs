//! Run lifecycle: phase machine, run-level circuit breaker, persistence, and
//! reports.
//!
//! ```text
//! PREFLIGHT ──► JACK_IN ──► ITERATING ──┬──► FINALIZING ──► JACKED_OUT
//!                              ▲    │   │      (flatline | depth reached)
//!                              └────┘   │
//!                           (continue)  └──► HALTED
//!                                           (breaker trip, autonomous blocker,
//!                                            reviewers unavailable, integrity)
//! ```
//!
//! After every iteration [`evaluate`] decides between continuing, finalizing,
//! and halting. The state is persisted via [`RunStore`] at each phase change
//! and after each iteration so a crashed run can be resumed.

pub mod breaker;
pub mod persistence;
pub mod report;
pub mod state;
pub mod verdict;

pub use breaker::{BreakerConfig, CircuitBreakerState, HaltReason, Trip};
pub use persistence::{PersistenceError, RunRecord, RunStore};
pub use report::{
    EscalationReport, IterationSummary, RollbackStep, RunSummary, DEFAULT_LAST_FINDINGS,
};
pub use state::{
    Anomaly, BridgePhase, BridgeState, BridgeTransition, CategoryCounts, ConvergenceConfig,
    FinalizeReason, FindingDigest, IntegratedFinding, IterationRecord, RunMode, TransitionError,
};
pub use verdict::{evaluate, IterationVerdict};
