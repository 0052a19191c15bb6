//! Flatline coordination: deterministic building blocks for multi-reviewer runs.
//!
//! Everything in this crate is synchronous and free of network I/O. The async
//! runtime (backend calls, fan-out, the iteration loop) lives in
//! `flatline-bridge` and calls into these modules.
//!
//! - [`review`]: review requests/results and the typed invocation error taxonomy
//! - [`consensus`]: finding assembly, identity hashing, and the pure classifier
//! - [`retry`]: backoff policy and per-backend circuit
//! - [`metering`]: integer cost pricing and the per-run spend budget
//! - [`integration`]: advisory locks, snapshots, manifests, and the atomic pipeline
//! - [`bridge`]: run state machine, circuit breaker, persistence, and reports

pub mod bridge;
pub mod consensus;
pub mod digest;
pub mod integration;
pub mod metering;
pub mod retry;
pub mod review;

pub use bridge::{BridgePhase, BridgeState, CircuitBreakerState, HaltReason, RunMode};
pub use consensus::{classify, Category, Finding, FindingId, Thresholds};
pub use digest::ContentHash;
pub use integration::{IntegrationError, IntegrationManifest, IntegrationPipeline};
pub use metering::{Pricing, RunBudget};
pub use review::{
    InvocationError, InvocationErrorKind, ReviewRequest, ReviewResult, ReviewRole, TokenUsage,
};
