//! Flatline bridge: the async side of a multi-reviewer consensus run.
//!
//! Backends are called through [`adapter::invoke`] (one bounded call) and
//! [`retry::RetryExecutor`] (backoff, per-backend circuit with fallback, and
//! the run's spend budget), fanned out by
//! [`fanout::FanOut`], and driven iteration by iteration by
//! [`orchestrator::Orchestrator`]. All deterministic logic lives in
//! `flatline-coordination`.

pub mod adapter;
pub mod backend;
pub mod config;
pub mod fanout;
pub mod orchestrator;
pub mod prompts;
pub mod retry;
pub mod telemetry;

pub use backend::{BackendPool, Completion, HttpBackend, ReasoningBackend};
pub use config::{ConfigError, FlatlineConfig};
pub use orchestrator::{Orchestrator, OrchestratorError, RunOptions, RunResult};
