//! Retry policy and per-backend circuit for invocation errors.
//!
//! Both types are pure bookkeeping. The async executor that sleeps between
//! attempts lives in the bridge crate; it asks [`RetryPolicy::decide`] what
//! to do after each failure and consults [`BackendCircuit`] before each call.

pub mod circuit;
pub mod policy;

pub use circuit::{BackendCircuit, CircuitState};
pub use policy::{RetryDecision, RetryPolicy};
