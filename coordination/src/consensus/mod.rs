//! Consensus: turn independent reviewer output into classified findings.
//!
//! ```text
//! reviewer payloads ──► assemble (merge by proposal key)
//!        peer scores ──►    │
//!   skeptic concerns ──►    ▼
//!                       candidates ──► classify ──► Finding { id, category, ... }
//! ```
//!
//! [`classify`] is a pure function; everything stateful (identity hashing,
//! merging) happens before it in [`assembly`] and [`finding`].

pub mod assembly;
pub mod classifier;
pub mod finding;

pub use assembly::{assemble, Candidate};
pub use classifier::{classify, Category, ThresholdError, ThresholdOverride, Thresholds};
pub use finding::{normalize, Finding, FindingId, ProposalKey, SlotScore};
