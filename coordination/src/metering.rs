//! Cost metering: integer micro-USD pricing and the per-run spend budget.
//!
//! All cost math is integer. Prices are micro-USD per million tokens, and a
//! call's cost is `floor(tokens * price / 1_000_000)` per direction.
//!
//! [`RunBudget`] is checked before every attempt and charged after it.
//! Concurrent slots may all pass the check before any of them is charged,
//! so a run can overshoot its limit by at most the in-flight calls.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::review::{InvocationError, InvocationErrorKind, TokenUsage};

const PER_MTOK: u128 = 1_000_000;

/// Per-backend price list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    /// Micro-USD per million input tokens.
    pub input_per_mtok: u64,
    /// Micro-USD per million output tokens.
    pub output_per_mtok: u64,
    /// Flat micro-USD charged per completed call.
    pub per_call: u64,
}

impl Pricing {
    pub fn cost_micros(&self, usage: &TokenUsage) -> u64 {
        let input = u128::from(usage.input_tokens) * u128::from(self.input_per_mtok) / PER_MTOK;
        let output = u128::from(usage.output_tokens) * u128::from(self.output_per_mtok) / PER_MTOK;
        let total = input + output + u128::from(self.per_call);
        u64::try_from(total).unwrap_or(u64::MAX)
    }
}

/// Spend limit for one run, shared by every slot of every round.
#[derive(Debug)]
pub struct RunBudget {
    limit_micros: Option<u64>,
    spent_micros: AtomicU64,
}

impl RunBudget {
    /// `already_spent` carries spend over from a resumed run.
    pub fn new(limit_micros: Option<u64>, already_spent: u64) -> Self {
        Self {
            limit_micros,
            spent_micros: AtomicU64::new(already_spent),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, 0)
    }

    pub fn spent_micros(&self) -> u64 {
        self.spent_micros.load(Ordering::SeqCst)
    }

    pub fn limit_micros(&self) -> Option<u64> {
        self.limit_micros
    }

    pub fn is_exhausted(&self) -> bool {
        self.limit_micros
            .is_some_and(|limit| self.spent_micros() >= limit)
    }

    /// Fails with a fatal `budget_exceeded` error once the limit is reached.
    pub fn admit(&self) -> Result<(), InvocationError> {
        match self.limit_micros {
            Some(limit) if self.spent_micros() >= limit => Err(InvocationError::new(
                InvocationErrorKind::BudgetExceeded,
                format!(
                    "run budget of {limit} micro-USD spent ({} spent)",
                    self.spent_micros()
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Returns the new running total.
    pub fn charge(&self, cost_micros: u64) -> u64 {
        self.spent_micros.fetch_add(cost_micros, Ordering::SeqCst) + cost_micros
    }
}

impl Default for RunBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}
