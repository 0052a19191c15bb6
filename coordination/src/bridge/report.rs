//! Run summaries and escalation reports.
//!
//! Both are produced as a serde record (JSON) and as text for humans, from
//! the same data.

use std::collections::HashSet;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::breaker::{CircuitBreakerState, HaltReason};
use super::state::{
    Anomaly, BridgePhase, BridgeState, CategoryCounts, FinalizeReason, FindingDigest,
    IntegratedFinding, RunMode,
};
use crate::consensus::Category;
use crate::digest::ContentHash;
use crate::integration::IntegrationManifest;
use crate::review::TokenUsage;

/// How many findings an escalation report lists.
pub const DEFAULT_LAST_FINDINGS: usize = 10;

/// Per-iteration slice of a run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub counts: CategoryCounts,
    pub severity: u32,
    pub severity_pct: f64,
    pub reviewers_ok: usize,
    pub reviewers_failed: usize,
    pub integrated: usize,
    pub anomalies: Vec<Anomaly>,
    pub duration_ms: u64,
    #[serde(default)]
    pub cost_micros: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub target: String,
    pub mode: RunMode,
    pub depth: u32,
    pub final_phase: BridgePhase,
    /// Only a run that went through `Finalizing` succeeded.
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_reason: Option<FinalizeReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    pub iterations: Vec<IterationSummary>,
    pub integrated: Vec<IntegratedFinding>,
    /// Disputed findings left for human inspection, deduplicated.
    pub disputed: Vec<FindingDigest>,
    pub surfaced_blockers: Vec<FindingDigest>,
    pub start_hash: ContentHash,
    pub final_hash: ContentHash,
    pub breaker_trips: usize,
    /// Tokens billed across the run.
    #[serde(default)]
    pub usage: TokenUsage,
    /// Metered spend across the run, in micro-USD.
    #[serde(default)]
    pub cost_micros: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn from_state(state: &BridgeState, breaker: &CircuitBreakerState, now: DateTime<Utc>) -> Self {
        let iterations = state
            .history
            .iter()
            .map(|r| IterationSummary {
                iteration: r.iteration,
                counts: r.counts,
                severity: r.severity,
                severity_pct: r.severity_pct,
                reviewers_ok: r.reviewers_ok,
                reviewers_failed: r.reviewers_failed,
                integrated: r.integrated.len(),
                anomalies: r.anomalies.clone(),
                duration_ms: r.duration_ms,
                cost_micros: r.cost_micros,
            })
            .collect();
        let mut usage = TokenUsage::default();
        for r in &state.history {
            usage += r.usage;
        }

        let mut seen = HashSet::new();
        let disputed = state
            .history
            .iter()
            .flat_map(|r| r.findings.iter())
            .filter(|f| f.category == Category::Disputed && seen.insert(f.id.clone()))
            .cloned()
            .collect();

        Self {
            run_id: state.run_id.clone(),
            target: state.target.clone(),
            mode: state.mode,
            depth: state.depth,
            final_phase: state.phase,
            success: state.finalize_reason.is_some() && state.halt_reason.is_none(),
            finalize_reason: state.finalize_reason,
            halt_reason: state.halt_reason.clone(),
            iterations,
            integrated: state.integrated.clone(),
            disputed,
            surfaced_blockers: state.surfaced_blockers.clone(),
            start_hash: state.start_hash.clone(),
            final_hash: state.current_hash.clone(),
            breaker_trips: breaker.trips.len(),
            usage,
            cost_micros: state.spent_micros(),
            started_at: state.created_at,
            elapsed_ms: now
                .signed_duration_since(state.created_at)
                .num_milliseconds()
                .max(0) as u64,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Short human-readable report.
    pub fn narrative(&self) -> String {
        let mut out = String::new();
        let outcome = match (&self.finalize_reason, &self.halt_reason) {
            (_, Some(reason)) => format!("halted: {reason}"),
            (Some(FinalizeReason::Flatline), None) => "converged (flatline)".to_string(),
            (Some(FinalizeReason::DepthReached), None) => {
                format!("completed the configured depth of {}", self.depth)
            }
            (None, None) => format!("stopped in {}", self.final_phase),
        };
        let _ = writeln!(
            out,
            "Run {} on {} ({} mode) {} after {} iteration(s) in {:.1}s.",
            self.run_id,
            self.target,
            self.mode,
            outcome,
            self.iterations.len(),
            self.elapsed_ms as f64 / 1000.0
        );
        let _ = writeln!(
            out,
            "Document hash {} -> {}.",
            self.start_hash.short(),
            self.final_hash.short()
        );
        if self.usage.total() > 0 || self.cost_micros > 0 {
            let _ = writeln!(
                out,
                "Spent ${:.6} on {} input + {} output tokens.",
                self.cost_micros as f64 / 1_000_000.0,
                self.usage.input_tokens,
                self.usage.output_tokens
            );
        }
        let _ = writeln!(out);

        for it in &self.iterations {
            let c = &it.counts;
            let _ = writeln!(
                out,
                "Iteration {}: {} high-consensus, {} disputed, {} low-value, {} blocker, {} praise; severity {} ({:.0}% of first); {} integrated{}.",
                it.iteration,
                c.high_consensus,
                c.disputed,
                c.low_value,
                c.blocker,
                c.praise,
                it.severity,
                it.severity_pct,
                it.integrated,
                if it.anomalies.is_empty() {
                    String::new()
                } else {
                    format!(", {} anomaly(ies)", it.anomalies.len())
                }
            );
        }

        if !self.integrated.is_empty() {
            let _ = writeln!(out, "\nIntegrated:");
            for i in &self.integrated {
                let _ = writeln!(out, "  - {} (manifest {}, iteration {})", i.summary, i.manifest_id, i.iteration);
            }
        }
        if !self.disputed.is_empty() {
            let _ = writeln!(out, "\nDisputed, needs a human decision:");
            for d in &self.disputed {
                let _ = writeln!(out, "  - {}", d.summary);
            }
        }
        if !self.surfaced_blockers.is_empty() {
            let _ = writeln!(out, "\nBlockers surfaced to the operator:");
            for b in &self.surfaced_blockers {
                let _ = writeln!(out, "  - {}", b.summary);
            }
        }
        out
    }
}

/// One rollback instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStep {
    pub manifest_id: Uuid,
    pub iteration: u32,
    pub snapshot_id: String,
    pub pre_hash: ContentHash,
    pub post_hash: ContentHash,
    pub summaries: Vec<String>,
    pub command: String,
}

/// Produced whenever a run ends `Halted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationReport {
    pub run_id: String,
    pub target: String,
    pub trigger: HaltReason,
    pub explanation: String,
    pub halted_at_iteration: u32,
    pub last_findings: Vec<FindingDigest>,
    /// Newest first: undo in this order.
    pub rollback: Vec<RollbackStep>,
    pub start_hash: ContentHash,
    pub current_hash: ContentHash,
    pub generated_at: DateTime<Utc>,
}

impl EscalationReport {
    /// `None` unless the run halted. `manifests` are this run's manifests in
    /// any order.
    pub fn build(
        state: &BridgeState,
        manifests: &[IntegrationManifest],
        last_n: usize,
    ) -> Option<Self> {
        let trigger = state.halt_reason.clone()?;
        let mut ordered: Vec<&IntegrationManifest> = manifests
            .iter()
            .filter(|m| m.run_id == state.run_id)
            .collect();
        ordered.sort_by(|a, b| (b.committed_at, b.manifest_id).cmp(&(a.committed_at, a.manifest_id)));

        let rollback = ordered
            .into_iter()
            .map(|m| RollbackStep {
                manifest_id: m.manifest_id,
                iteration: m.iteration,
                snapshot_id: m.snapshot.id.to_string(),
                pre_hash: m.pre_hash.clone(),
                post_hash: m.post_hash.clone(),
                summaries: m.summaries.clone(),
                command: format!("flatline rollback --manifest {}", m.manifest_id),
            })
            .collect();

        Some(Self {
            run_id: state.run_id.clone(),
            target: state.target.clone(),
            explanation: trigger.to_string(),
            trigger,
            halted_at_iteration: state.iteration,
            last_findings: state.last_findings(last_n),
            rollback,
            start_hash: state.start_hash.clone(),
            current_hash: state.current_hash.clone(),
            generated_at: Utc::now(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Escalation: run {} halted\n", self.run_id);
        let _ = writeln!(out, "- Target: `{}`", self.target);
        let _ = writeln!(out, "- Trigger: `{}`", self.trigger.label());
        let _ = writeln!(out, "- Why: {}", self.explanation);
        let _ = writeln!(out, "- Halted after iteration {}", self.halted_at_iteration);
        let _ = writeln!(
            out,
            "- Hash at start `{}`, now `{}`\n",
            self.start_hash.short(),
            self.current_hash.short()
        );

        let _ = writeln!(out, "## Last findings\n");
        if self.last_findings.is_empty() {
            let _ = writeln!(out, "_none_");
        }
        for f in &self.last_findings {
            let _ = writeln!(out, "- {}", f.summary);
        }

        let _ = writeln!(out, "\n## Rollback\n");
        if self.rollback.is_empty() {
            let _ = writeln!(
                out,
                "No integration was committed by this run; the target was not modified by it."
            );
            return out;
        }
        let _ = writeln!(
            out,
            "Roll back newest first. Rolling back a manifest restores its pre-image, which also discards every later change.\n"
        );
        for (i, step) in self.rollback.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}. Manifest `{}` (iteration {}, snapshot `{}`): restores `{}` (was `{}`)",
                i + 1,
                step.manifest_id,
                step.iteration,
                step.snapshot_id,
                step.pre_hash.short(),
                step.post_hash.short()
            );
            for s in &step.summaries {
                let _ = writeln!(out, "   - {s}");
            }
            let _ = writeln!(out, "   ```\n   {}\n   ```", step.command);
        }
        out
    }
}
