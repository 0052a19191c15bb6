//! Structured telemetry.
//!
//! Three sinks:
//! - tracing events on the `flatline::metrics` target: one per invocation
//!   attempt and one per iteration
//! - `<state_dir>/telemetry.jsonl`: append-only log of finished run summaries
//! - `<state_dir>/cost-ledger.jsonl`: one line per metered slot result

use std::path::Path;

use chrono::{DateTime, Utc};
use flatline_coordination::bridge::{IterationRecord, RunSummary};
use flatline_coordination::{InvocationError, ReviewResult, ReviewRole, TokenUsage};
use serde::Serialize;
use tracing::{info, warn};

pub const METRICS_TARGET: &str = "flatline::metrics";

/// Initialise the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Latency, cost, and outcome of one adapter call.
#[derive(Debug, Clone)]
pub struct InvocationMetric<'a> {
    pub backend: &'a str,
    pub role: ReviewRole,
    pub slot: usize,
    pub latency_ms: u64,
    pub usage: TokenUsage,
    pub cost_micros: u64,
    pub error: Option<&'a InvocationError>,
}

impl InvocationMetric<'_> {
    pub fn emit(&self) {
        let outcome = match self.error {
            None => "ok".to_string(),
            Some(e) => e.kind.to_string(),
        };
        tracing::info!(
            target: METRICS_TARGET,
            backend = %self.backend,
            role = %self.role,
            slot = self.slot,
            latency_ms = self.latency_ms,
            input_tokens = self.usage.input_tokens,
            output_tokens = self.usage.output_tokens,
            cost_micros = self.cost_micros,
            outcome = %outcome,
            "invocation_complete"
        );
    }
}

pub fn emit_iteration(run_id: &str, record: &IterationRecord) {
    tracing::info!(
        target: METRICS_TARGET,
        run_id = %run_id,
        iteration = record.iteration,
        duration_ms = record.duration_ms,
        severity = record.severity,
        severity_pct = record.severity_pct,
        findings = record.findings.len(),
        integrated = record.integrated.len(),
        anomalies = record.anomalies.len(),
        reviewers_ok = record.reviewers_ok,
        reviewers_failed = record.reviewers_failed,
        cost_micros = record.cost_micros,
        "iteration_complete"
    );
}

/// One line of the cost ledger.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry<'a> {
    pub ts: DateTime<Utc>,
    pub run_id: &'a str,
    pub iteration: u32,
    pub backend: &'a str,
    pub role: ReviewRole,
    pub slot: usize,
    pub attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_micros: u64,
    pub latency_ms: u64,
}

/// Append one ledger line per result that was billed for anything.
///
/// Failures are logged and swallowed.
pub fn append_cost_ledger(run_id: &str, iteration: u32, results: &[ReviewResult], state_dir: &Path) {
    let now = Utc::now();
    let lines: Vec<String> = results
        .iter()
        .filter(|r| r.usage.total() > 0 || r.cost_micros > 0)
        .filter_map(|r| {
            serde_json::to_string(&LedgerEntry {
                ts: now,
                run_id,
                iteration,
                backend: &r.backend,
                role: r.role,
                slot: r.slot,
                attempts: r.attempts,
                input_tokens: r.usage.input_tokens,
                output_tokens: r.usage.output_tokens,
                cost_micros: r.cost_micros,
                latency_ms: r.latency_ms,
            })
            .map_err(|e| warn!("Failed to serialize ledger entry: {e}"))
            .ok()
        })
        .collect();
    if lines.is_empty() {
        return;
    }

    use std::io::Write;
    let path = state_dir.join("cost-ledger.jsonl");
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{}", lines.join("\n")) {
                warn!("Failed to append cost ledger: {e}");
            }
        }
        Err(e) => warn!("Failed to open cost ledger: {e}"),
    }
}

/// Append a run summary to `telemetry.jsonl` under `state_dir`.
///
/// Each line is a complete JSON object. Failures are logged and swallowed.
pub fn append_run_summary(summary: &RunSummary, state_dir: &Path) {
    let path = state_dir.join("telemetry.jsonl");
    match serde_json::to_string(summary) {
        Ok(json) => {
            use std::io::Write;
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        warn!("Failed to append telemetry: {e}");
                    } else {
                        info!(path = %path.display(), "Appended run telemetry");
                    }
                }
                Err(e) => warn!("Failed to open telemetry file: {e}"),
            }
        }
        Err(e) => warn!("Failed to serialize telemetry: {e}"),
    }
}
