//! Bridge state machine: phases, transitions, and per-iteration history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::breaker::HaltReason;
use crate::consensus::{Category, Finding, FindingId, Thresholds};
use crate::digest::ContentHash;
use crate::integration::AnomalyKind;
use crate::review::TokenUsage;

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgePhase {
    /// Target existence and lockability checks.
    Preflight,
    /// Run state established and persisted.
    JackIn,
    /// Review → classify → integrate loop.
    Iterating,
    /// Converged or reached the configured depth; producing the summary.
    Finalizing,
    /// Finished successfully.
    JackedOut,
    /// Stopped by a control error; escalation report produced.
    Halted,
}

impl BridgePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::JackedOut | Self::Halted)
    }

    pub fn valid_transitions(self) -> &'static [BridgePhase] {
        match self {
            Self::Preflight => &[Self::JackIn],
            Self::JackIn => &[Self::Iterating],
            Self::Iterating => &[Self::Finalizing, Self::Halted],
            Self::Finalizing => &[Self::JackedOut],
            Self::JackedOut | Self::Halted => &[],
        }
    }

    pub fn can_transition_to(self, to: BridgePhase) -> bool {
        self.valid_transitions().contains(&to)
    }
}

impl std::fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preflight => write!(f, "PREFLIGHT"),
            Self::JackIn => write!(f, "JACK_IN"),
            Self::Iterating => write!(f, "ITERATING"),
            Self::Finalizing => write!(f, "FINALIZING"),
            Self::JackedOut => write!(f, "JACKED_OUT"),
            Self::Halted => write!(f, "HALTED"),
        }
    }
}

/// Whether blockers halt the run or are surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Interactive,
    Autonomous,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::Autonomous => write!(f, "autonomous"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(format!("unknown mode '{other}' (expected interactive|autonomous)")),
        }
    }
}

/// Why a run left `Iterating` successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    Flatline,
    DepthReached,
}

impl std::fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flatline => write!(f, "flatline"),
            Self::DepthReached => write!(f, "depth_reached"),
        }
    }
}

/// Convergence detection settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Severity below this percentage of the first non-zero iteration's counts as flat.
    pub flatline_pct: f64,
    /// Consecutive flat iterations required.
    pub flatline_consecutive: u32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            flatline_pct: 5.0,
            flatline_consecutive: 2,
        }
    }
}

/// Finding counts for one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub high_consensus: u32,
    pub disputed: u32,
    pub low_value: u32,
    pub blocker: u32,
    pub praise: u32,
}

impl CategoryCounts {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut counts = Self::default();
        for f in findings {
            counts.add(f.category);
        }
        counts
    }

    pub fn add(&mut self, category: Category) {
        match category {
            Category::HighConsensus => self.high_consensus += 1,
            Category::Disputed => self.disputed += 1,
            Category::LowValue => self.low_value += 1,
            Category::Blocker => self.blocker += 1,
            Category::Praise => self.praise += 1,
        }
    }

    pub fn get(&self, category: Category) -> u32 {
        match category {
            Category::HighConsensus => self.high_consensus,
            Category::Disputed => self.disputed,
            Category::LowValue => self.low_value,
            Category::Blocker => self.blocker,
            Category::Praise => self.praise,
        }
    }

    /// Weighted severity score.
    pub fn severity(&self) -> u32 {
        Category::ALL
            .iter()
            .map(|c| self.get(*c) * c.severity_weight())
            .sum()
    }

    pub fn total(&self) -> u32 {
        Category::ALL.iter().map(|c| self.get(*c)).sum()
    }
}

/// Compact finding record kept in history and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingDigest {
    pub id: FindingId,
    pub category: Category,
    pub summary: String,
}

impl From<&Finding> for FindingDigest {
    fn from(f: &Finding) -> Self {
        Self {
            id: f.id.clone(),
            category: f.category,
            summary: f.summary(),
        }
    }
}

/// A finding that was committed, with its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegratedFinding {
    pub finding_id: FindingId,
    pub manifest_id: Uuid,
    pub iteration: u32,
    pub summary: String,
}

/// Non-fatal transaction failure recorded in the iteration log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding_id: Option<FindingId>,
    pub message: String,
}

/// Everything observed in one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub baseline_hash: ContentHash,
    pub counts: CategoryCounts,
    pub severity: u32,
    /// Severity as a percentage of the first non-zero iteration's.
    pub severity_pct: f64,
    pub reviewers_ok: usize,
    pub reviewers_failed: usize,
    pub skeptics_ok: usize,
    /// Final invocation errors, `role[slot]@backend: error`.
    #[serde(default)]
    pub invocation_errors: Vec<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Metered spend of every round in this iteration, in micro-USD.
    #[serde(default)]
    pub cost_micros: u64,
    pub findings: Vec<FindingDigest>,
    pub integrated: Vec<IntegratedFinding>,
    pub anomalies: Vec<Anomaly>,
}

impl IterationRecord {
    pub fn new(iteration: u32, started_at: DateTime<Utc>, baseline_hash: ContentHash) -> Self {
        Self {
            iteration,
            started_at,
            duration_ms: 0,
            baseline_hash,
            counts: CategoryCounts::default(),
            severity: 0,
            severity_pct: 0.0,
            reviewers_ok: 0,
            reviewers_failed: 0,
            skeptics_ok: 0,
            invocation_errors: Vec::new(),
            usage: TokenUsage::default(),
            cost_micros: 0,
            findings: Vec::new(),
            integrated: Vec::new(),
            anomalies: Vec::new(),
        }
    }

    /// Record classified findings and their counts.
    pub fn set_findings(&mut self, findings: &[Finding]) {
        self.counts = CategoryCounts::from_findings(findings);
        self.severity = self.counts.severity();
        self.findings = findings.iter().map(FindingDigest::from).collect();
    }

    pub fn blockers(&self) -> impl Iterator<Item = &FindingDigest> {
        self.findings
            .iter()
            .filter(|f| f.category == Category::Blocker)
    }
}

/// A phase transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeTransition {
    pub from: BridgePhase,
    pub to: BridgePhase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: BridgePhase,
    pub to: BridgePhase,
}

/// The orchestrator's record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeState {
    pub run_id: String,
    pub target: String,
    pub mode: RunMode,
    /// Iterations to run if convergence is not detected first.
    pub depth: u32,
    pub thresholds: Thresholds,
    pub phase: BridgePhase,
    /// Completed iterations.
    pub iteration: u32,
    pub start_hash: ContentHash,
    /// Last hash known to be produced or observed by this run.
    pub current_hash: ContentHash,
    pub history: Vec<IterationRecord>,
    /// First non-zero iteration severity; the flatline baseline.
    pub initial_severity: Option<u32>,
    pub flatline_streak: u32,
    pub integrated: Vec<IntegratedFinding>,
    pub surfaced_blockers: Vec<FindingDigest>,
    pub transitions: Vec<BridgeTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_reason: Option<FinalizeReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BridgeState {
    pub fn new(
        run_id: impl Into<String>,
        target: impl Into<String>,
        mode: RunMode,
        depth: u32,
        thresholds: Thresholds,
        start_hash: ContentHash,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            target: target.into(),
            mode,
            depth,
            thresholds,
            phase: BridgePhase::Preflight,
            iteration: 0,
            current_hash: start_hash.clone(),
            start_hash,
            history: Vec::new(),
            initial_severity: None,
            flatline_streak: 0,
            integrated: Vec::new(),
            surfaced_blockers: Vec::new(),
            transitions: Vec::new(),
            halt_reason: None,
            finalize_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, to: BridgePhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.can_transition_to(to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        tracing::debug!(
            run_id = %self.run_id,
            from = %self.phase,
            to = %to,
            reason,
            "Bridge transition"
        );
        let now = Utc::now();
        self.transitions.push(BridgeTransition {
            from: self.phase,
            to,
            timestamp: now,
            reason: reason.to_string(),
        });
        self.phase = to;
        self.updated_at = now;
        Ok(())
    }

    /// Append a finished iteration, updating the severity trend.
    /// Returns whether the run has flatlined.
    pub fn record_iteration(&mut self, mut record: IterationRecord, convergence: &ConvergenceConfig) -> bool {
        // Quiet iterations before the first finding leave the baseline unset.
        if self.initial_severity.unwrap_or(0) == 0 && record.severity > 0 {
            self.initial_severity = Some(record.severity);
        }
        record.severity_pct = match self.initial_severity {
            Some(initial) if initial > 0 => f64::from(record.severity) * 100.0 / f64::from(initial),
            _ => 0.0,
        };
        if record.severity_pct < convergence.flatline_pct {
            self.flatline_streak += 1;
        } else {
            self.flatline_streak = 0;
        }

        self.iteration = record.iteration;
        self.integrated.extend(record.integrated.iter().cloned());
        self.history.push(record);
        self.updated_at = Utc::now();
        self.is_flatlined(convergence)
    }

    pub fn is_flatlined(&self, convergence: &ConvergenceConfig) -> bool {
        self.flatline_streak >= convergence.flatline_consecutive.max(1)
    }

    pub fn was_integrated(&self, id: &FindingId) -> bool {
        self.integrated.iter().any(|i| &i.finding_id == id)
    }

    /// Metered spend across every recorded iteration, in micro-USD.
    pub fn spent_micros(&self) -> u64 {
        self.history.iter().map(|r| r.cost_micros).sum()
    }

    /// Severity per iteration, oldest first.
    pub fn severity_trend(&self) -> Vec<u32> {
        self.history.iter().map(|r| r.severity).collect()
    }

    /// Most recent `n` findings across history, newest first.
    pub fn last_findings(&self, n: usize) -> Vec<FindingDigest> {
        self.history
            .iter()
            .rev()
            .flat_map(|r| r.findings.iter().rev())
            .take(n)
            .cloned()
            .collect()
    }
}
