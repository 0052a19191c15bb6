//! Iteration orchestrator.
//!
//! ```text
//! run ──► PREFLIGHT ──► JACK_IN ──► ITERATING ─────────────────────────────┐
//!         (exists,      (persist)     │                                    │
//!          readable,                  ▼                                    │
//!          lockable)     read document (adopt out-of-band edits)           │
//!                                     ▼                                    │
//!                        fan-out: reviewers + paired skeptics              │
//!                                     ▼                                    │
//!                        cross-score round (optional)                      │
//!                                     ▼                                    │
//!                        assemble + classify                               │
//!                                     ▼                                    │
//!                        integrate HIGH_CONSENSUS, one transaction each    │
//!                                     ▼                                    │
//!                        breaker + severity trend ──► evaluate ──continue──┘
//!                                                        │
//!                                    FINALIZING ◄────────┼────────► HALTED
//!                                        ▼                       (escalation)
//!                                    JACKED_OUT
//! ```
//!
//! Network calls happen only in the fan-out rounds. Integration runs
//! afterwards on the blocking pool, strictly one transaction at a time.
//! Cancellation, the wall-clock budget, and the spend budget are checked at
//! iteration start. Cancellation and the wall clock also cut a fan-out
//! round short and are checked again between transactions; a transaction
//! in progress always completes.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use flatline_coordination::bridge::{
    evaluate, Anomaly, BridgePhase, BridgeState, CircuitBreakerState, EscalationReport,
    FinalizeReason, FindingDigest, HaltReason, IntegratedFinding, IterationRecord,
    IterationVerdict, PersistenceError, RunMode, RunRecord, RunStore, RunSummary,
    TransitionError, DEFAULT_LAST_FINDINGS,
};
use flatline_coordination::consensus::assembly::collect_proposals;
use flatline_coordination::consensus::{assemble, Category, Finding, ThresholdError, ThresholdOverride};
use flatline_coordination::integration::{
    DocumentError, DocumentStore, IntegrationError, IntegrationPipeline, LockError,
    ManifestError, RollbackOutcome,
};
use flatline_coordination::retry::BackendCircuit;
use flatline_coordination::{ContentHash, ReviewRequest, ReviewResult, ReviewRole, RunBudget};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::BackendPool;
use crate::config::FlatlineConfig;
use crate::fanout::{FanOut, ReviewJob};
use crate::prompts;
use crate::retry::RetryExecutor;
use crate::telemetry;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("preflight failed: {0}")]
    Preflight(String),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("invalid thresholds: {0}")]
    Thresholds(#[from] ThresholdError),
    #[error("report encoding failed: {0}")]
    Report(#[from] serde_json::Error),
    #[error("no backend serves the {0} role")]
    MissingBackend(ReviewRole),
    #[error("run {run_id} is {phase} and cannot be resumed")]
    NotResumable { run_id: String, phase: BridgePhase },
    #[error("depth must be at least 1")]
    InvalidDepth,
    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target: String,
    pub mode: RunMode,
    pub depth: u32,
    pub thresholds_override: ThresholdOverride,
    /// Generated when absent.
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn new(target: impl Into<String>, mode: RunMode, depth: u32) -> Self {
        Self {
            target: target.into(),
            mode,
            depth,
            thresholds_override: ThresholdOverride::default(),
            run_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub phase: BridgePhase,
    pub summary: RunSummary,
    pub escalation: Option<EscalationReport>,
    /// Report files written next to the run record.
    pub artifacts: Vec<PathBuf>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.phase == BridgePhase::JackedOut
    }
}

pub struct Orchestrator {
    config: FlatlineConfig,
    pool: BackendPool,
    fanout: FanOut,
    pipeline: IntegrationPipeline,
    runs: RunStore,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: FlatlineConfig,
        pool: BackendPool,
        documents: Arc<dyn DocumentStore>,
    ) -> Result<Self, OrchestratorError> {
        if !pool.covers(ReviewRole::Reviewer) {
            return Err(OrchestratorError::MissingBackend(ReviewRole::Reviewer));
        }
        if config.invocation.skeptics && !pool.covers(ReviewRole::Skeptic) {
            return Err(OrchestratorError::MissingBackend(ReviewRole::Skeptic));
        }
        if config.invocation.cross_score && !pool.covers(ReviewRole::Scorer) {
            warn!("No backend serves the scorer role; cross-scoring disabled");
        }

        let executor = Arc::new(RetryExecutor::new(
            config.retry,
            BackendCircuit::new(
                config.invocation.circuit_failure_threshold,
                Duration::from_secs(config.invocation.circuit_cooldown_secs),
            ),
        ));
        let fanout = FanOut::new(
            executor,
            config.invocation.max_concurrency,
            config.invocation.timeout(),
        );
        let pipeline = IntegrationPipeline::new(
            documents,
            &config.state_dir,
            config.snapshots,
            config.lock_stale_after(),
            config.lock_wait(),
        )?;
        let runs = RunStore::new(&config.state_dir)?;

        Ok(Self {
            config,
            pool,
            fanout,
            pipeline,
            runs,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pipeline(&self) -> &IntegrationPipeline {
        &self.pipeline
    }

    pub fn status(&self, run_id: &str) -> Result<RunRecord, OrchestratorError> {
        Ok(self.runs.load(run_id)?)
    }

    pub async fn run(&self, opts: RunOptions) -> Result<RunResult, OrchestratorError> {
        if opts.depth == 0 {
            return Err(OrchestratorError::InvalidDepth);
        }
        let thresholds = self
            .config
            .thresholds
            .with_override(&opts.thresholds_override);
        thresholds.validate()?;
        let run_id = opts
            .run_id
            .clone()
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));
        RunStore::validate_run_id(&run_id)?;
        info!(
            run_id = %run_id,
            document = %opts.target,
            mode = %opts.mode,
            depth = opts.depth,
            "Starting run"
        );

        let start_hash = self.preflight(&opts.target, &run_id).await?;
        let mut state = BridgeState::new(
            run_id.as_str(),
            opts.target.as_str(),
            opts.mode,
            opts.depth,
            thresholds,
            start_hash,
        );
        let breaker = CircuitBreakerState::new(run_id.as_str());
        state.transition(BridgePhase::JackIn, "preflight passed")?;
        self.runs.save(&state, &breaker)?;
        state.transition(BridgePhase::Iterating, "run state persisted")?;
        self.runs.save(&state, &breaker)?;

        self.drive(state, breaker).await
    }

    /// Rehydrate a persisted run and continue it.
    pub async fn resume(&self, run_id: &str) -> Result<RunResult, OrchestratorError> {
        let record = self.runs.load(run_id)?;
        let (mut state, breaker) = (record.bridge, record.breaker);
        match state.phase {
            BridgePhase::JackedOut | BridgePhase::Halted => {
                return Err(OrchestratorError::NotResumable {
                    run_id: run_id.to_string(),
                    phase: state.phase,
                });
            }
            BridgePhase::Finalizing => {
                let reason = state
                    .finalize_reason
                    .unwrap_or(FinalizeReason::DepthReached);
                return self.finalize(state, breaker, reason);
            }
            BridgePhase::Preflight => {
                state.transition(BridgePhase::JackIn, "resumed")?;
                state.transition(BridgePhase::Iterating, "resumed")?;
            }
            BridgePhase::JackIn => state.transition(BridgePhase::Iterating, "resumed")?,
            BridgePhase::Iterating => {}
        }
        info!(run_id, iteration = state.iteration, "Resuming run");
        self.drive(state, breaker).await
    }

    /// Restore the pre-image recorded by a manifest.
    pub async fn rollback(&self, manifest_id: Uuid) -> Result<RollbackOutcome, OrchestratorError> {
        let pipeline = self.pipeline.clone();
        let owner = format!("rollback-{}", manifest_id.simple());
        blocking(move || pipeline.rollback(manifest_id, &owner)).await
    }

    async fn preflight(&self, target: &str, run_id: &str) -> Result<ContentHash, OrchestratorError> {
        let pipeline = self.pipeline.clone();
        let target = target.to_string();
        let run_id = run_id.to_string();
        let wait = self.config.lock_wait();
        blocking(move || -> Result<ContentHash, OrchestratorError> {
            if !pipeline.documents().exists(&target) {
                return Err(OrchestratorError::Preflight(format!(
                    "target {target} does not exist"
                )));
            }
            let (_, hash) = pipeline.documents().read(&target)?;
            pipeline.locks().acquire(&target, &run_id, wait)?.release()?;
            Ok(hash)
        })
        .await
    }

    async fn drive(
        &self,
        mut state: BridgeState,
        mut breaker: CircuitBreakerState,
    ) -> Result<RunResult, OrchestratorError> {
        let pause = Duration::from_millis(self.config.invocation.inter_iteration_pause_ms);
        let budget = Arc::new(RunBudget::new(
            self.config.budget.max_cost_micros,
            state.spent_micros(),
        ));
        loop {
            if self.cancel.is_cancelled() {
                return self.halt(state, breaker, HaltReason::Cancelled);
            }
            if let Some(reason) = breaker.wall_clock(&self.config.breaker, Utc::now()) {
                return self.halt(state, breaker, reason);
            }
            if let Some(limit_micros) = budget.limit_micros().filter(|_| budget.is_exhausted()) {
                let reason = HaltReason::BudgetExhausted {
                    spent_micros: budget.spent_micros(),
                    limit_micros,
                };
                return self.halt(state, breaker, reason);
            }

            let interrupted = self.iterate(&mut state, &mut breaker, &budget).await?;
            let verdict = match (interrupted, state.history.last()) {
                (Some(reason), _) => IterationVerdict::Halt(reason),
                (None, Some(record)) => evaluate(
                    &state,
                    &breaker,
                    record,
                    &self.config.breaker,
                    &self.config.convergence,
                    Utc::now(),
                ),
                (None, None) => IterationVerdict::Continue,
            };
            self.runs.save(&state, &breaker)?;

            match verdict {
                IterationVerdict::Continue => {
                    if !pause.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(pause) => {}
                            _ = self.cancel.cancelled() => {}
                        }
                    }
                }
                IterationVerdict::Finalize(reason) => {
                    return self.finalize(state, breaker, reason);
                }
                IterationVerdict::Halt(reason) => return self.halt(state, breaker, reason),
            }
        }
    }

    /// Run one iteration and fold it into `state` and `breaker`. Returns a
    /// halt reason when the iteration was cut short.
    async fn iterate(
        &self,
        state: &mut BridgeState,
        breaker: &mut CircuitBreakerState,
        budget: &Arc<RunBudget>,
    ) -> Result<Option<HaltReason>, OrchestratorError> {
        let iteration = state.iteration + 1;
        let clock = Instant::now();
        let started_at = Utc::now();

        let (content, baseline) = self.read_document(&state.target).await?;
        if baseline != state.current_hash {
            warn!(
                run_id = %state.run_id,
                document = %state.target,
                expected = %state.current_hash.short(),
                actual = %baseline.short(),
                "Document changed outside this run; reviewing current content"
            );
            state.current_hash = baseline.clone();
        }
        let mut record = IterationRecord::new(iteration, started_at, baseline.clone());
        let prior: Vec<String> = state
            .history
            .last()
            .map(|r| r.findings.iter().map(|f| f.summary.clone()).collect())
            .unwrap_or_default();

        let round = self
            .fanout
            .run(self.review_jobs(&state.target, &content, &prior), budget.clone());
        let reviews = match self.bounded(breaker, round).await {
            Ok(reviews) => reviews,
            Err(reason) => return Ok(Some(self.interrupted(state, iteration, reason))),
        };
        tally(&mut record, &reviews);
        telemetry::append_cost_ledger(&state.run_id, iteration, &reviews, &self.config.state_dir);

        let cross = if self.config.invocation.cross_score {
            let round = self.cross_score(&state.target, &content, &reviews, budget);
            let cross = match self.bounded(breaker, round).await {
                Ok(cross) => cross,
                Err(reason) => return Ok(Some(self.interrupted(state, iteration, reason))),
            };
            tally(&mut record, &cross);
            telemetry::append_cost_ledger(&state.run_id, iteration, &cross, &self.config.state_dir);
            cross
        } else {
            Vec::new()
        };

        let findings = assemble(&reviews, &cross, &state.thresholds, &baseline);
        record.set_findings(&findings);
        surface(state, &findings);

        let blocked = state.mode == RunMode::Autonomous
            && findings.iter().any(|f| f.category == Category::Blocker);
        let interrupted = if blocked {
            warn!(run_id = %state.run_id, iteration, "Blocker found; skipping integration");
            None
        } else {
            self.integrate_all(state, breaker, &mut record, &findings).await?
        };

        breaker.observe(&findings, record.integrated.len());
        record.duration_ms = clock.elapsed().as_millis() as u64;
        let flatlined = state.record_iteration(record, &self.config.convergence);
        if let Some(done) = state.history.last() {
            telemetry::emit_iteration(&state.run_id, done);
            info!(
                run_id = %state.run_id,
                iteration,
                findings = done.findings.len(),
                integrated = done.integrated.len(),
                severity = done.severity,
                severity_pct = done.severity_pct,
                flatlined,
                "Iteration complete"
            );
        }
        Ok(interrupted)
    }

    /// Run `round` unless the run is cancelled or its wall-clock budget
    /// runs out first. Dropping the round aborts its in-flight calls.
    async fn bounded<F: Future>(
        &self,
        breaker: &CircuitBreakerState,
        round: F,
    ) -> Result<F::Output, HaltReason> {
        let remaining = self
            .config
            .breaker
            .wall_clock()
            .saturating_sub(breaker.elapsed(Utc::now()));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HaltReason::Cancelled),
            _ = tokio::time::sleep(remaining) => Err(HaltReason::WallClockTimeout {
                elapsed_secs: breaker.elapsed(Utc::now()).as_secs(),
                budget_secs: self.config.breaker.wall_clock_secs,
            }),
            out = round => Ok(out),
        }
    }

    fn interrupted(&self, state: &BridgeState, iteration: u32, reason: HaltReason) -> HaltReason {
        warn!(
            run_id = %state.run_id,
            iteration,
            trigger = reason.label(),
            "Review round interrupted; iteration discarded"
        );
        reason
    }

    /// A job for `role` in `slot`, with the rest of the role's backends as
    /// fallbacks when enabled.
    fn job(&self, role: ReviewRole, slot: usize, request: ReviewRequest) -> Option<ReviewJob> {
        let mut chain = self.pool.chain_for_slot(role, slot).into_iter();
        let backend = chain.next()?;
        let fallbacks = if self.config.invocation.fallback {
            chain.collect()
        } else {
            Vec::new()
        };
        Some(ReviewJob {
            slot,
            backend,
            fallbacks,
            request,
        })
    }

    fn review_jobs(&self, target: &str, content: &str, prior: &[String]) -> Vec<ReviewJob> {
        let mut jobs = Vec::new();
        for slot in 0..self.config.invocation.reviewers {
            let request = ReviewRequest::new(target, content, ReviewRole::Reviewer)
                .with_prior_findings(prior.to_vec());
            jobs.extend(self.job(ReviewRole::Reviewer, slot, request));
            if self.config.invocation.skeptics {
                let request = ReviewRequest::new(target, content, ReviewRole::Skeptic);
                jobs.extend(self.job(ReviewRole::Skeptic, slot, request));
            }
        }
        jobs
    }

    /// Second round: every successful reviewer scores the proposals it did
    /// not vote on itself.
    async fn cross_score(
        &self,
        target: &str,
        content: &str,
        reviews: &[ReviewResult],
        budget: &Arc<RunBudget>,
    ) -> Vec<ReviewResult> {
        let candidates = collect_proposals(reviews);
        let voters: Vec<usize> = reviews
            .iter()
            .filter(|r| r.role == ReviewRole::Reviewer && r.is_success())
            .map(|r| r.slot)
            .collect();
        if candidates.is_empty() || voters.len() < 2 {
            return Vec::new();
        }

        let mut jobs = Vec::new();
        for slot in voters {
            let lines: Vec<String> = candidates
                .iter()
                .filter(|c| !c.scores.iter().any(|s| s.slot == slot))
                .map(prompts::proposal_line)
                .collect();
            if lines.is_empty() {
                continue;
            }
            let request =
                ReviewRequest::new(target, content, ReviewRole::Scorer).with_prior_findings(lines);
            jobs.extend(self.job(ReviewRole::Scorer, slot, request));
        }
        self.fanout.run(jobs, budget.clone()).await
    }

    async fn integrate_all(
        &self,
        state: &mut BridgeState,
        breaker: &CircuitBreakerState,
        record: &mut IterationRecord,
        findings: &[Finding],
    ) -> Result<Option<HaltReason>, OrchestratorError> {
        let mut expected = record.baseline_hash.clone();
        for finding in findings.iter().filter(|f| f.category.is_auto_integrable()) {
            if state.was_integrated(&finding.id) {
                debug!(finding = %finding.id.short(), "Already integrated; skipping");
                continue;
            }
            if finding.edit.is_none() {
                info!(
                    finding = %finding.id.short(),
                    summary = %finding.summary(),
                    "High-consensus finding has no edit; left for human review"
                );
                continue;
            }
            if self.cancel.is_cancelled() {
                return Ok(Some(HaltReason::Cancelled));
            }
            if let Some(reason) = breaker.wall_clock(&self.config.breaker, Utc::now()) {
                return Ok(Some(reason));
            }

            let pipeline = self.pipeline.clone();
            let run_id = state.run_id.clone();
            let target = state.target.clone();
            let owned = finding.clone();
            let expect = expected.clone();
            let iteration = record.iteration;
            let outcome = tokio::task::spawn_blocking(move || {
                pipeline.integrate(&run_id, iteration, &target, &owned, &expect)
            })
            .await
            .map_err(|e| OrchestratorError::Join(e.to_string()))?;

            match outcome {
                Ok(manifest) => {
                    info!(
                        run_id = %state.run_id,
                        finding = %finding.id.short(),
                        manifest = %manifest.manifest_id,
                        post_hash = %manifest.post_hash.short(),
                        "Integrated finding"
                    );
                    expected = manifest.post_hash.clone();
                    state.current_hash = manifest.post_hash;
                    record.integrated.push(IntegratedFinding {
                        finding_id: finding.id.clone(),
                        manifest_id: manifest.manifest_id,
                        iteration,
                        summary: finding.summary(),
                    });
                }
                Err(e) => {
                    warn!(
                        run_id = %state.run_id,
                        finding = %finding.id.short(),
                        anomaly = %e.anomaly(),
                        rereview = e.needs_rereview(),
                        error = %e,
                        "Integration aborted"
                    );
                    record.anomalies.push(Anomaly {
                        kind: e.anomaly(),
                        finding_id: Some(finding.id.clone()),
                        message: e.to_string(),
                    });
                    if e.is_unrecovered() {
                        return Ok(Some(HaltReason::IntegrityFailure {
                            message: e.to_string(),
                        }));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn read_document(&self, target: &str) -> Result<(String, ContentHash), OrchestratorError> {
        let pipeline = self.pipeline.clone();
        let target = target.to_string();
        blocking(move || pipeline.documents().read(&target)).await
    }

    fn finalize(
        &self,
        mut state: BridgeState,
        breaker: CircuitBreakerState,
        reason: FinalizeReason,
    ) -> Result<RunResult, OrchestratorError> {
        if state.phase == BridgePhase::Iterating {
            state.transition(BridgePhase::Finalizing, &reason.to_string())?;
        }
        state.finalize_reason = Some(reason);
        self.runs.save(&state, &breaker)?;
        info!(run_id = %state.run_id, %reason, iterations = state.iteration, "Run finalizing");

        // Persisted as FINALIZING until the summary is on disk, so a crash
        // here resumes into finalization.
        state.transition(BridgePhase::JackedOut, "summary written")?;
        let summary = RunSummary::from_state(&state, &breaker, Utc::now());
        let artifacts = self.write_summary(&summary)?;
        self.runs.save(&state, &breaker)?;
        telemetry::append_run_summary(&summary, &self.config.state_dir);

        Ok(RunResult {
            run_id: state.run_id.clone(),
            phase: state.phase,
            summary,
            escalation: None,
            artifacts,
        })
    }

    fn halt(
        &self,
        mut state: BridgeState,
        mut breaker: CircuitBreakerState,
        reason: HaltReason,
    ) -> Result<RunResult, OrchestratorError> {
        breaker.trip(state.iteration, reason.clone());
        state.halt_reason = Some(reason.clone());
        state.transition(BridgePhase::Halted, reason.label())?;
        self.runs.save(&state, &breaker)?;
        warn!(
            run_id = %state.run_id,
            trigger = reason.label(),
            reason = %reason,
            "Run halted"
        );

        let manifests = self.pipeline.manifests().for_run(&state.run_id)?;
        let escalation = EscalationReport::build(&state, &manifests, DEFAULT_LAST_FINDINGS);
        let summary = RunSummary::from_state(&state, &breaker, Utc::now());
        let mut artifacts = self.write_summary(&summary)?;
        if let Some(report) = &escalation {
            artifacts.push(
                self.runs
                    .write_artifact(&state.run_id, "escalation.md", &report.to_markdown())?,
            );
            artifacts.push(
                self.runs
                    .write_artifact(&state.run_id, "escalation.json", &report.to_json()?)?,
            );
        }
        telemetry::append_run_summary(&summary, &self.config.state_dir);

        Ok(RunResult {
            run_id: state.run_id.clone(),
            phase: state.phase,
            summary,
            escalation,
            artifacts,
        })
    }

    fn write_summary(&self, summary: &RunSummary) -> Result<Vec<PathBuf>, OrchestratorError> {
        Ok(vec![
            self.runs
                .write_artifact(&summary.run_id, "summary.json", &summary.to_json()?)?,
            self.runs
                .write_artifact(&summary.run_id, "summary.txt", &summary.narrative())?,
        ])
    }
}

/// Count role outcomes, meter spend, and keep every final invocation error.
fn tally(record: &mut IterationRecord, results: &[ReviewResult]) {
    for r in results {
        record.usage += r.usage;
        record.cost_micros += r.cost_micros;
        match (r.role, r.is_success()) {
            (ReviewRole::Reviewer, true) => record.reviewers_ok += 1,
            (ReviewRole::Reviewer, false) => record.reviewers_failed += 1,
            (ReviewRole::Skeptic, true) => record.skeptics_ok += 1,
            _ => {}
        }
        if let Some(e) = r.error() {
            record
                .invocation_errors
                .push(format!("{}[{}]@{}: {e}", r.role, r.slot, r.backend));
        }
    }
}

/// Log disputed findings and surface interactive-mode blockers.
fn surface(state: &mut BridgeState, findings: &[Finding]) {
    for f in findings {
        match f.category {
            Category::Disputed => info!(
                run_id = %state.run_id,
                finding = %f.id.short(),
                summary = %f.summary(),
                "Disputed finding left for human review"
            ),
            Category::Blocker => {
                warn!(
                    run_id = %state.run_id,
                    mode = %state.mode,
                    finding = %f.id.short(),
                    concern = f.skeptic_note.as_deref().unwrap_or(""),
                    "Blocker found"
                );
                if state.mode == RunMode::Interactive
                    && !state.surfaced_blockers.iter().any(|b| b.id == f.id)
                {
                    state.surfaced_blockers.push(FindingDigest::from(f));
                }
            }
            _ => {}
        }
    }
}

async fn blocking<T, E, F>(f: F) -> Result<T, OrchestratorError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<OrchestratorError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OrchestratorError::Join(e.to_string()))?
        .map_err(Into::into)
}
