//! End-to-end run lifecycle with scripted backends (no network).
//!
//! Covers: preflight → iterations → integration → breaker halt →
//! escalation report → manifest rollback, plus flatline finalization,
//! cancellation, the wall-clock budget, and resume rules.

mod common;

use std::time::{Duration, Instant};

use common::*;
use flatline_bridge::{OrchestratorError, RunOptions};
use flatline_coordination::bridge::{
    BridgePhase, FinalizeReason, HaltReason, PersistenceError, RunMode,
};
use flatline_coordination::ReviewRole;
use tempfile::tempdir;

#[tokio::test]
async fn test_recurring_finding_halts_and_rolls_back() {
    let dir = tempdir().unwrap();
    let alpha = ScriptedBackend::fixed("alpha", storage_proposal());
    let orch = orchestrator(
        dir.path(),
        config(dir.path()),
        pool(&[(alpha.clone(), vec![ReviewRole::Reviewer])]),
    );

    let result = orch
        .run(RunOptions::new("prd.md", RunMode::Interactive, 5))
        .await
        .unwrap();

    // Integrated once, then seen again in iterations 2 and 3 without change.
    assert_eq!(result.phase, BridgePhase::Halted);
    assert!(!result.is_success());
    assert!(matches!(
        result.summary.halt_reason,
        Some(HaltReason::SameIssue { occurrences: 3, .. })
    ));
    assert_eq!(alpha.calls(), 6);
    let integrated: Vec<_> = result.summary.iterations.iter().map(|i| i.integrated).collect();
    assert_eq!(integrated, vec![1, 0, 0]);
    assert!(read_doc(dir.path()).contains("Storage engine: PostgreSQL 16"));

    let escalation = result.escalation.as_ref().unwrap();
    assert_eq!(escalation.halted_at_iteration, 3);
    assert_eq!(escalation.rollback.len(), 1);
    let step = &escalation.rollback[0];
    assert_eq!(step.manifest_id, result.summary.integrated[0].manifest_id);
    assert_eq!(step.pre_hash, result.summary.start_hash);
    assert_eq!(step.command, format!("flatline rollback --manifest {}", step.manifest_id));
    assert!(escalation.to_markdown().contains(&step.command));

    for artifact in &result.artifacts {
        assert!(artifact.exists(), "missing {}", artifact.display());
    }
    assert!(result
        .artifacts
        .iter()
        .any(|p| p.to_string_lossy().ends_with(".escalation.md")));

    let outcome = orch.rollback(step.manifest_id).await.unwrap();
    assert_eq!(outcome.restored_hash, result.summary.start_hash);
    assert_eq!(read_doc(dir.path()), DOC);
}

#[tokio::test]
async fn test_quiet_reviews_flatline_and_finalize() {
    let dir = tempdir().unwrap();
    let proposal = storage_proposal();
    // Two slots share the backend: calls 0 and 1 are iteration 1.
    let alpha = ScriptedBackend::new("alpha", move |_, n| {
        Ok(if n < 2 {
            proposal.clone()
        } else {
            r#"{"findings": []}"#.to_string()
        })
    });
    let orch = orchestrator(
        dir.path(),
        config(dir.path()),
        pool(&[(alpha, vec![ReviewRole::Reviewer])]),
    );

    let result = orch
        .run(RunOptions::new("prd.md", RunMode::Autonomous, 5))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.summary.finalize_reason, Some(FinalizeReason::Flatline));
    assert_eq!(result.summary.iterations.len(), 3);
    assert!(result.escalation.is_none());
    assert_ne!(result.summary.final_hash, result.summary.start_hash);
    assert!(read_doc(dir.path()).contains("PostgreSQL 16"));

    let record = orch.status(&result.run_id).unwrap();
    assert_eq!(record.bridge.phase, BridgePhase::JackedOut);
    assert!(matches!(
        orch.resume(&result.run_id).await,
        Err(OrchestratorError::NotResumable { .. })
    ));
}

#[tokio::test]
async fn test_quiet_first_iteration_does_not_fix_a_zero_baseline() {
    let dir = tempdir().unwrap();
    let proposal = storage_proposal();
    // Iteration 1 is quiet (calls 0-1), iteration 2 proposes (calls 2-3),
    // then quiet again.
    let alpha = ScriptedBackend::new("alpha", move |_, n| {
        Ok(if (2..4).contains(&n) {
            proposal.clone()
        } else {
            r#"{"findings": []}"#.to_string()
        })
    });
    let orch = orchestrator(
        dir.path(),
        config(dir.path()),
        pool(&[(alpha, vec![ReviewRole::Reviewer])]),
    );

    let result = orch
        .run(RunOptions::new("prd.md", RunMode::Autonomous, 10))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.summary.finalize_reason, Some(FinalizeReason::Flatline));
    let iterations = &result.summary.iterations;
    assert_eq!(iterations.len(), 4);
    assert_eq!(iterations[1].counts.high_consensus, 1);
    assert_eq!(iterations[1].severity_pct, 100.0);
    assert_eq!(iterations[1].integrated, 1);
    assert!(read_doc(dir.path()).contains("PostgreSQL 16"));
}

#[tokio::test]
async fn test_cancelled_before_first_iteration() {
    let dir = tempdir().unwrap();
    let alpha = ScriptedBackend::fixed("alpha", storage_proposal());
    let orch = orchestrator(
        dir.path(),
        config(dir.path()),
        pool(&[(alpha.clone(), vec![ReviewRole::Reviewer])]),
    );
    orch.cancellation_token().cancel();

    let result = orch
        .run(RunOptions::new("prd.md", RunMode::Interactive, 3))
        .await
        .unwrap();

    assert_eq!(result.phase, BridgePhase::Halted);
    assert_eq!(result.summary.halt_reason, Some(HaltReason::Cancelled));
    assert_eq!(alpha.calls(), 0);
    assert_eq!(read_doc(dir.path()), DOC);
    assert!(result.escalation.unwrap().rollback.is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_inflight_reviews() {
    let dir = tempdir().unwrap();
    let alpha = ScriptedBackend::slow("alpha", Duration::from_secs(30), storage_proposal());
    let orch = orchestrator(
        dir.path(),
        config(dir.path()),
        pool(&[(alpha.clone(), vec![ReviewRole::Reviewer])]),
    );
    let cancel = orch.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let clock = Instant::now();
    let result = orch
        .run(RunOptions::new("prd.md", RunMode::Interactive, 3))
        .await
        .unwrap();

    assert!(clock.elapsed() < Duration::from_secs(5));
    assert_eq!(result.summary.halt_reason, Some(HaltReason::Cancelled));
    assert!(alpha.calls() >= 1);
    assert!(result.summary.iterations.is_empty());
    assert_eq!(read_doc(dir.path()), DOC);
}

#[tokio::test]
async fn test_wall_clock_budget_cuts_slow_reviews_short() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.breaker.wall_clock_secs = 1;
    let alpha = ScriptedBackend::slow("alpha", Duration::from_secs(30), storage_proposal());
    let orch = orchestrator(
        dir.path(),
        cfg,
        pool(&[(alpha, vec![ReviewRole::Reviewer])]),
    );

    let clock = Instant::now();
    let result = orch
        .run(RunOptions::new("prd.md", RunMode::Autonomous, 3))
        .await
        .unwrap();

    assert!(clock.elapsed() < Duration::from_secs(4));
    assert_eq!(result.phase, BridgePhase::Halted);
    assert!(matches!(
        result.summary.halt_reason,
        Some(HaltReason::WallClockTimeout { budget_secs: 1, .. })
    ));
    assert!(result.summary.iterations.is_empty());
    assert_eq!(read_doc(dir.path()), DOC);
}

#[tokio::test]
async fn test_spent_wall_clock_halts_before_any_call() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.breaker.wall_clock_secs = 0;
    let alpha = ScriptedBackend::fixed("alpha", storage_proposal());
    let orch = orchestrator(
        dir.path(),
        cfg,
        pool(&[(alpha.clone(), vec![ReviewRole::Reviewer])]),
    );

    let result = orch
        .run(RunOptions::new("prd.md", RunMode::Interactive, 3))
        .await
        .unwrap();

    assert!(matches!(
        result.summary.halt_reason,
        Some(HaltReason::WallClockTimeout { budget_secs: 0, .. })
    ));
    assert_eq!(alpha.calls(), 0);
}

#[tokio::test]
async fn test_missing_target_fails_preflight() {
    let dir = tempdir().unwrap();
    let alpha = ScriptedBackend::fixed("alpha", storage_proposal());
    let orch = orchestrator(
        dir.path(),
        config(dir.path()),
        pool(&[(alpha, vec![ReviewRole::Reviewer])]),
    );

    let err = orch
        .run(RunOptions::new("missing.md", RunMode::Interactive, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Preflight(_)));
}

#[tokio::test]
async fn test_path_like_run_id_is_rejected_before_any_write() {
    let dir = tempdir().unwrap();
    let alpha = ScriptedBackend::fixed("alpha", storage_proposal());
    let orch = orchestrator(
        dir.path(),
        config(dir.path()),
        pool(&[(alpha.clone(), vec![ReviewRole::Reviewer])]),
    );
    let mut opts = RunOptions::new("prd.md", RunMode::Interactive, 3);
    opts.run_id = Some("../../escaped".to_string());

    let err = orch.run(opts).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Persistence(PersistenceError::InvalidRunId(_))
    ));
    assert_eq!(alpha.calls(), 0);
    assert!(!dir.path().join("escaped.json").exists());
    assert!(matches!(
        orch.status("../prd"),
        Err(OrchestratorError::Persistence(PersistenceError::InvalidRunId(_)))
    ));
}

#[tokio::test]
async fn test_zero_depth_is_rejected() {
    let dir = tempdir().unwrap();
    let alpha = ScriptedBackend::fixed("alpha", storage_proposal());
    let orch = orchestrator(
        dir.path(),
        config(dir.path()),
        pool(&[(alpha, vec![ReviewRole::Reviewer])]),
    );

    assert!(matches!(
        orch.run(RunOptions::new("prd.md", RunMode::Interactive, 0)).await,
        Err(OrchestratorError::InvalidDepth)
    ));
}

#[test]
fn test_skeptics_require_a_skeptic_backend() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.invocation.skeptics = true;
    let alpha = ScriptedBackend::fixed("alpha", storage_proposal());
    let err = flatline_bridge::Orchestrator::new(
        cfg,
        pool(&[(alpha, vec![ReviewRole::Reviewer])]),
        std::sync::Arc::new(flatline_coordination::integration::FsDocumentStore::rooted(
            dir.path(),
        )),
    )
    .err()
    .unwrap();
    assert!(matches!(
        err,
        OrchestratorError::MissingBackend(ReviewRole::Skeptic)
    ));
}
