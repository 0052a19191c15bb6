//! Integration pipeline through the public API: chained transactions,
//! rollback ordering, stale findings, lock contention, and snapshot
//! retention around manifest-referenced snapshots.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flatline_coordination::consensus::{Category, Finding, FindingId, ProposalKey};
use flatline_coordination::integration::{
    AnomalyKind, DocumentStore, FsDocumentStore, IntegrationError, IntegrationPipeline,
    RetentionPolicy,
};
use flatline_coordination::review::ProposedEdit;
use flatline_coordination::ContentHash;
use tempfile::tempdir;

const TARGET: &str = "prd.md";
const ORIGINAL: &str = "# PRD\n\nLatency: TBD\nStorage: TBD\nOwner: TBD\n";

fn finding(location: &str, anchor: &str, replacement: &str, baseline: &ContentHash) -> Finding {
    let edit = ProposedEdit {
        anchor: anchor.into(),
        replacement: replacement.into(),
    };
    let description = format!("fill in {location}");
    Finding {
        id: FindingId::compute(Category::HighConsensus, location, &description, Some(&edit)),
        proposal_key: ProposalKey::compute(location, &description, Some(&edit)),
        category: Category::HighConsensus,
        location: location.into(),
        description,
        edit: Some(edit),
        scores: vec![],
        skeptic_score: None,
        skeptic_note: None,
        baseline_hash: baseline.clone(),
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    docs: Arc<FsDocumentStore>,
    pipeline: IntegrationPipeline,
}

impl Fixture {
    fn new(retention: RetentionPolicy) -> (Self, ContentHash) {
        let dir = tempdir().unwrap();
        let docs = Arc::new(FsDocumentStore::rooted(dir.path()));
        let h0 = docs.write_atomic(TARGET, ORIGINAL).unwrap();
        let pipeline = pipeline(dir.path(), docs.clone(), retention);
        (
            Self {
                _dir: dir,
                docs,
                pipeline,
            },
            h0,
        )
    }

    fn content(&self) -> String {
        self.docs.read(TARGET).unwrap().0
    }
}

fn pipeline(dir: &Path, docs: Arc<FsDocumentStore>, retention: RetentionPolicy) -> IntegrationPipeline {
    IntegrationPipeline::new(
        docs,
        &dir.join("state"),
        retention,
        Duration::from_secs(600),
        Duration::from_millis(150),
    )
    .unwrap()
}

#[test]
fn test_chained_integrations_roll_back_newest_first() {
    let (fx, h0) = Fixture::new(RetentionPolicy::default());

    let m1 = fx
        .pipeline
        .integrate("run-a", 1, TARGET, &finding("Latency", "Latency: TBD", "Latency: p95 < 200ms", &h0), &h0)
        .unwrap();
    // Second finding was reviewed against h0 but is valid against m1's post-image.
    let m2 = fx
        .pipeline
        .integrate(
            "run-a",
            1,
            TARGET,
            &finding("Storage", "Storage: TBD", "Storage: PostgreSQL", &h0),
            &m1.post_hash,
        )
        .unwrap();
    assert_eq!(m2.pre_hash, m1.post_hash);
    assert!(fx.content().contains("p95 < 200ms"));
    assert!(fx.content().contains("PostgreSQL"));

    let manifests = fx.pipeline.manifests().for_run("run-a").unwrap();
    assert_eq!(manifests.len(), 2);
    assert!(fx.pipeline.manifests().for_run("run-b").unwrap().is_empty());

    let undo2 = fx.pipeline.rollback(m2.manifest_id, "operator").unwrap();
    assert_eq!(undo2.replaced_hash, m2.post_hash);
    assert_eq!(undo2.restored_hash, m1.post_hash);

    let undo1 = fx.pipeline.rollback(m1.manifest_id, "operator").unwrap();
    assert_eq!(undo1.restored_hash, h0);
    assert_eq!(fx.content(), ORIGINAL);
    assert!(fx.pipeline.locks().holder(TARGET).unwrap().is_none());
}

#[test]
fn test_out_of_band_edit_aborts_without_mutation() {
    let (fx, h0) = Fixture::new(RetentionPolicy::default());
    let edited = fx
        .docs
        .write_atomic(TARGET, "# PRD\n\nLatency: TBD\nStorage: TBD\nOwner: platform team\n")
        .unwrap();

    let err = fx
        .pipeline
        .integrate("run-a", 1, TARGET, &finding("Latency", "Latency: TBD", "Latency: 1s", &h0), &h0)
        .unwrap_err();

    assert!(matches!(err, IntegrationError::HashMismatch { .. }));
    assert!(err.needs_rereview());
    assert!(!err.is_unrecovered());
    assert_eq!(err.anomaly(), AnomalyKind::Integrity);
    assert_eq!(fx.docs.read(TARGET).unwrap().1, edited);
    assert!(fx.pipeline.manifests().for_run("run-a").unwrap().is_empty());
}

#[test]
fn test_missing_anchor_restores_snapshot() {
    let (fx, h0) = Fixture::new(RetentionPolicy::default());

    let err = fx
        .pipeline
        .integrate("run-a", 1, TARGET, &finding("Budget", "Budget: TBD", "Budget: $40k", &h0), &h0)
        .unwrap_err();

    assert!(matches!(err, IntegrationError::EditRejected(_)));
    assert_eq!(fx.content(), ORIGINAL);
    assert!(fx.pipeline.manifests().list().unwrap().is_empty());
}

#[test]
fn test_lock_contention_times_out_then_succeeds() {
    let (fx, h0) = Fixture::new(RetentionPolicy::default());
    let f = finding("Owner", "Owner: TBD", "Owner: payments", &h0);

    let held = fx
        .pipeline
        .locks()
        .try_acquire(TARGET, "run-other")
        .unwrap()
        .unwrap();
    assert_eq!(
        fx.pipeline.locks().holder(TARGET).unwrap().unwrap().run_id,
        "run-other"
    );

    let err = fx.pipeline.integrate("run-a", 1, TARGET, &f, &h0).unwrap_err();
    assert!(matches!(err, IntegrationError::Lock(_)));
    assert_eq!(err.anomaly(), AnomalyKind::Resource);
    assert_eq!(fx.content(), ORIGINAL);

    held.release().unwrap();
    let manifest = fx.pipeline.integrate("run-a", 1, TARGET, &f, &h0).unwrap();
    assert_eq!(manifest.finding_ids, vec![f.id.clone()]);
    assert!(fx.content().contains("Owner: payments"));
}

#[test]
fn test_retention_never_evicts_referenced_snapshots() {
    let (fx, h0) = Fixture::new(RetentionPolicy {
        max_count: 2,
        ..Default::default()
    });

    let mut expected = h0.clone();
    let mut manifests = Vec::new();
    for (location, anchor, replacement) in [
        ("Latency", "Latency: TBD", "Latency: 1s"),
        ("Storage", "Storage: TBD", "Storage: S3"),
        ("Owner", "Owner: TBD", "Owner: infra"),
    ] {
        let m = fx
            .pipeline
            .integrate("run-a", 1, TARGET, &finding(location, anchor, replacement, &h0), &expected)
            .unwrap();
        expected = m.post_hash.clone();
        manifests.push(m);
    }

    // Over the soft limit: every snapshot backs a manifest.
    let snapshots = fx.pipeline.snapshots().list(TARGET).unwrap();
    assert_eq!(snapshots.len(), 3);

    let referenced = fx.pipeline.manifests().referenced_snapshots(TARGET).unwrap();
    let loose_a = fx.pipeline.snapshots().create(TARGET, "draft a", &referenced).unwrap();
    let loose_b = fx.pipeline.snapshots().create(TARGET, "draft b", &referenced).unwrap();

    let ids: Vec<_> = fx
        .pipeline
        .snapshots()
        .list(TARGET)
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    for m in &manifests {
        assert!(ids.contains(&m.snapshot.id));
    }
    assert!(!ids.contains(&loose_a.id));
    assert!(ids.contains(&loose_b.id));

    // Every manifest can still be rolled back, newest first.
    for m in manifests.iter().rev() {
        fx.pipeline.rollback(m.manifest_id, "operator").unwrap();
    }
    assert_eq!(fx.content(), ORIGINAL);
}
