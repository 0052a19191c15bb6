//! The atomic integration pipeline and rollback.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::document::{DocumentError, DocumentStore};
use super::lock::{LockError, LockManager};
use super::manifest::{IntegrationManifest, ManifestError, ManifestStore};
use super::snapshot::{RetentionPolicy, SnapshotError, SnapshotRef, SnapshotStore};
use crate::consensus::{Finding, FindingId};
use crate::digest::ContentHash;
use crate::review::ProposedEdit;

/// Transaction step, for logs and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxPhase {
    Lock,
    VerifyHash,
    Snapshot,
    Integrate,
    RecordManifest,
    Release,
}

impl std::fmt::Display for TxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lock => write!(f, "LOCK"),
            Self::VerifyHash => write!(f, "VERIFY_HASH"),
            Self::Snapshot => write!(f, "SNAPSHOT"),
            Self::Integrate => write!(f, "INTEGRATE"),
            Self::RecordManifest => write!(f, "RECORD_MANIFEST"),
            Self::Release => write!(f, "RELEASE"),
        }
    }
}

/// How an aborted transaction is reported in the iteration log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Hash mismatch, snapshot/restore failure, rejected edit.
    Integrity,
    /// Lock timeout, snapshot quota.
    Resource,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integrity => write!(f, "integrity"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("finding {0} carries no edit to apply")]
    NoEdit(FindingId),
    #[error("could not lock target: {0}")]
    Lock(#[from] LockError),
    #[error("target changed since review: expected {expected}, found {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("document error during {phase}: {source}")]
    Document {
        phase: TxPhase,
        #[source]
        source: DocumentError,
    },
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("edit rejected: {0}")]
    EditRejected(String),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("{phase} failed ({cause}) and restoring snapshot {snapshot} also failed: {restore_error}")]
    RestoreFailed {
        phase: TxPhase,
        snapshot: String,
        cause: String,
        restore_error: String,
    },
    #[error("rollback verification failed: expected {expected}, found {actual}")]
    RollbackMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
}

impl IntegrationError {
    pub fn anomaly(&self) -> AnomalyKind {
        match self {
            Self::Lock(_) | Self::Snapshot(SnapshotError::QuotaExhausted { .. }) => {
                AnomalyKind::Resource
            }
            _ => AnomalyKind::Integrity,
        }
    }

    /// The target may be left mutated; the run must not continue.
    pub fn is_unrecovered(&self) -> bool {
        matches!(self, Self::RestoreFailed { .. } | Self::RollbackMismatch { .. })
    }

    /// The finding is stale and should be re-reviewed against current content.
    pub fn needs_rereview(&self) -> bool {
        matches!(self, Self::HashMismatch { .. } | Self::EditRejected(_))
    }
}

/// Apply an anchored edit to `content`.
pub fn apply_edit(content: &str, edit: &ProposedEdit) -> Result<String, IntegrationError> {
    if edit.anchor.is_empty() {
        let mut out = content.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&edit.replacement);
        return Ok(out);
    }
    match content.find(&edit.anchor) {
        Some(at) => {
            let mut out = String::with_capacity(content.len() + edit.replacement.len());
            out.push_str(&content[..at]);
            out.push_str(&edit.replacement);
            out.push_str(&content[at + edit.anchor.len()..]);
            if out == content {
                return Err(IntegrationError::EditRejected(
                    "edit does not change the document".to_string(),
                ));
            }
            Ok(out)
        }
        None => Err(IntegrationError::EditRejected(format!(
            "anchor not found: {:?}",
            truncate(&edit.anchor, 60)
        ))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Result of rolling back a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub manifest_id: Uuid,
    pub target: String,
    /// Content hash that was replaced.
    pub replaced_hash: ContentHash,
    /// Equals the manifest's pre-hash.
    pub restored_hash: ContentHash,
}

/// Owns snapshots and manifests; serializes mutations through the lock.
#[derive(Clone)]
pub struct IntegrationPipeline {
    documents: Arc<dyn DocumentStore>,
    locks: LockManager,
    snapshots: SnapshotStore,
    manifests: ManifestStore,
    lock_wait: Duration,
}

impl IntegrationPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        state_dir: &Path,
        retention: RetentionPolicy,
        lock_stale_after: Duration,
        lock_wait: Duration,
    ) -> Result<Self, IntegrationError> {
        Ok(Self {
            documents,
            locks: LockManager::new(state_dir, lock_stale_after)?,
            snapshots: SnapshotStore::new(state_dir, retention)?,
            manifests: ManifestStore::new(state_dir)?,
            lock_wait,
        })
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Apply one finding as an independent transaction.
    ///
    /// `expected` is the hash the finding is valid against: its baseline, or
    /// the post-hash of the previous commit in the same iteration.
    pub fn integrate(
        &self,
        run_id: &str,
        iteration: u32,
        target: &str,
        finding: &Finding,
        expected: &ContentHash,
    ) -> Result<IntegrationManifest, IntegrationError> {
        let edit = finding
            .edit
            .as_ref()
            .ok_or_else(|| IntegrationError::NoEdit(finding.id.clone()))?;

        let lock = self.locks.acquire(target, run_id, self.lock_wait)?;
        let result = self.locked_transaction(run_id, iteration, target, finding, edit, expected);

        if let Err(e) = lock.release() {
            // After commit the transaction stands; the stale check cleans up.
            warn!(
                document = %target,
                phase = %TxPhase::Release,
                committed = result.is_ok(),
                error = %e,
                "Lock release failed"
            );
        }
        result
    }

    fn locked_transaction(
        &self,
        run_id: &str,
        iteration: u32,
        target: &str,
        finding: &Finding,
        edit: &ProposedEdit,
        expected: &ContentHash,
    ) -> Result<IntegrationManifest, IntegrationError> {
        let (content, pre_hash) =
            self.documents
                .read(target)
                .map_err(|source| IntegrationError::Document {
                    phase: TxPhase::VerifyHash,
                    source,
                })?;
        if &pre_hash != expected {
            return Err(IntegrationError::HashMismatch {
                expected: expected.clone(),
                actual: pre_hash,
            });
        }

        let referenced = self.manifests.referenced_snapshots(target)?;
        let snapshot = self.snapshots.create(target, &content, &referenced)?;

        match self.mutate_and_commit(run_id, iteration, target, finding, edit, &content, &snapshot) {
            Ok(manifest) => {
                info!(
                    run_id,
                    iteration,
                    document = %target,
                    manifest = %manifest.manifest_id,
                    finding = %finding.id.short(),
                    pre = %manifest.pre_hash.short(),
                    post = %manifest.post_hash.short(),
                    "Finding integrated"
                );
                Ok(manifest)
            }
            Err((phase, err)) => {
                warn!(
                    document = %target,
                    %phase,
                    error = %err,
                    snapshot = %snapshot.id,
                    "Transaction failed after snapshot; restoring"
                );
                match self.snapshots.restore(&snapshot, self.documents.as_ref()) {
                    Ok(_) => Err(err),
                    Err(restore_err) => Err(IntegrationError::RestoreFailed {
                        phase,
                        snapshot: snapshot.id.to_string(),
                        cause: err.to_string(),
                        restore_error: restore_err.to_string(),
                    }),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn mutate_and_commit(
        &self,
        run_id: &str,
        iteration: u32,
        target: &str,
        finding: &Finding,
        edit: &ProposedEdit,
        content: &str,
        snapshot: &SnapshotRef,
    ) -> Result<IntegrationManifest, (TxPhase, IntegrationError)> {
        let updated = apply_edit(content, edit).map_err(|e| (TxPhase::Integrate, e))?;
        let post_hash = self.documents.write_atomic(target, &updated).map_err(|source| {
            (
                TxPhase::Integrate,
                IntegrationError::Document {
                    phase: TxPhase::Integrate,
                    source,
                },
            )
        })?;

        let manifest = IntegrationManifest {
            manifest_id: Uuid::new_v4(),
            run_id: run_id.to_string(),
            iteration,
            target: target.to_string(),
            finding_ids: vec![finding.id.clone()],
            summaries: vec![finding.summary()],
            snapshot: snapshot.clone(),
            pre_hash: snapshot.content_hash.clone(),
            post_hash,
            committed_at: Utc::now(),
        };
        self.manifests
            .record(&manifest)
            .map_err(|e| (TxPhase::RecordManifest, e.into()))?;
        Ok(manifest)
    }

    fn restore_locked(
        &self,
        manifest: &IntegrationManifest,
    ) -> Result<RollbackOutcome, IntegrationError> {
        let (_, replaced_hash) =
            self.documents
                .read(&manifest.target)
                .map_err(|source| IntegrationError::Document {
                    phase: TxPhase::VerifyHash,
                    source,
                })?;
        let restored_hash = self
            .snapshots
            .restore(&manifest.snapshot, self.documents.as_ref())?;
        if restored_hash != manifest.pre_hash {
            return Err(IntegrationError::RollbackMismatch {
                expected: manifest.pre_hash.clone(),
                actual: restored_hash,
            });
        }
        Ok(RollbackOutcome {
            manifest_id: manifest.manifest_id,
            target: manifest.target.clone(),
            replaced_hash,
            restored_hash,
        })
    }

    /// Restore the pre-image recorded by `manifest_id` and verify the
    /// result hashes to the manifest's pre-hash.
    pub fn rollback(&self, manifest_id: Uuid, run_id: &str) -> Result<RollbackOutcome, IntegrationError> {
        let manifest = self.manifests.load(manifest_id)?;
        let lock = self.locks.acquire(&manifest.target, run_id, self.lock_wait)?;

        let result = self.restore_locked(&manifest);

        if let Err(e) = lock.release() {
            warn!(document = %manifest.target, error = %e, "Lock release failed after rollback");
        }
        if let Ok(outcome) = &result {
            info!(
                manifest = %manifest_id,
                document = %outcome.target,
                restored = %outcome.restored_hash.short(),
                "Rolled back"
            );
        }
        result
    }
}
