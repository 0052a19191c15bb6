//! Integration manifests: the durable commit record of a transaction.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::atomic::create_atomic;
use super::snapshot::{SnapshotId, SnapshotRef};
use crate::consensus::FindingId;
use crate::digest::ContentHash;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest {0} not found")]
    NotFound(Uuid),
    #[error("manifest {0} already exists")]
    AlreadyExists(Uuid),
    #[error("manifest I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("manifest encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Record of one committed transaction. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationManifest {
    pub manifest_id: Uuid,
    pub run_id: String,
    pub iteration: u32,
    pub target: String,
    pub finding_ids: Vec<FindingId>,
    /// Human-readable one-liners for the applied findings.
    #[serde(default)]
    pub summaries: Vec<String>,
    /// Pre-image to restore on rollback.
    pub snapshot: SnapshotRef,
    pub pre_hash: ContentHash,
    pub post_hash: ContentHash,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(state_dir: &Path) -> Result<Self, ManifestError> {
        let dir = state_dir.join("manifests");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Durably write a new manifest. This is the transaction commit point.
    pub fn record(&self, manifest: &IntegrationManifest) -> Result<(), ManifestError> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        match create_atomic(&self.path(manifest.manifest_id), &bytes) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(ManifestError::AlreadyExists(manifest.manifest_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(&self, id: Uuid) -> Result<IntegrationManifest, ManifestError> {
        match fs::read(self.path(id)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ManifestError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Every manifest, oldest commit first.
    pub fn list(&self) -> Result<Vec<IntegrationManifest>, ManifestError> {
        let mut manifests = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            manifests.push(serde_json::from_slice::<IntegrationManifest>(&fs::read(&path)?)?);
        }
        manifests.sort_by(|a, b| {
            (a.committed_at, a.manifest_id).cmp(&(b.committed_at, b.manifest_id))
        });
        Ok(manifests)
    }

    pub fn for_run(&self, run_id: &str) -> Result<Vec<IntegrationManifest>, ManifestError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|m| m.run_id == run_id)
            .collect())
    }

    /// Snapshots of `target` that some manifest still points at.
    pub fn referenced_snapshots(&self, target: &str) -> Result<HashSet<SnapshotId>, ManifestError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|m| m.target == target)
            .map(|m| m.snapshot.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::{RetentionPolicy, SnapshotStore};

    fn manifest(snapshot: SnapshotRef, run_id: &str) -> IntegrationManifest {
        IntegrationManifest {
            manifest_id: Uuid::new_v4(),
            run_id: run_id.into(),
            iteration: 1,
            target: snapshot.target.clone(),
            finding_ids: vec![],
            summaries: vec![],
            pre_hash: snapshot.content_hash.clone(),
            post_hash: ContentHash::of(b"after"),
            snapshot,
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_load_and_immutability() {
        let dir = tempfile::tempdir().unwrap();
        let snaps = SnapshotStore::new(dir.path(), RetentionPolicy::default()).unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        let snap = snaps.create("prd.md", "before", &HashSet::new()).unwrap();

        let m = manifest(snap, "run-1");
        store.record(&m).unwrap();
        assert_eq!(store.load(m.manifest_id).unwrap(), m);
        assert!(matches!(store.record(&m), Err(ManifestError::AlreadyExists(_))));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load(Uuid::new_v4()),
            Err(ManifestError::NotFound(_))
        ));
    }

    #[test]
    fn test_referenced_snapshots_by_target() {
        let dir = tempfile::tempdir().unwrap();
        let snaps = SnapshotStore::new(dir.path(), RetentionPolicy::default()).unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        let a = snaps.create("prd.md", "a", &HashSet::new()).unwrap();
        let b = snaps.create("sdd.md", "b", &HashSet::new()).unwrap();
        store.record(&manifest(a.clone(), "run-1")).unwrap();
        store.record(&manifest(b, "run-2")).unwrap();

        let referenced = store.referenced_snapshots("prd.md").unwrap();
        assert_eq!(referenced, [a.id].into());
        assert_eq!(store.for_run("run-2").unwrap().len(), 1);
        assert_eq!(store.list().unwrap().len(), 2);
    }
}
