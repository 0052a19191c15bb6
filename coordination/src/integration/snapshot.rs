//! Pre-image snapshots with manifest-aware retention.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::atomic::write_atomic;
use super::document::{DocumentError, DocumentStore};
use crate::digest::{target_key, ContentHash};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0} no longer exists")]
    Missing(SnapshotId),
    #[error("snapshot {id} is corrupt: expected hash {expected}, found {actual}")]
    Corrupt {
        id: SnapshotId,
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("snapshot quota exhausted: {total_bytes} bytes retained, limit {limit_bytes}")]
    QuotaExhausted { total_bytes: u64, limit_bytes: u64 },
    #[error("restore write failed: {0}")]
    Document(#[from] DocumentError),
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot metadata error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Time-ordered snapshot identifier (`<unix-nanos>-<random>`), so sorting ids
/// sorts by creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    fn generate(at: DateTime<Utc>) -> Self {
        let nanos = at.timestamp_nanos_opt().unwrap_or_default().max(0);
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{nanos:020}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a stored pre-image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: SnapshotId,
    pub target: String,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Retention limits, applied per target after every creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Soft limit: exceeded only when every older snapshot is referenced.
    pub max_count: usize,
    /// Hard limit: creation fails if unreferenced eviction cannot get under it.
    pub max_total_bytes: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 10,
            max_total_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    retention: RetentionPolicy,
}

impl SnapshotStore {
    pub fn new(state_dir: &Path, retention: RetentionPolicy) -> Result<Self, SnapshotError> {
        let root = state_dir.join("snapshots");
        fs::create_dir_all(&root)?;
        Ok(Self { root, retention })
    }

    fn target_dir(&self, target: &str) -> PathBuf {
        self.root.join(target_key(target))
    }

    fn content_path(&self, target: &str, id: &SnapshotId) -> PathBuf {
        self.target_dir(target).join(format!("{id}.snap"))
    }

    fn meta_path(&self, target: &str, id: &SnapshotId) -> PathBuf {
        self.target_dir(target).join(format!("{id}.json"))
    }

    /// Store `content` as a new snapshot of `target`, then apply retention.
    ///
    /// `referenced` lists snapshots that manifests point at; they are never
    /// evicted. The new snapshot is never evicted by its own creation.
    pub fn create(
        &self,
        target: &str,
        content: &str,
        referenced: &HashSet<SnapshotId>,
    ) -> Result<SnapshotRef, SnapshotError> {
        let created_at = Utc::now();
        let snapshot = SnapshotRef {
            id: SnapshotId::generate(created_at),
            target: target.to_string(),
            content_hash: ContentHash::of(content.as_bytes()),
            size_bytes: content.len() as u64,
            created_at,
        };

        // Content first: metadata is what makes a snapshot visible to `list`.
        write_atomic(&self.content_path(target, &snapshot.id), content.as_bytes())?;
        write_atomic(
            &self.meta_path(target, &snapshot.id),
            &serde_json::to_vec_pretty(&snapshot)?,
        )?;
        debug!(
            document = %target,
            snapshot = %snapshot.id,
            bytes = snapshot.size_bytes,
            "Snapshot written"
        );

        if let Err(e) = self.enforce_retention(target, &snapshot.id, referenced) {
            if matches!(e, SnapshotError::QuotaExhausted { .. }) {
                self.remove(target, &snapshot.id)?;
            }
            return Err(e);
        }
        Ok(snapshot)
    }

    /// Snapshots of `target`, oldest first.
    pub fn list(&self, target: &str) -> Result<Vec<SnapshotRef>, SnapshotError> {
        let dir = self.target_dir(target);
        let entries = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice::<SnapshotRef>(&bytes) {
                    Ok(s) => snapshots.push(s),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot metadata"),
                },
                // Evicted concurrently.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        snapshots.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(snapshots)
    }

    /// Read and verify a snapshot's content.
    pub fn read_content(&self, snapshot: &SnapshotRef) -> Result<String, SnapshotError> {
        let path = self.content_path(&snapshot.target, &snapshot.id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing(snapshot.id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let actual = ContentHash::of(&bytes);
        if actual != snapshot.content_hash {
            return Err(SnapshotError::Corrupt {
                id: snapshot.id.clone(),
                expected: snapshot.content_hash.clone(),
                actual,
            });
        }
        String::from_utf8(bytes).map_err(|_| SnapshotError::Corrupt {
            id: snapshot.id.clone(),
            expected: snapshot.content_hash.clone(),
            actual: ContentHash::from_hex("not-utf8"),
        })
    }

    /// Overwrite the target with the snapshot's content. Fails without
    /// touching the target if the snapshot is missing or corrupt.
    pub fn restore(
        &self,
        snapshot: &SnapshotRef,
        documents: &dyn DocumentStore,
    ) -> Result<ContentHash, SnapshotError> {
        let content = self.read_content(snapshot)?;
        let written = documents.write_atomic(&snapshot.target, &content)?;
        info!(
            document = %snapshot.target,
            snapshot = %snapshot.id,
            hash = %written.short(),
            "Target restored from snapshot"
        );
        Ok(written)
    }

    fn remove(&self, target: &str, id: &SnapshotId) -> Result<(), SnapshotError> {
        for path in [self.meta_path(target, id), self.content_path(target, id)] {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Evict oldest-first among snapshots that are neither referenced nor
    /// `keep`. Returns the evicted ids.
    fn enforce_retention(
        &self,
        target: &str,
        keep: &SnapshotId,
        referenced: &HashSet<SnapshotId>,
    ) -> Result<Vec<SnapshotId>, SnapshotError> {
        let mut live = self.list(target)?;
        let mut evicted = Vec::new();

        let evictable = |s: &SnapshotRef| &s.id != keep && !referenced.contains(&s.id);

        while live.len() > self.retention.max_count {
            let Some(pos) = live.iter().position(evictable) else {
                warn!(
                    document = %target,
                    count = live.len(),
                    max_count = self.retention.max_count,
                    "Snapshot count over limit; every older snapshot is referenced by a manifest"
                );
                break;
            };
            let victim = live.remove(pos);
            self.remove(target, &victim.id)?;
            evicted.push(victim.id);
        }

        let mut total: u64 = live.iter().map(|s| s.size_bytes).sum();
        while total > self.retention.max_total_bytes {
            let Some(pos) = live.iter().position(evictable) else {
                return Err(SnapshotError::QuotaExhausted {
                    total_bytes: total,
                    limit_bytes: self.retention.max_total_bytes,
                });
            };
            let victim = live.remove(pos);
            total -= victim.size_bytes;
            self.remove(target, &victim.id)?;
            evicted.push(victim.id);
        }

        if !evicted.is_empty() {
            debug!(document = %target, evicted = evicted.len(), "Snapshot retention applied");
        }
        Ok(evicted)
    }
}
