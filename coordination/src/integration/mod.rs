//! Crash-safe integration of approved findings into the target document.
//!
//! Each finding is applied in its own transaction:
//!
//! ```text
//! LOCK ──► VERIFY_HASH ──► SNAPSHOT ──► INTEGRATE ──► RECORD_MANIFEST ──► RELEASE
//!   │           │              │             │               │
//!   │           └─ mismatch:   │             └───────┬───────┘
//!   │              release,    │                     ▼
//!   │              no mutation │            failure: restore from
//!   │                          │            snapshot, then release
//!   └─ timeout: resource       └─ quota: resource anomaly
//!      anomaly
//! ```
//!
//! `RECORD_MANIFEST` is the commit point. A failed release after commit is
//! logged and left to the stale-lock check of the next acquirer.
//!
//! On-disk layout under the state directory:
//!
//! ```text
//! locks/<target-key>.lock
//! snapshots/<target-key>/<snapshot-id>.snap   (pre-image bytes)
//! snapshots/<target-key>/<snapshot-id>.json   (SnapshotRef)
//! manifests/<manifest-id>.json
//! ```

mod atomic;
pub mod document;
pub mod lock;
pub mod manifest;
pub mod pipeline;
pub mod snapshot;

pub use document::{DocumentError, DocumentStore, FsDocumentStore};
pub use lock::{LockError, LockHandle, LockManager, LockRecord};
pub use manifest::{IntegrationManifest, ManifestError, ManifestStore};
pub use pipeline::{
    apply_edit, AnomalyKind, IntegrationError, IntegrationPipeline, RollbackOutcome, TxPhase,
};
pub(crate) use atomic::write_atomic as write_state_file;
pub use snapshot::{RetentionPolicy, SnapshotError, SnapshotId, SnapshotRef, SnapshotStore};
