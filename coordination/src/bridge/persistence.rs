//! Run persistence: versioned records for resume after a restart.
//!
//! The schema version is read from the raw JSON before the body is decoded,
//! so a record written by another schema is rejected with
//! [`PersistenceError::VersionMismatch`] instead of being misread.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::breaker::CircuitBreakerState;
use super::state::BridgeState;
use crate::integration::write_state_file;

/// Durable BridgeState + CircuitBreakerState, keyed by run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub schema_version: u32,
    pub run_id: String,
    pub bridge: BridgeState,
    pub breaker: CircuitBreakerState,
    pub saved_at: DateTime<Utc>,
}

impl RunRecord {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(bridge: &BridgeState, breaker: &CircuitBreakerState) -> Self {
        Self {
            schema_version: Self::CURRENT_VERSION,
            run_id: bridge.run_id.clone(),
            bridge: bridge.clone(),
            breaker: breaker.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::SerializeFailed {
            reason: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let raw: serde_json::Value =
            serde_json::from_str(json).map_err(|e| PersistenceError::DeserializeFailed {
                reason: e.to_string(),
            })?;
        let found = raw
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        if found != Self::CURRENT_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found,
            });
        }
        serde_json::from_value(raw).map_err(|e| PersistenceError::DeserializeFailed {
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("serialization failed: {reason}")]
    SerializeFailed { reason: String },
    #[error("deserialization failed: {reason}")]
    DeserializeFailed { reason: String },
    #[error("run record schema version {found} is not supported (expected {expected})")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("run {0} not found")]
    NotFound(String),
    #[error("invalid run id {0:?}: use ASCII letters, digits, '-' or '_'")]
    InvalidRunId(String),
    #[error("run state I/O error: {0}")]
    Io(#[from] io::Error),
}

/// `runs/<run_id>.json` plus report artifacts next to it.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(state_dir: &Path) -> Result<Self, PersistenceError> {
        let dir = state_dir.join("runs");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Run ids become file names under `runs/`; anything that could name a
    /// path outside it is rejected.
    pub fn validate_run_id(run_id: &str) -> Result<(), PersistenceError> {
        let valid = !run_id.is_empty()
            && run_id.len() <= 128
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(PersistenceError::InvalidRunId(run_id.to_string()))
        }
    }

    fn path_for(&self, run_id: &str, suffix: &str) -> Result<PathBuf, PersistenceError> {
        Self::validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{run_id}.{suffix}")))
    }

    pub fn save(&self, bridge: &BridgeState, breaker: &CircuitBreakerState) -> Result<(), PersistenceError> {
        let path = self.path_for(&bridge.run_id, "json")?;
        let json = RunRecord::new(bridge, breaker).to_json()?;
        write_state_file(&path, json.as_bytes())?;
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<RunRecord, PersistenceError> {
        match fs::read_to_string(self.path_for(run_id, "json")?) {
            Ok(json) => RunRecord::from_json(&json),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(PersistenceError::NotFound(run_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a report artifact (`<run_id>.<suffix>`) and return its path.
    pub fn write_artifact(
        &self,
        run_id: &str,
        suffix: &str,
        content: &str,
    ) -> Result<PathBuf, PersistenceError> {
        let path = self.path_for(run_id, suffix)?;
        write_state_file(&path, content.as_bytes())?;
        Ok(path)
    }
}
