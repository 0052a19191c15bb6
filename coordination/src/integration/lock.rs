//! Advisory per-target locks that survive process restarts.
//!
//! A lock is a small JSON record at `locks/<target-key>.lock`, created with
//! no-clobber semantics so exactly one creator wins. A record is stale when
//! its owner process no longer exists or it is older than `stale_after`;
//! stale records are reclaimed with a warning.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::atomic::create_atomic;
use crate::digest::target_key;

/// Longest sleep between acquisition attempts.
const MAX_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock on {target}")]
    Timeout { target: String, waited_ms: u64 },
    #[error("lock on {target} is no longer held by this owner")]
    Lost { target: String },
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("lock record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_pid: u32,
    /// Distinguishes holders inside one process.
    pub token: Uuid,
    pub run_id: String,
    pub target: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    stale_after: Duration,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(state_dir: &Path, stale_after: Duration) -> Result<Self, LockError> {
        let dir = state_dir.join("locks");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stale_after,
            poll_interval: Duration::from_millis(25),
        })
    }

    /// Initial sleep between attempts; doubles up to 500ms.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn lock_path(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", target_key(target)))
    }

    /// Current holder, if any.
    pub fn holder(&self, target: &str) -> Result<Option<LockRecord>, LockError> {
        read_record(&self.lock_path(target))
    }

    /// Single attempt. `Ok(None)` means a live holder exists.
    pub fn try_acquire(&self, target: &str, run_id: &str) -> Result<Option<LockHandle>, LockError> {
        let path = self.lock_path(target);
        let record = LockRecord {
            owner_pid: std::process::id(),
            token: Uuid::new_v4(),
            run_id: run_id.to_string(),
            target: target.to_string(),
            acquired_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        // Second pass only after reclaiming a stale record or losing a race
        // with a holder that released in between.
        for _ in 0..2 {
            match create_atomic(&path, &bytes) {
                Ok(()) => {
                    debug!(document = %target, run_id, "Lock acquired");
                    return Ok(Some(LockHandle {
                        path,
                        target: target.to_string(),
                        token: record.token,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match read_record(&path) {
                Ok(None) => continue,
                Ok(Some(existing)) => match self.staleness(&existing) {
                    Some(reason) => self.reclaim(&path, &existing, reason)?,
                    None => return Ok(None),
                },
                Err(LockError::Encoding(_)) => {
                    if file_age(&path).is_some_and(|age| age > self.stale_after) {
                        warn!(document = %target, "Reclaiming unreadable lock record");
                        remove_if_present(&path)?;
                    } else {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Block (with backoff) until the lock is acquired or `max_wait` elapses.
    pub fn acquire(
        &self,
        target: &str,
        run_id: &str,
        max_wait: Duration,
    ) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let mut delay = self.poll_interval;
        loop {
            if let Some(handle) = self.try_acquire(target, run_id)? {
                return Ok(handle);
            }
            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(LockError::Timeout {
                    target: target.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            std::thread::sleep(delay.min(max_wait - waited));
            delay = (delay * 2).min(MAX_POLL);
        }
    }

    fn staleness(&self, record: &LockRecord) -> Option<&'static str> {
        let age = Utc::now()
            .signed_duration_since(record.acquired_at)
            .to_std()
            .unwrap_or_default();
        if age > self.stale_after {
            Some("expired")
        } else if !process_alive(record.owner_pid) {
            Some("owner process not running")
        } else {
            None
        }
    }

    fn reclaim(&self, path: &Path, stale: &LockRecord, reason: &str) -> Result<(), LockError> {
        // Only remove the exact record judged stale; a fresh holder may have
        // replaced it since it was read.
        match read_record(path)? {
            Some(current) if current.token == stale.token => {
                warn!(
                    document = %stale.target,
                    owner_pid = stale.owner_pid,
                    run_id = %stale.run_id,
                    acquired_at = %stale.acquired_at,
                    reason,
                    "Reclaiming stale lock"
                );
                remove_if_present(path)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Proof of holding a target lock. Release explicitly; dropping releases
/// best-effort.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    target: String,
    token: Uuid,
    released: bool,
}

impl LockHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> Result<(), LockError> {
        match read_record(&self.path)? {
            Some(record) if record.token == self.token => {
                remove_if_present(&self.path)?;
                debug!(document = %self.target, "Lock released");
                Ok(())
            }
            _ => Err(LockError::Lost {
                target: self.target.clone(),
            }),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.remove_if_owned();
        }
    }
}

fn read_record(path: &Path) -> Result<Option<LockRecord>, LockError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs the existence and permission checks only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No portable liveness check; fall back to the age check alone.
    true
}
