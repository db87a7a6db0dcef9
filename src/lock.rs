//! Per-session exclusive locks.
//!
//! One lock file per session under the locks root. The claim is an
//! exclusive-create; the record content then arrives via tempfile + rename so
//! readers never observe a partial record. A lock whose recorded PID is no
//! longer alive is stale and may be reclaimed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("session '{session}' is locked by running process {pid}")]
    Busy { session: String, pid: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub session: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// An acquired session lock. Released on drop if still owned.
#[derive(Debug)]
pub struct LockGuard {
    locks_root: PathBuf,
    session: String,
    released: bool,
}

impl LockGuard {
    /// Remove the lock file if this process still owns it.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release(&self.locks_root, &self.session);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn lock_path(locks_root: &Path, session: &str) -> PathBuf {
    locks_root.join(format!("{session}.lock"))
}

/// Check whether a PID belongs to a live process.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys.process(Pid::from_u32(pid)).is_some()
}

/// Read a session's lock record, if present. A record mid-write is
/// impossible thanks to the rename discipline; a torn file from an older
/// engine is treated as absent with a warning.
pub fn read_lock(locks_root: &Path, session: &str) -> anyhow::Result<Option<LockRecord>> {
    let path = lock_path(locks_root, session);
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str(&contents) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            tracing::warn!(session = %session, error = %e, "unreadable lock record, treating as absent");
            Ok(None)
        }
    }
}

/// Acquire the session lock for the current process.
///
/// Returns `Busy` when a live process holds it and `force` is false. A stale
/// lock (dead PID) is cleaned and re-acquired. `force` displaces any holder
/// after logging a warning.
pub fn acquire(locks_root: &Path, session: &str, force: bool) -> Result<LockGuard, LockError> {
    fs::create_dir_all(locks_root)?;
    let path = lock_path(locks_root, session);

    // One retry after clearing a stale or forced-out holder.
    for attempt in 0..2 {
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                write_record(locks_root, session)?;
                tracing::debug!(session = %session, "lock acquired");
                return Ok(LockGuard {
                    locks_root: locks_root.to_path_buf(),
                    session: session.to_string(),
                    released: false,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                let holder = read_lock(locks_root, session)
                    .map_err(|e| LockError::Other(e.to_string()))?;
                match holder {
                    Some(record) if pid_alive(record.pid) => {
                        if force {
                            tracing::warn!(
                                session = %session,
                                pid = record.pid,
                                "forcing lock away from running process"
                            );
                            fs::remove_file(&path)?;
                        } else {
                            return Err(LockError::Busy {
                                session: session.to_string(),
                                pid: record.pid,
                            });
                        }
                    }
                    Some(record) => {
                        tracing::warn!(
                            session = %session,
                            pid = record.pid,
                            "removing stale lock from dead process"
                        );
                        fs::remove_file(&path)?;
                    }
                    None => {
                        // An unreadable lock is either torn garbage from an
                        // older engine or a claim whose record write is still
                        // in flight. Give the writer a moment before
                        // reclaiming.
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        match read_lock(locks_root, session)
                            .map_err(|e| LockError::Other(e.to_string()))?
                        {
                            Some(record) if pid_alive(record.pid) && !force => {
                                return Err(LockError::Busy {
                                    session: session.to_string(),
                                    pid: record.pid,
                                });
                            }
                            _ => fs::remove_file(&path)?,
                        }
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(LockError::Other(format!(
        "failed to acquire lock for session '{session}' after retry"
    )))
}

fn write_record(locks_root: &Path, session: &str) -> Result<(), LockError> {
    let record = LockRecord {
        session: session.to_string(),
        pid: std::process::id(),
        started_at: Utc::now(),
    };
    let contents = serde_json::to_string_pretty(&record)
        .map_err(|e| LockError::Other(e.to_string()))?;
    crate::fsutil::write_atomic(&lock_path(locks_root, session), &contents)
        .map_err(|e| LockError::Other(e.to_string()))
}

/// Remove the session lock, but only if the current process owns it.
pub fn release(locks_root: &Path, session: &str) {
    let path = lock_path(locks_root, session);
    match read_lock(locks_root, session) {
        Ok(Some(record)) if record.pid == std::process::id() => {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(session = %session, error = %e, "failed to remove lock");
            } else {
                tracing::debug!(session = %session, "lock released");
            }
        }
        Ok(Some(record)) => {
            tracing::warn!(
                session = %session,
                holder = record.pid,
                "not releasing lock owned by another process"
            );
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(session = %session, error = %e, "failed to inspect lock on release");
        }
    }
}

/// Delete every lock in `locks_root` whose recorded PID is dead.
/// Returns the sessions whose locks were removed.
pub fn cleanup_stale(locks_root: &Path) -> anyhow::Result<Vec<String>> {
    let mut cleaned = Vec::new();
    let locks = crate::fsutil::sorted_entries(locks_root, |n| n.ends_with(".lock"))?;
    for path in locks {
        let Some(session) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(ToString::to_string)
        else {
            continue;
        };
        match read_lock(locks_root, &session)? {
            Some(record) if pid_alive(record.pid) => {}
            Some(_) => {
                tracing::info!(session = %session, "removing stale lock");
                fs::remove_file(&path)?;
                cleaned.push(session);
            }
            // Unreadable records may be a claim mid-write; leave them for
            // the owning acquire path to sort out.
            None => {}
        }
    }
    Ok(cleaned)
}
