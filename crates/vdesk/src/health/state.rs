//! Persisted supervisor state.
//!
//! The retry counter and both bootstrap markers live in one JSON document,
//! `state.json`. Overlapping invocations serialize on an exclusive `flock`
//! of `state.lock`, held for the whole invocation, and every write goes to a
//! temp file in the same directory followed by an atomic rename.

use crate::error::{Error, Result};
use crate::model::{now_unix_ms, HealthState};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";
const LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorState {
    /// Remediation attempts since the guest was last healthy.
    pub retry_count: u32,
    /// Budget in force when the state was written.
    pub max_retries: u32,
    pub bootstrap_done: bool,
    pub bootstrap_timed_out: bool,
    pub last_state: HealthState,
    pub last_detail: String,
    pub updated_at_ms: u64,
}

impl SupervisorState {
    pub fn fresh(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn retries_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Transition into `Healthy`: clears the counter and the timed-out marker.
    pub fn mark_healthy(&mut self, detail: &str) {
        self.retry_count = 0;
        self.bootstrap_done = true;
        self.bootstrap_timed_out = false;
        self.record(HealthState::Healthy, detail);
    }

    /// Count one remediation attempt that did not reach `Healthy`.
    /// Returns `true` once the budget is spent.
    pub fn record_failed_attempt(&mut self, max_retries: u32) -> bool {
        self.retry_count = self.retry_count.saturating_add(1).min(max_retries);
        let exhausted = self.retries_exhausted(max_retries);
        if exhausted {
            self.bootstrap_timed_out = true;
        }
        exhausted
    }

    pub fn record(&mut self, state: HealthState, detail: &str) {
        self.last_state = state;
        self.last_detail = detail.to_string();
        self.updated_at_ms = now_unix_ms();
    }
}

#[derive(Clone, Debug)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Take the exclusive lock, polling until `timeout` elapses.
    pub async fn lock(&self, timeout: Duration) -> Result<StateGuard> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| Error::io(format!("failed to create {}", self.dir.display()), err))?;
        let lock_path = self.lock_path();
        let started = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
                .map_err(|err| Error::io("failed to open state lock", err))?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    return Ok(StateGuard {
                        _lock: lock,
                        dir: self.dir.clone(),
                        path: self.state_path(),
                    })
                }
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    if started.elapsed() >= timeout {
                        return Err(Error::state_locked(&lock_path));
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err((_, errno)) => return Err(Error::io("failed to lock supervisor state", errno)),
            }
        }
    }
}

/// Proof of exclusive access; the lock is released on drop.
pub struct StateGuard {
    _lock: Flock<File>,
    dir: PathBuf,
    path: PathBuf,
}

impl StateGuard {
    /// Missing state reads as a fresh state with `max_retries`.
    pub fn load(&self, max_retries: u32) -> Result<SupervisorState> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SupervisorState::fresh(max_retries))
            }
            Err(err) => return Err(Error::io("failed to read supervisor state", err)),
        };
        let mut state: SupervisorState = serde_json::from_slice(&data).map_err(|err| {
            Error::new(
                crate::error::ErrorCode::Io,
                "supervisor state is corrupt",
                serde_json::json!({
                    "path": self.path.display().to_string(),
                    "parse_error": err.to_string(),
                    "hint": "run `vdesk health --reset` to start over",
                }),
            )
        })?;
        state.max_retries = max_retries;
        Ok(state)
    }

    pub fn save(&self, state: &SupervisorState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|err| Error::io("failed to serialize supervisor state", err))?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|err| Error::io("failed to create temp state file", err))?;
        tmp.write_all(&data)
            .map_err(|err| Error::io("failed to write temp state file", err))?;
        tmp.as_file()
            .sync_all()
            .map_err(|err| Error::io("failed to sync temp state file", err))?;
        tmp.persist(&self.path)
            .map_err(|err| Error::io("failed to replace supervisor state", err.error))?;
        Ok(())
    }
}
