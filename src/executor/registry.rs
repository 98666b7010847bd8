//! Registry of running scripts, keyed by script id
//!
//! Lifecycle: empty when created, entries are reserved when a run starts,
//! promoted once the child exists, and removed exactly once - either by the
//! run's own exit path or by an explicit stop. Each reservation carries a
//! run id so a late exit of an old run can never remove the entry of a newer
//! run that reused the same script id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, RunError};

/// Lifecycle position of a run. A script id with no entry is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Spawning,
    Running,
    Completed,
    Killed,
    SpawnFailed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Spawning => "spawning",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Killed => "killed",
            RunState::SpawnFailed => "spawnFailed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Killed | RunState::SpawnFailed
        )
    }
}

/// Proof of a reservation, held by the run that made it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunToken {
    script_id: String,
    run_id: u64,
}

impl RunToken {
    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }
}

/// Snapshot of a registered run, for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub script_id: String,
    pub run_id: u64,
    pub pid: Option<u32>,
    pub state: RunState,
    pub script_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RunHandle {
    run_id: u64,
    pid: Option<u32>,
    state: RunState,
    script_path: Option<PathBuf>,
    started_at: DateTime<Utc>,
}

impl RunHandle {
    fn info(&self, script_id: &str) -> RunInfo {
        RunInfo {
            script_id: script_id.to_string(),
            run_id: self.run_id,
            pid: self.pid,
            state: self.state,
            script_path: self.script_path.clone(),
            started_at: self.started_at,
        }
    }
}

/// Process-wide map of script id -> live run
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    runs: Mutex<HashMap<String, RunHandle>>,
    next_run_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `script_id` for a new run in the Spawning state.
    ///
    /// Fails with AlreadyRunning if another run holds the id.
    pub fn reserve(&self, script_id: &str) -> Result<RunToken> {
        let mut runs = self.runs.lock();
        if runs.contains_key(script_id) {
            return Err(RunError::AlreadyRunning(script_id.to_string()));
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        runs.insert(
            script_id.to_string(),
            RunHandle {
                run_id,
                pid: None,
                state: RunState::Spawning,
                script_path: None,
                started_at: Utc::now(),
            },
        );

        Ok(RunToken {
            script_id: script_id.to_string(),
            run_id,
        })
    }

    /// Record the spawned child and its script file, moving the run to Running.
    ///
    /// Returns false if the reservation was removed meanwhile (a stop arrived
    /// while spawning), in which case the caller owns terminating the child.
    pub fn attach(&self, token: &RunToken, pid: u32, script_path: &Path) -> bool {
        let mut runs = self.runs.lock();
        match runs.get_mut(&token.script_id) {
            Some(handle) if handle.run_id == token.run_id => {
                handle.pid = Some(pid);
                handle.script_path = Some(script_path.to_path_buf());
                handle.state = RunState::Running;
                true
            }
            _ => false,
        }
    }

    /// Remove the entry if it still belongs to `token`. Idempotent.
    pub fn release(&self, token: &RunToken) -> bool {
        let mut runs = self.runs.lock();
        match runs.get(&token.script_id) {
            Some(handle) if handle.run_id == token.run_id => {
                runs.remove(&token.script_id);
                true
            }
            _ => false,
        }
    }

    /// Remove whatever run holds `script_id`, returning its snapshot
    pub fn take(&self, script_id: &str) -> Option<RunInfo> {
        self.runs
            .lock()
            .remove(script_id)
            .map(|handle| handle.info(script_id))
    }

    /// Remove every entry (shutdown)
    pub fn drain(&self) -> Vec<RunInfo> {
        self.runs
            .lock()
            .drain()
            .map(|(id, handle)| handle.info(&id))
            .collect()
    }

    pub fn contains(&self, script_id: &str) -> bool {
        self.runs.lock().contains_key(script_id)
    }

    pub fn get(&self, script_id: &str) -> Option<RunInfo> {
        self.runs
            .lock()
            .get(script_id)
            .map(|handle| handle.info(script_id))
    }

    pub fn snapshot(&self) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .runs
            .lock()
            .iter()
            .map(|(id, handle)| handle.info(id))
            .collect();
        runs.sort_by_key(|r| r.run_id);
        runs
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}
