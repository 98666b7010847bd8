//! Crash-safe record of live script processes
//!
//! Every host instance mirrors the scripts it spawned into its own file,
//! `~/.script-shelf/active-pids/<host pid>.json`, together with the host's
//! PID and start time. A host that exits cleanly removes its file; one that
//! crashed leaves it behind, and the next start reaps the entries of owners
//! that are gone with [`ProcessManager::cleanup_orphans`]. Files of hosts
//! that are still running are never touched.

use crate::executor::process;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};

/// Information about a tracked child process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Process ID (also the process group ID on Unix)
    pub pid: u32,
    pub script_id: String,
    /// Materialized script the process is executing
    pub script_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// On-disk record of one host instance and its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PidFile {
    owner_pid: u32,
    /// Owner start time in seconds since the epoch, as sysinfo reports it
    #[serde(default)]
    owner_started_at: Option<u64>,
    processes: Vec<ProcessInfo>,
}

/// Thread-safe tracker for script processes, mirrored to disk
#[derive(Debug)]
pub struct ProcessManager {
    /// Map of PID -> ProcessInfo for active child processes
    active_processes: RwLock<HashMap<u32, ProcessInfo>>,
    /// Directory holding one PID file per host instance
    pids_dir: PathBuf,
    owner_pid: u32,
    owner_started_at: Option<u64>,
}

impl ProcessManager {
    /// Create a ProcessManager persisting under ~/.script-shelf/active-pids/
    pub fn new() -> Self {
        let state_dir = dirs::home_dir()
            .map(|h| h.join(".script-shelf"))
            .unwrap_or_else(|| std::env::temp_dir().join(".script-shelf"));
        Self::with_state_dir(&state_dir)
    }

    /// Persist under `state_dir`, owned by the current process
    pub fn with_state_dir(state_dir: &Path) -> Self {
        Self::with_owner(state_dir, std::process::id())
    }

    /// Persist under `state_dir` on behalf of host process `owner_pid`
    pub fn with_owner(state_dir: &Path, owner_pid: u32) -> Self {
        Self {
            active_processes: RwLock::new(HashMap::new()),
            pids_dir: state_dir.join("active-pids"),
            owner_pid,
            owner_started_at: process_start_time(owner_pid),
        }
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Register a new child process and persist the set to disk
    pub fn track(&self, pid: u32, script_id: &str, script_path: &Path) {
        debug!(pid, script_id, path = %script_path.display(), "Tracking script process");

        self.active_processes.write().insert(
            pid,
            ProcessInfo {
                pid,
                script_id: script_id.to_string(),
                script_path: script_path.to_path_buf(),
                started_at: Utc::now(),
            },
        );

        self.save();
    }

    /// Unregister a child process once it has exited
    pub fn untrack(&self, pid: u32) {
        debug!(pid, "Untracking script process");

        self.active_processes.write().remove(&pid);

        self.save();
    }

    pub fn tracked(&self) -> Vec<ProcessInfo> {
        self.active_processes.read().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_processes.read().len()
    }

    /// Check whether `pid` is alive and still executing `script_path`.
    ///
    /// The command-line check keeps a recycled PID belonging to some
    /// unrelated program from being killed.
    pub fn is_running_script(&self, pid: u32, script_path: &Path) -> bool {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );

        let Some(proc_) = system.process(sys_pid) else {
            return false;
        };
        let needle = script_path.as_os_str();
        proc_.cmd().iter().any(|arg| arg.as_os_str() == needle)
    }

    /// Reap script processes left behind by host instances that are gone.
    ///
    /// Call once at startup, before any new run is tracked. Entries whose
    /// owner is still alive are left alone, file included. Returns how many
    /// processes were terminated.
    pub fn cleanup_orphans(&self, grace: Duration) -> usize {
        let mut found = 0;
        let mut reaped = 0;

        for (path, file) in self.load_pid_files() {
            if file.owner_pid == self.owner_pid {
                continue;
            }
            if owner_alive(&file) {
                debug!(owner_pid = file.owner_pid, "PID file belongs to a live instance");
                continue;
            }

            found += file.processes.len();
            for info in file
                .processes
                .iter()
                .filter(|info| self.is_running_script(info.pid, &info.script_path))
            {
                warn!(
                    pid = info.pid,
                    owner_pid = file.owner_pid,
                    script_id = %info.script_id,
                    started_at = %info.started_at,
                    "Terminating orphaned script process"
                );
                process::terminate_with_grace(info.pid, grace);
                reaped += 1;
            }

            remove_pid_file(&path);
        }

        if found == 0 {
            debug!("No script processes left over from a previous session");
        } else {
            info!(found, reaped, "Orphan check complete");
        }
        reaped
    }

    fn pid_file_path(&self) -> PathBuf {
        self.pids_dir.join(format!("{}.json", self.owner_pid))
    }

    fn save(&self) {
        if let Err(e) = self.persist_active_pids() {
            warn!(path = %self.pid_file_path().display(), error = %e, "Failed to persist active PIDs");
        }
    }

    fn persist_active_pids(&self) -> std::io::Result<()> {
        let path = self.pid_file_path();
        let processes = self.tracked();

        if processes.is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }

        fs::create_dir_all(&self.pids_dir)?;

        let file = PidFile {
            owner_pid: self.owner_pid,
            owner_started_at: self.owner_started_at,
            processes,
        };
        let json = serde_json::to_string_pretty(&file).map_err(std::io::Error::other)?;

        // Rename keeps a concurrent reader from seeing a half-written file
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, &path)
    }

    fn load_pid_files(&self) -> Vec<(PathBuf, PidFile)> {
        let entries = match fs::read_dir(&self.pids_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.pids_dir.display(), error = %e, "Unreadable PID directory");
                }
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let parsed = fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|text| {
                        serde_json::from_str::<PidFile>(&text).map_err(|e| e.to_string())
                    });
                match parsed {
                    Ok(file) => Some((path, file)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Unreadable PID file");
                        None
                    }
                }
            })
            .collect()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn process_start_time(pid: u32) -> Option<u64> {
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(sys_pid).map(|p| p.start_time())
}

/// The owner counts as alive only if its PID exists with the recorded start time
fn owner_alive(file: &PidFile) -> bool {
    match (process_start_time(file.owner_pid), file.owner_started_at) {
        (None, _) => false,
        (Some(now), Some(recorded)) => now == recorded,
        (Some(_), None) => true,
    }
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to clear orphan PID file");
        }
    }
}
