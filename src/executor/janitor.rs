//! Lifecycle janitor
//!
//! Everything that ends a run from the outside or cleans up after runs:
//! user stops, shutdown escalation, per-run file deletion and the sweep of
//! leftover materialized files.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::materializer::{is_materialized_file_name, MaterializedScript};
use super::process;
use super::registry::{ProcessRegistry, RunInfo, RunToken};
use crate::error::ResultExt;
use crate::logging;

/// Stop the run registered under `script_id`.
///
/// Sends a polite termination to the process tree, removes the entry right
/// away and returns without waiting for the exit. False if nothing was
/// registered under that id.
pub fn stop(registry: &ProcessRegistry, script_id: &str) -> bool {
    let Some(info) = registry.take(script_id) else {
        debug!(script_id, "Stop requested for script that is not running");
        return false;
    };

    match info.pid {
        Some(pid) => {
            logging::log("EXEC", &format!("Stopping script {} (PID {})", script_id, pid));
            process::terminate(pid);
        }
        // Still spawning: the runner sees the missing entry and kills the child
        None => {
            logging::log("EXEC", &format!("Stopping script {} while spawning", script_id));
        }
    }
    true
}

/// Stop one specific run that outlived its runtime limit.
///
/// Scoped to `token` so a later run reusing the script id is left alone.
pub fn expire(registry: &ProcessRegistry, token: &RunToken, pid: u32, limit: Duration) -> bool {
    if !registry.release(token) {
        return false;
    }
    warn!(
        script_id = token.script_id(),
        pid,
        limit_secs = limit.as_secs(),
        "Script exceeded maximum runtime, stopping"
    );
    process::terminate(pid);
    true
}

/// Stop every registered run, escalating to a force kill after `grace`.
///
/// Returns the runs that were stopped.
pub fn shutdown_runs(registry: &ProcessRegistry, grace: Duration) -> Vec<RunInfo> {
    let runs = registry.drain();
    if runs.is_empty() {
        return runs;
    }

    info!(count = runs.len(), grace_ms = grace.as_millis() as u64, "Stopping active scripts");

    // Polite signal to all first so the grace periods overlap
    let pids: Vec<u32> = runs.iter().filter_map(|r| r.pid).collect();
    for &pid in &pids {
        process::terminate(pid);
    }

    let deadline = std::time::Instant::now() + grace;
    while std::time::Instant::now() < deadline && pids.iter().any(|&pid| process::is_alive(pid)) {
        std::thread::sleep(Duration::from_millis(50));
    }

    for &pid in &pids {
        if process::is_alive(pid) {
            warn!(pid, "Process group survived SIGTERM, force killing");
            process::force_kill(pid);
        }
    }

    runs
}

/// Delete a run's materialized file. Failures are logged, never raised.
pub fn discard(script: MaterializedScript) {
    let path = script.path();
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed script file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            path = %path.display(),
            script_id = script.script_id(),
            error = %e,
            "Failed to remove script file"
        ),
    }
}

/// Delete every file in `dir` that follows the materialized naming
/// convention. Per-file errors are logged and skipped. Returns the number of
/// files removed.
pub fn sweep(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read directory for sweep");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.log_err()) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_materialized_file_name(name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            && fs::remove_file(entry.path()).warn_on_err().is_some()
        {
            removed += 1;
        }
    }

    if removed > 0 {
        logging::log(
            "EXEC",
            &format!("Swept {} leftover script file(s) from {}", removed, dir.display()),
        );
    }
    removed
}
