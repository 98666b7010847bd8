//! Process runner
//!
//! Drives one script run from request to result:
//! reserve -> materialize -> spawn -> stream output -> wait -> clean up.
//!
//! Each run gets three helper threads: one reader per output pipe and a
//! waiter that reaps the child. The waiter only resolves the run after both
//! readers have drained their pipes, so every chunk of output reaches the
//! relay before the caller sees the result.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::interpreter;
use super::janitor;
use super::materializer::materialize;
use super::process;
use super::registry::{ProcessRegistry, RunInfo, RunState, RunToken};
use super::relay::{OutputChunk, OutputRelay, Utf8StreamDecoder};
use super::script_type::ScriptType;
use crate::config::Config;
use crate::error::{Result, RunError};
use crate::logging;
use crate::process_manager::ProcessManager;

/// Pipe read size
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A request to run a piece of script text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub script_id: String,
    pub content: String,
    pub script_type: ScriptType,
    /// Falls back to the home directory when absent or missing on disk
    pub working_directory: Option<PathBuf>,
}

impl RunRequest {
    pub fn new(script_id: impl Into<String>, content: impl Into<String>, script_type: ScriptType) -> Self {
        Self {
            script_id: script_id.into(),
            content: content.into(),
            script_type,
            working_directory: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    /// None when the process never started or was killed by a signal
    pub exit_code: Option<i32>,
    /// Terminating signal name, e.g. "SIGTERM"
    pub signal: Option<String>,
}

impl RunResult {
    /// Result of a run that never got a process going
    pub fn failed() -> Self {
        Self {
            success: false,
            exit_code: None,
            signal: None,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        let exit_code = status.code();

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(process::signal_name)
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            success: exit_code == Some(0),
            exit_code,
            signal,
        }
    }
}

/// Pending result of a started run. Resolves exactly once.
#[derive(Debug)]
pub struct RunTicket {
    script_id: String,
    rx: async_channel::Receiver<RunResult>,
}

impl RunTicket {
    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> RunResult {
        // A closed channel means the waiter thread died; report a failed run
        self.rx.recv().await.unwrap_or_else(|_| RunResult::failed())
    }

    /// Blocking variant of [`RunTicket::wait`] for non-async callers
    pub fn wait_blocking(self) -> RunResult {
        self.rx.recv_blocking().unwrap_or_else(|_| RunResult::failed())
    }
}

/// Format the synthetic output chunk that marks a run which failed to start
pub fn error_chunk(message: &str) -> String {
    format!("\x1b[31mError: {}\x1b[0m\n", message)
}

/// Runs scripts as child processes and tracks them until they finish.
///
/// Cheap to clone; clones share the registry and the output relay.
#[derive(Clone)]
pub struct ScriptRunner {
    registry: Arc<ProcessRegistry>,
    relay: Arc<OutputRelay>,
    process_manager: Option<Arc<ProcessManager>>,
    temp_dir: PathBuf,
    home_dir: PathBuf,
    locale: String,
    max_runtime: Option<Duration>,
    kill_grace: Duration,
}

impl ScriptRunner {
    /// Build a runner with a fresh registry and relay from `config`
    pub fn new(config: &Config) -> Self {
        let limits = config.get_process_limits();
        Self {
            registry: Arc::new(ProcessRegistry::new()),
            relay: Arc::new(OutputRelay::new()),
            process_manager: None,
            temp_dir: config.get_temp_dir(),
            home_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            locale: config.locale.clone(),
            max_runtime: limits.max_runtime(),
            kill_grace: limits.kill_grace(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_relay(mut self, relay: Arc<OutputRelay>) -> Self {
        self.relay = relay;
        self
    }

    /// Persist live PIDs through `manager` so a crashed host can reap them
    pub fn with_process_manager(mut self, manager: Arc<ProcessManager>) -> Self {
        self.process_manager = Some(manager);
        self
    }

    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = home_dir.into();
        self
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<OutputRelay> {
        &self.relay
    }

    /// Receive output of every run
    pub fn subscribe(&self) -> async_channel::Receiver<OutputChunk> {
        self.relay.subscribe()
    }

    /// Run a script and wait for it to finish.
    ///
    /// Only an AlreadyRunning rejection is returned as an error; every failure
    /// after that resolves as an unsuccessful [`RunResult`].
    pub async fn run(&self, request: RunRequest) -> Result<RunResult> {
        Ok(self.start(request)?.wait().await)
    }

    /// Start a run without waiting for it
    pub fn start(&self, request: RunRequest) -> Result<RunTicket> {
        let token = self.registry.reserve(&request.script_id)?;
        Ok(self.launch(token, request))
    }

    /// Materialize and spawn a run whose id `token` already holds.
    ///
    /// The reservation may be gone by the time the child exists; the child
    /// is then terminated and the run resolves as killed.
    pub(crate) fn launch(&self, token: RunToken, request: RunRequest) -> RunTicket {
        let started = Instant::now();
        let (result_tx, result_rx) = async_channel::bounded(1);
        let ticket = RunTicket {
            script_id: request.script_id.clone(),
            rx: result_rx,
        };

        logging::log_script_event(&request.script_id, "started", None, true);

        let script = match materialize(
            &self.temp_dir,
            &request.script_id,
            &request.content,
            request.script_type,
        ) {
            Ok(script) => script,
            Err(e) => {
                self.fail_run(&token, &e, started);
                let _ = result_tx.try_send(RunResult::failed());
                return ticket;
            }
        };

        let plan = interpreter::resolve(request.script_type, script.path());
        let cwd = self.effective_cwd(request.working_directory.as_deref());

        let mut command = Command::new(&plan.executable);
        command
            .args(&plan.args)
            .current_dir(&cwd)
            .env("LANG", &self.locale)
            .env("LC_ALL", &self.locale)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        process::configure_command(&mut command);

        debug!(
            script_id = %request.script_id,
            executable = %plan.executable,
            args = ?plan.args,
            cwd = %cwd.display(),
            "Spawning script"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let e = RunError::Spawn {
                    executable: plan.executable.clone(),
                    source,
                };
                self.fail_run(&token, &e, started);
                janitor::discard(script);
                let _ = result_tx.try_send(RunResult::failed());
                return ticket;
            }
        };

        let pid = child.id();
        if !self.registry.attach(&token, pid, script.path()) {
            logging::log(
                "EXEC",
                &format!(
                    "Script {} was stopped while spawning, terminating PID {}",
                    request.script_id, pid
                ),
            );
            process::terminate(pid);
        }

        if let Some(manager) = &self.process_manager {
            manager.track(pid, &request.script_id, script.path());
        }

        info!(script_id = %request.script_id, pid, "Script process started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_output_reader(
                stdout,
                request.script_id.clone(),
                Arc::clone(&self.relay),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_output_reader(
                stderr,
                request.script_id.clone(),
                Arc::clone(&self.relay),
            ));
        }

        let watchdog = self
            .max_runtime
            .map(|limit| spawn_watchdog(Arc::clone(&self.registry), token.clone(), pid, limit));

        let registry = Arc::clone(&self.registry);
        let process_manager = self.process_manager.clone();
        thread::spawn(move || {
            let status = child.wait();

            for reader in readers {
                if reader.join().is_err() {
                    error!(script_id = token.script_id(), "Output reader thread panicked");
                }
            }

            // Dropping the sender wakes the watchdog
            drop(watchdog);

            // Still registered means nobody stopped it
            let exited_naturally = registry.release(&token);
            if let Some(manager) = &process_manager {
                manager.untrack(pid);
            }
            janitor::discard(script);

            let mut result = match status {
                Ok(status) => RunResult::from_status(status),
                Err(e) => {
                    error!(script_id = token.script_id(), pid, error = %e, "Failed to wait for script process");
                    RunResult::failed()
                }
            };
            if !exited_naturally {
                result.success = false;
            }

            let state = if exited_naturally {
                RunState::Completed
            } else {
                RunState::Killed
            };
            logging::log_script_event(
                token.script_id(),
                state.as_str(),
                Some(started.elapsed().as_millis() as u64),
                result.success,
            );
            debug!(script_id = token.script_id(), ?result, "Script run resolved");

            let _ = result_tx.send_blocking(result);
        });

        ticket
    }

    /// Stop a running script. False if `script_id` is not running.
    pub fn stop(&self, script_id: &str) -> bool {
        janitor::stop(&self.registry, script_id)
    }

    pub fn is_running(&self, script_id: &str) -> bool {
        self.registry.contains(script_id)
    }

    pub fn active_runs(&self) -> Vec<RunInfo> {
        self.registry.snapshot()
    }

    /// Delete leftover materialized files from the transient directory
    pub fn sweep(&self) -> usize {
        janitor::sweep(&self.temp_dir)
    }

    /// Stop every run (SIGTERM, grace period, SIGKILL) and sweep.
    ///
    /// Returns how many runs were stopped.
    pub fn shutdown(&self) -> usize {
        let stopped = janitor::shutdown_runs(&self.registry, self.kill_grace);
        self.sweep();
        logging::log(
            "EXEC",
            &format!("Runner shut down, {} run(s) stopped", stopped.len()),
        );
        stopped.len()
    }

    fn effective_cwd(&self, requested: Option<&Path>) -> PathBuf {
        if let Some(dir) = requested {
            // Tilde expansion needs UTF-8; other paths are used as given
            let expanded = match dir.to_str() {
                Some(text) => PathBuf::from(shellexpand::tilde(text).as_ref()),
                None => dir.to_path_buf(),
            };
            if expanded.is_dir() {
                return expanded;
            }
            debug!(
                requested = %dir.display(),
                fallback = %self.home_dir.display(),
                "Working directory missing, using home directory"
            );
        }
        self.home_dir.clone()
    }

    fn fail_run(&self, token: &RunToken, e: &RunError, started: Instant) {
        self.registry.release(token);
        error!(script_id = token.script_id(), error = %e, "Script run failed to start");
        self.relay
            .emit(token.script_id(), &error_chunk(&e.user_message()));
        logging::log_script_event(
            token.script_id(),
            RunState::SpawnFailed.as_str(),
            Some(started.elapsed().as_millis() as u64),
            false,
        );
    }
}

/// Forward everything read from `stream` to the relay, decoded as UTF-8
fn spawn_output_reader<R: Read + Send + 'static>(
    mut stream: R,
    script_id: String,
    relay: Arc<OutputRelay>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut decoder = Utf8StreamDecoder::new();
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => relay.emit(&script_id, &decoder.push(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(script_id = %script_id, error = %e, "Output read error");
                    break;
                }
            }
        }
        relay.emit(&script_id, &decoder.finish());
    })
}

/// Stop the run after `limit` unless the returned sender is dropped first
fn spawn_watchdog(
    registry: Arc<ProcessRegistry>,
    token: RunToken,
    pid: u32,
    limit: Duration,
) -> mpsc::Sender<()> {
    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        if let Err(mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(limit) {
            janitor::expire(&registry, &token, pid, limit);
        }
    });
    cancel_tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chunk_format() {
        assert_eq!(error_chunk("boom"), "\x1b[31mError: boom\x1b[0m\n");
    }

    #[test]
    fn test_failed_result_shape() {
        let result = RunResult::failed();
        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.signal, None);
    }

    #[test]
    fn test_run_result_serializes_camel_case() {
        let result = RunResult {
            success: false,
            exit_code: Some(2),
            signal: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"success":false,"exitCode":2,"signal":null}"#);
    }

    #[test]
    fn test_effective_cwd_falls_back_to_home() {
        let home = tempfile::TempDir::new().unwrap();
        let runner = ScriptRunner::new(&Config::default()).with_home_dir(home.path());

        assert_eq!(runner.effective_cwd(None), home.path());
        assert_eq!(
            runner.effective_cwd(Some(Path::new("/definitely/not/here"))),
            home.path()
        );

        let work = tempfile::TempDir::new().unwrap();
        assert_eq!(runner.effective_cwd(Some(work.path())), work.path());
    }

    #[cfg(unix)]
    #[test]
    fn test_effective_cwd_keeps_non_utf8_directory() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let home = tempfile::TempDir::new().unwrap();
        let runner = ScriptRunner::new(&Config::default()).with_home_dir(home.path());

        let work = tempfile::TempDir::new().unwrap();
        let dir = work.path().join(OsStr::from_bytes(b"caf\xe9"));
        std::fs::create_dir(&dir).unwrap();

        assert_eq!(runner.effective_cwd(Some(&dir)), dir);
    }

    #[test]
    fn test_request_builder() {
        let request = RunRequest::new("a", "echo", ScriptType::PosixShell).in_dir("/tmp");
        assert_eq!(request.working_directory, Some(PathBuf::from("/tmp")));
    }
}
