use super::*;
use crate::config::{Config, ProcessLimits};
use crate::error::RunError;
use futures::executor::block_on;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn test_config(temp: &Path) -> Config {
    Config {
        temp_dir: Some(temp.to_path_buf()),
        // Always installed, so bash never prints a setlocale warning
        locale: "C".to_string(),
        track_processes: false,
        ..Config::default()
    }
}

fn test_runner(temp: &TempDir, home: &TempDir) -> ScriptRunner {
    ScriptRunner::new(&test_config(temp.path())).with_home_dir(home.path())
}

fn drain_output(rx: &async_channel::Receiver<OutputChunk>) -> String {
    let mut out = String::new();
    while let Ok(chunk) = rx.try_recv() {
        out.push_str(&chunk.text);
    }
    out
}

fn leftover_scripts(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| is_materialized_file_name(name))
        .collect()
}

// ============================================================================
// Natural completion
// ============================================================================

#[cfg(unix)]
#[test]
fn test_echo_hello_streams_output_and_succeeds() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);
    let output = runner.relay().subscribe_script("s1");

    let result = block_on(runner.run(RunRequest::new("s1", "echo hello", ScriptType::PosixShell)))
        .unwrap();

    assert_eq!(
        result,
        RunResult {
            success: true,
            exit_code: Some(0),
            signal: None,
        }
    );
    assert_eq!(drain_output(&output), "hello\n");
    assert!(leftover_scripts(temp.path()).is_empty());
    assert!(!runner.is_running("s1"));
}

#[cfg(unix)]
#[test]
fn test_nonzero_exit_is_unsuccessful() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);

    let result =
        block_on(runner.run(RunRequest::new("s2", "exit 1", ScriptType::PosixShell))).unwrap();

    assert_eq!(
        result,
        RunResult {
            success: false,
            exit_code: Some(1),
            signal: None,
        }
    );
    assert!(leftover_scripts(temp.path()).is_empty());
}

#[cfg(unix)]
#[test]
fn test_stdout_and_stderr_are_both_forwarded() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);
    let output = runner.subscribe();

    let result = runner
        .start(RunRequest::new(
            "both",
            "echo to-stdout\necho to-stderr 1>&2\n",
            ScriptType::PosixShell,
        ))
        .unwrap()
        .wait_blocking();
    assert!(result.success);

    let text = drain_output(&output);
    // Cross-stream order is not guaranteed
    assert!(text.contains("to-stdout\n"));
    assert!(text.contains("to-stderr\n"));
    assert_eq!(text.len(), "to-stdout\nto-stderr\n".len());
}

#[cfg(unix)]
#[test]
fn test_large_multibyte_output_is_not_corrupted() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);
    let output = runner.relay().subscribe_script("utf8");

    // Far larger than one pipe read, so characters straddle read boundaries
    let script = "for i in $(seq 1 3000); do printf 'héllo wörld ✓\\n'; done";
    let result = block_on(runner.run(RunRequest::new("utf8", script, ScriptType::PosixShell)))
        .unwrap();
    assert!(result.success);

    let text = drain_output(&output);
    assert!(!text.contains(char::REPLACEMENT_CHARACTER));
    assert_eq!(text.lines().count(), 3000);
    assert!(text.lines().all(|line| line == "héllo wörld ✓"));
}

#[cfg(unix)]
#[test]
fn test_locale_is_forced_for_child() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);
    let output = runner.relay().subscribe_script("env");

    block_on(runner.run(RunRequest::new(
        "env",
        "echo \"$LANG|$LC_ALL\"",
        ScriptType::PosixShell,
    )))
    .unwrap();

    assert_eq!(drain_output(&output), "C|C\n");
}

#[cfg(unix)]
#[test]
fn test_missing_working_directory_falls_back_to_home() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);
    let output = runner.relay().subscribe_script("cwd");

    let request = RunRequest::new("cwd", "pwd -P", ScriptType::PosixShell)
        .in_dir("/definitely/not/a/real/dir");
    let result = block_on(runner.run(request)).unwrap();
    assert!(result.success);

    let printed = drain_output(&output);
    assert_eq!(
        Path::new(printed.trim_end()),
        home.path().canonicalize().unwrap()
    );
}

#[cfg(unix)]
#[test]
fn test_existing_working_directory_is_used() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);
    let output = runner.relay().subscribe_script("cwd");

    let request = RunRequest::new("cwd", "pwd -P", ScriptType::PosixShell).in_dir(work.path());
    block_on(runner.run(request)).unwrap();

    assert_eq!(
        Path::new(drain_output(&output).trim_end()),
        work.path().canonicalize().unwrap()
    );
}

#[cfg(unix)]
#[test]
fn test_distinct_ids_run_concurrently() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);

    let a = runner
        .start(RunRequest::new("a", "sleep 0.2; echo a", ScriptType::PosixShell))
        .unwrap();
    let b = runner
        .start(RunRequest::new("b", "sleep 0.2; echo b", ScriptType::PosixShell))
        .unwrap();
    assert_eq!(runner.active_runs().len(), 2);

    assert!(a.wait_blocking().success);
    assert!(b.wait_blocking().success);
    assert!(runner.active_runs().is_empty());
    assert!(leftover_scripts(temp.path()).is_empty());
}

// ============================================================================
// Stops, duplicates and limits
// ============================================================================

#[cfg(unix)]
#[test]
fn test_stop_terminates_run_and_deregisters() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);

    let ticket = runner
        .start(RunRequest::new("A", "sleep 30", ScriptType::PosixShell))
        .unwrap();
    assert!(runner.is_running("A"));
    let runs = runner.active_runs();
    let info = &runs[0];
    assert_eq!(info.state, RunState::Running);
    assert!(info.pid.is_some());

    let started = Instant::now();
    assert!(runner.stop("A"));
    assert!(!runner.is_running("A"));

    let result = ticket.wait_blocking();
    assert!(!result.success);
    assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(!runner.stop("A"));
    assert!(leftover_scripts(temp.path()).is_empty());
}

#[cfg(unix)]
#[test]
fn test_stop_while_spawning_kills_new_child() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);

    let token = runner.registry().reserve("S").unwrap();
    assert_eq!(runner.active_runs()[0].state, RunState::Spawning);
    assert!(runner.stop("S"));

    let started = Instant::now();
    let ticket = runner.launch(
        token,
        RunRequest::new("S", "sleep 30", ScriptType::PosixShell),
    );
    let result = ticket.wait_blocking();

    assert!(!result.success);
    assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!runner.is_running("S"));
    assert!(leftover_scripts(temp.path()).is_empty());

    // The id is free again once the killed run resolves
    let result =
        block_on(runner.run(RunRequest::new("S", "exit 0", ScriptType::PosixShell))).unwrap();
    assert!(result.success);
}

#[cfg(unix)]
#[test]
fn test_non_utf8_working_directory_is_used() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);
    let output = runner.relay().subscribe_script("nu");

    let work = TempDir::new().unwrap();
    let dir = work.path().join(OsStr::from_bytes(b"caf\xe9"));
    fs::create_dir(&dir).unwrap();

    let request = RunRequest::new("nu", "basename \"$PWD\" | od -An -tx1", ScriptType::PosixShell)
        .in_dir(dir.clone());
    let result = block_on(runner.run(request)).unwrap();

    assert!(result.success);
    let text = drain_output(&output);
    let bytes: Vec<&str> = text.split_whitespace().collect();
    assert_eq!(bytes, vec!["63", "61", "66", "e9", "0a"]);
}

#[cfg(unix)]
#[test]
fn test_duplicate_script_id_is_rejected() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);

    let first = runner
        .start(RunRequest::new("dup", "sleep 30", ScriptType::PosixShell))
        .unwrap();
    let err = runner
        .start(RunRequest::new("dup", "echo second", ScriptType::PosixShell))
        .unwrap_err();
    assert!(matches!(err, RunError::AlreadyRunning(ref id) if id == "dup"));

    // Only the first run's file was written
    assert_eq!(leftover_scripts(temp.path()).len(), 1);

    assert!(runner.stop("dup"));
    assert!(!first.wait_blocking().success);
}

#[test]
fn test_injected_registry_and_relay_are_shared() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    let relay = Arc::new(OutputRelay::new());
    registry.reserve("held").unwrap();

    let runner = test_runner(&temp, &home)
        .with_registry(Arc::clone(&registry))
        .with_relay(Arc::clone(&relay));
    assert!(Arc::ptr_eq(runner.registry(), &registry));
    assert!(Arc::ptr_eq(runner.relay(), &relay));

    assert!(runner.is_running("held"));
    let err = runner
        .start(RunRequest::new("held", "true", ScriptType::PosixShell))
        .unwrap_err();
    assert!(matches!(err, RunError::AlreadyRunning(_)));
    assert!(leftover_scripts(temp.path()).is_empty());
}

#[cfg(unix)]
#[test]
fn test_id_can_be_reused_after_run_finishes() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);

    for _ in 0..3 {
        let result =
            block_on(runner.run(RunRequest::new("again", "true", ScriptType::PosixShell)))
                .unwrap();
        assert!(result.success);
    }
}

#[cfg(unix)]
#[test]
fn test_max_runtime_stops_long_run() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let config = Config {
        process_limits: Some(ProcessLimits {
            max_runtime_seconds: Some(1),
            ..ProcessLimits::default()
        }),
        ..test_config(temp.path())
    };
    let runner = ScriptRunner::new(&config).with_home_dir(home.path());

    let started = Instant::now();
    let result = block_on(runner.run(RunRequest::new("slow", "sleep 30", ScriptType::PosixShell)))
        .unwrap();

    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!runner.is_running("slow"));
}

#[cfg(unix)]
#[test]
fn test_shutdown_escalates_to_sigkill() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let config = Config {
        process_limits: Some(ProcessLimits {
            max_runtime_seconds: None,
            kill_grace_ms: 200,
        }),
        ..test_config(temp.path())
    };
    let runner = ScriptRunner::new(&config).with_home_dir(home.path());

    let ticket = runner
        .start(RunRequest::new(
            "stubborn",
            "trap '' TERM\nsleep 30\n",
            ScriptType::PosixShell,
        ))
        .unwrap();
    // Give bash time to install the trap
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(runner.shutdown(), 1);
    let result = ticket.wait_blocking();
    assert!(!result.success);
    assert_eq!(result.signal.as_deref(), Some("SIGKILL"));
    assert!(leftover_scripts(temp.path()).is_empty());
}

// ============================================================================
// Failures before the process exists
// ============================================================================

#[cfg(unix)]
#[test]
fn test_spawn_failure_emits_error_chunk() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);
    let output = runner.relay().subscribe_script("win");

    // No cmd.exe on a Unix host
    let result = block_on(runner.run(RunRequest::new(
        "win",
        "echo hi",
        ScriptType::WindowsBatch,
    )))
    .unwrap();

    assert_eq!(result, RunResult::failed());
    let text = drain_output(&output);
    assert!(text.starts_with("\x1b[31mError: "));
    assert!(text.contains("cmd.exe"));
    assert!(text.ends_with("\x1b[0m\n"));
    assert!(!runner.is_running("win"));
    assert!(leftover_scripts(temp.path()).is_empty());
}

#[test]
fn test_unwritable_temp_dir_resolves_failed_run() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let missing = temp.path().join("does-not-exist");
    let runner = ScriptRunner::new(&test_config(&missing)).with_home_dir(home.path());
    let output = runner.relay().subscribe_script("io");

    let result = block_on(runner.run(RunRequest::new(
        "io",
        "echo hi",
        ScriptType::PosixShell,
    )))
    .unwrap();

    assert_eq!(result, RunResult::failed());
    assert!(drain_output(&output).starts_with("\x1b[31mError: Could not write script file"));
    assert!(!runner.is_running("io"));
}

// ============================================================================
// Sweep
// ============================================================================

#[test]
fn test_runner_sweep_removes_only_materialized_files() {
    let temp = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    let runner = test_runner(&temp, &home);

    for name in [
        materialized_file_name("a", 1, ScriptType::PosixShell),
        materialized_file_name("b", 2, ScriptType::WindowsBatch),
        materialized_file_name("c", 3, ScriptType::WindowsPowerShell),
        "keep-me.sh".to_string(),
    ] {
        fs::write(temp.path().join(name), "x").unwrap();
    }

    assert_eq!(runner.sweep(), 3);
    assert!(temp.path().join("keep-me.sh").exists());
    assert!(leftover_scripts(temp.path()).is_empty());
}
