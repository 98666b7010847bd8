//! Low-level process control
//!
//! Script processes are spawned as the leader of their own process group on
//! Unix, so signalling the group reaches anything the script started too
//! (a `sleep` inside a bash script would otherwise keep the output pipes
//! open after bash itself is gone).

use std::process::Command;
use std::time::{Duration, Instant};

use crate::logging;

// Unix-specific process control using libc for correctness and performance
#[cfg(unix)]
mod unix_process {
    use libc::{c_int, pid_t, ESRCH};

    /// Send a signal to a process group (negative PID targets the group)
    ///
    /// Returns Ok(()) if signal was sent successfully.
    /// Returns Err with errno description on failure.
    pub fn kill_process_group(pgid: u32, signal: c_int) -> Result<(), &'static str> {
        // Safety: kill() is a simple syscall with no memory safety concerns
        let rc = unsafe { libc::kill(-(pgid as pid_t), signal) };
        if rc == 0 {
            Ok(())
        } else {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::ESRCH => Err("No such process group"),
                libc::EPERM => Err("Permission denied"),
                libc::EINVAL => Err("Invalid signal"),
                _ => Err("Unknown error"),
            }
        }
    }

    /// Check if a process group is still alive
    ///
    /// EPERM still counts as alive: the group exists, we just can't signal it.
    pub fn process_group_alive(pgid: u32) -> bool {
        // Safety: kill() with signal 0 is safe - it only checks existence
        let rc = unsafe { libc::kill(-(pgid as pid_t), 0) };
        if rc == 0 {
            true
        } else {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            errno != ESRCH
        }
    }

    pub const SIGTERM: c_int = libc::SIGTERM;
    pub const SIGKILL: c_int = libc::SIGKILL;
}

/// Prepare a command so the child can be signalled as a unit and never
/// flashes a console window.
pub fn configure_command(command: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // process_group(0) means the child's PID becomes the PGID
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
}

/// Ask the process tree rooted at `pid` to terminate.
///
/// Returns false if it was already gone. Does not wait.
pub fn terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use unix_process::{kill_process_group, SIGTERM};

        match kill_process_group(pid, SIGTERM) {
            Ok(()) => {
                logging::log("EXEC", &format!("SIGTERM sent to PGID {}", pid));
                true
            }
            Err("No such process group") => {
                logging::log("EXEC", &format!("Process group {} already exited", pid));
                false
            }
            Err(e) => {
                logging::log(
                    "EXEC",
                    &format!("Failed to send SIGTERM to PGID {}: {}", pid, e),
                );
                false
            }
        }
    }

    #[cfg(not(unix))]
    {
        taskkill(pid, false)
    }
}

/// Forcefully kill the process tree rooted at `pid`
pub fn force_kill(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use unix_process::{kill_process_group, SIGKILL};

        match kill_process_group(pid, SIGKILL) {
            Ok(()) => {
                logging::log(
                    "EXEC",
                    &format!("Successfully killed process group {} with SIGKILL", pid),
                );
                true
            }
            Err(e) => {
                logging::log("EXEC", &format!("SIGKILL failed for PGID {}: {}", pid, e));
                false
            }
        }
    }

    #[cfg(not(unix))]
    {
        taskkill(pid, true)
    }
}

/// Whether anything in the process tree rooted at `pid` is still running
pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unix_process::process_group_alive(pid)
    }

    #[cfg(not(unix))]
    {
        let mut system = sysinfo::System::new();
        system.refresh_processes(
            sysinfo::ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid)]),
            true,
        );
        system.process(sysinfo::Pid::from_u32(pid)).is_some()
    }
}

/// SIGTERM, wait up to `grace` for the group to exit, then SIGKILL.
///
/// Used at shutdown; a user-initiated stop only sends the polite signal.
pub fn terminate_with_grace(pid: u32, grace: Duration) {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    if !terminate(pid) {
        return;
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_alive(pid) {
            logging::log(
                "EXEC",
                &format!("Process group {} terminated gracefully after SIGTERM", pid),
            );
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    logging::log(
        "EXEC",
        &format!(
            "Process group {} did not exit after {}ms, escalating to SIGKILL",
            pid,
            grace.as_millis()
        ),
    );
    force_kill(pid);
}

#[cfg(not(unix))]
fn taskkill(pid: u32, force: bool) -> bool {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if force {
        args.push("/F");
    }

    let mut command = Command::new("taskkill");
    command.args(&args);
    configure_command(&mut command);

    match command.output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            logging::log(
                "EXEC",
                &format!(
                    "taskkill {} failed: {}",
                    pid,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            );
            false
        }
        Err(e) => {
            logging::log("EXEC", &format!("Failed to execute taskkill: {}", e));
            false
        }
    }
}

/// Conventional name for a terminating signal number
pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        6 => "SIGABRT",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return format!("SIG{}", signal),
    };
    name.to_string()
}
