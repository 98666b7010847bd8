//! Interpreter selection - maps a script type to the command that runs it

use std::ffi::OsString;
use std::path::Path;

use super::script_type::ScriptType;

/// Executable plus arguments needed to run a materialized script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellPlan {
    pub executable: String,
    /// The script path is passed through as raw OS bytes
    pub args: Vec<OsString>,
}

/// Resolve the interpreter invocation for `script_type` running `file_path`.
///
/// Pure mapping; nothing is looked up on disk.
pub fn resolve(script_type: ScriptType, file_path: &Path) -> ShellPlan {
    let file = file_path.as_os_str().to_os_string();
    let (executable, flags): (&str, &[&str]) = match script_type {
        ScriptType::WindowsBatch => ("cmd.exe", &["/c"]),
        ScriptType::WindowsPowerShell => ("powershell.exe", &["-ExecutionPolicy", "Bypass", "-File"]),
        ScriptType::PosixShell => ("/bin/bash", &[]),
    };

    let mut args: Vec<OsString> = flags.iter().map(OsString::from).collect();
    args.push(file);

    ShellPlan {
        executable: executable.to_string(),
        args,
    }
}
