//! Script type tags
//!
//! The wire names (`bash`, `batch`, `powershell`) are the ones the script
//! store persists, so they are kept stable for serde and `FromStr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Interpreter family a script is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    /// POSIX shell script run by /bin/bash
    #[serde(rename = "bash")]
    PosixShell,
    /// Windows batch file run by cmd.exe
    #[serde(rename = "batch")]
    WindowsBatch,
    /// PowerShell script run by powershell.exe
    #[serde(rename = "powershell")]
    WindowsPowerShell,
}

impl ScriptType {
    pub const ALL: [ScriptType; 3] = [
        ScriptType::PosixShell,
        ScriptType::WindowsBatch,
        ScriptType::WindowsPowerShell,
    ];

    /// File extension of the materialized script (without the dot)
    pub fn extension(self) -> &'static str {
        match self {
            ScriptType::PosixShell => "sh",
            ScriptType::WindowsBatch => "bat",
            ScriptType::WindowsPowerShell => "ps1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::PosixShell => "bash",
            ScriptType::WindowsBatch => "batch",
            ScriptType::WindowsPowerShell => "powershell",
        }
    }

    /// Natural script type for the host platform
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            ScriptType::WindowsBatch
        } else {
            ScriptType::PosixShell
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bash" | "sh" => Ok(ScriptType::PosixShell),
            "batch" | "bat" | "cmd" => Ok(ScriptType::WindowsBatch),
            "powershell" | "ps1" => Ok(ScriptType::WindowsPowerShell),
            _ => Err(RunError::UnsupportedScriptType(s.to_string())),
        }
    }
}
