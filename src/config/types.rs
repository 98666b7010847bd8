//! Configuration type definitions
//!
//! This module contains all the struct and enum definitions for configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::defaults::*;

// ============================================
// PROCESS LIMITS
// ============================================

/// Limits applied to every script process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessLimits {
    /// Maximum runtime in seconds (None = no limit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_seconds: Option<u64>,
    /// Grace period after SIGTERM before shutdown escalates to SIGKILL (default: 250)
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_kill_grace_ms() -> u64 {
    DEFAULT_KILL_GRACE_MS
}

impl Default for ProcessLimits {
    fn default() -> Self {
        ProcessLimits {
            max_runtime_seconds: None,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
        }
    }
}

impl ProcessLimits {
    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

// ============================================
// MAIN CONFIG
// ============================================

/// Top-level configuration, loaded from ~/.script-shelf/config.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Where materialized scripts are written (default: OS temp directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    /// Locale forced into LANG / LC_ALL (default: en_US.UTF-8)
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_limits: Option<ProcessLimits>,
    /// Persist live PIDs for orphan cleanup after a crash (default: true)
    #[serde(default = "default_track_processes")]
    pub track_processes: bool,
}

fn default_locale() -> String {
    DEFAULT_LOCALE.to_string()
}
fn default_track_processes() -> bool {
    DEFAULT_TRACK_PROCESSES
}

impl Default for Config {
    fn default() -> Self {
        Config {
            temp_dir: None, // Will use std::env::temp_dir() via getter
            locale: DEFAULT_LOCALE.to_string(),
            process_limits: None, // Will use ProcessLimits::default() via getter
            track_processes: DEFAULT_TRACK_PROCESSES,
        }
    }
}

impl Config {
    /// Returns the transient directory for materialized scripts
    pub fn get_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .as_ref()
            .map(|p| match p.to_str() {
                Some(text) => PathBuf::from(shellexpand::tilde(text).as_ref()),
                None => p.clone(),
            })
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Returns the process limits configuration, or defaults if not configured
    pub fn get_process_limits(&self) -> ProcessLimits {
        self.process_limits.clone().unwrap_or_default()
    }
}
