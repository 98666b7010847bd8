//! Default configuration values
//!
//! All constants used throughout the config module are defined here.

/// Locale forced into LANG / LC_ALL of every script process
pub const DEFAULT_LOCALE: &str = "en_US.UTF-8";

/// Grace period between SIGTERM and SIGKILL during shutdown (milliseconds)
pub const DEFAULT_KILL_GRACE_MS: u64 = 250;

/// Persist live PIDs so a crashed host can reap its orphans on next start
pub const DEFAULT_TRACK_PROCESSES: bool = true;

/// Location of the config file, before tilde expansion
pub const DEFAULT_CONFIG_PATH: &str = "~/.script-shelf/config.json";
