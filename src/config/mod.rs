//! Configuration module - runner settings
//!
//! This module provides functionality for:
//! - Loading configuration from ~/.script-shelf/config.json
//! - Default values for all settings
//! - Type definitions for config structures
//!
//! # Module Structure
//!
//! - `defaults` - All default constant values
//! - `types` - Configuration struct definitions (Config, ProcessLimits)
//! - `loader` - File system loading and parsing

mod defaults;
mod loader;
mod types;

pub use defaults::{DEFAULT_KILL_GRACE_MS, DEFAULT_LOCALE};

pub use types::{Config, ProcessLimits};

pub use loader::{load_config, load_config_from};

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
