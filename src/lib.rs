//! Script Shelf - run saved shell scripts as child processes
//!
//! This library provides the core functionality for executing scripts
//! with streamed output, stop/shutdown control and temp-file cleanup.

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod process_manager;
pub mod scripts;

pub use error::{Result, RunError};
pub use executor::{OutputChunk, RunRequest, RunResult, ScriptRunner, ScriptType};
