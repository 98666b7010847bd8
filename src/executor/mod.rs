//! Script execution module
//!
//! This module handles all aspects of running a script:
//! - Writing script text to a temporary file (materializer)
//! - Picking the interpreter for a script type (interpreter)
//! - Spawning, streaming and reaping the process (runner)
//! - Fanning output out to listeners (relay)
//! - Stops, shutdown and temp-file cleanup (janitor)

mod interpreter;
pub mod janitor;
mod materializer;
pub mod process;
mod registry;
mod relay;
mod runner;
mod script_type;

pub use interpreter::{resolve, ShellPlan};
pub use materializer::{
    is_materialized_file_name, materialize, materialized_file_name, prepare_content,
    MaterializedScript,
};
pub use registry::{ProcessRegistry, RunInfo, RunState, RunToken};
pub use relay::{OutputChunk, OutputRelay, Utf8StreamDecoder};
pub use runner::{error_chunk, RunRequest, RunResult, RunTicket, ScriptRunner};
pub use script_type::ScriptType;

#[cfg(test)]
#[path = "../executor_tests.rs"]
mod executor_tests;
