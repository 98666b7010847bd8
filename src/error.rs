use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, warn};

/// Errors raised while preparing or launching a script run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to write script file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported script type: {0}")]
    UnsupportedScriptType(String),

    #[error("Failed to spawn '{executable}': {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Script '{0}' is already running")]
    AlreadyRunning(String),
}

impl RunError {
    /// Text shown in the script's output stream when the run fails
    pub fn user_message(&self) -> String {
        match self {
            Self::Io { source, .. } => format!("Could not write script file: {}", source),
            Self::UnsupportedScriptType(kind) => format!("Unsupported script type '{}'", kind),
            Self::Spawn { executable, source } => {
                format!("Could not start {}: {}", executable, source)
            }
            Self::AlreadyRunning(id) => format!("Script {} is already running", id),
        }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;

/// Extension trait for silent error logging with caller location tracking.
/// Use when the operation is recoverable and the caller doesn't need to know.
///
/// # Examples
///
/// ```ignore
/// use script_shelf::error::ResultExt;
///
/// // A script file that is already gone is not worth failing a run over
/// std::fs::remove_file(&path).warn_on_err();
/// ```
pub trait ResultExt<T> {
    /// Log error with caller location and return None. Use for recoverable failures.
    fn log_err(self) -> Option<T>;
    /// Log as warning with caller location and return None. Use for expected failures.
    fn warn_on_err(self) -> Option<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                error!(
                    error = ?error,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation failed"
                );
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                warn!(
                    error = ?error,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation had warning"
                );
                None
            }
        }
    }
}
