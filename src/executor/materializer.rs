//! Script materialization
//!
//! Writes script text to a uniquely named file in the transient directory so
//! an interpreter can execute it. The file name convention
//! `script_<scriptId>_<timestamp>.<ext>` is what the startup/shutdown sweep
//! uses to recognise leftovers, so `materialized_file_name` and
//! `is_materialized_file_name` must stay in agreement.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::script_type::ScriptType;
use crate::error::{Result, RunError};

const FILE_PREFIX: &str = "script_";

/// Batch preamble: no command echo, UTF-8 code page
const BATCH_PREAMBLE: &str = "@echo off\r\nchcp 65001 >nul\r\n";

/// How many times a name collision with a foreign file is retried
const MAX_CREATE_ATTEMPTS: u32 = 8;

/// Last timestamp handed out, so names stay unique within a process
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// A script written to disk for a single run.
///
/// Deliberately not `Clone`: exactly one owner is responsible for deleting it.
#[derive(Debug)]
pub struct MaterializedScript {
    path: PathBuf,
    script_id: String,
    script_type: ScriptType,
}

impl MaterializedScript {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }
}

/// Write `content` for `script_id` into `dir` and return the owned file.
pub fn materialize(
    dir: &Path,
    script_id: &str,
    content: &str,
    script_type: ScriptType,
) -> Result<MaterializedScript> {
    let body = prepare_content(content, script_type);

    let mut attempt = 0;
    loop {
        let path = dir.join(materialized_file_name(script_id, next_stamp(), script_type));
        match write_new_file(&path, body.as_bytes()) {
            Ok(()) => {
                debug!(path = %path.display(), script_id, "Materialized script");
                return Ok(MaterializedScript {
                    path,
                    script_id: script_id.to_string(),
                    script_type,
                });
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::AlreadyExists
                    && attempt + 1 < MAX_CREATE_ATTEMPTS =>
            {
                attempt += 1;
            }
            Err(source) => return Err(RunError::Io { path, source }),
        }
    }
}

/// Apply the per-type encoding and line-ending transform
pub fn prepare_content(content: &str, script_type: ScriptType) -> String {
    match script_type {
        ScriptType::WindowsBatch => {
            let normalized = content.replace("\r\n", "\n").replace('\n', "\r\n");
            format!("{}{}", BATCH_PREAMBLE, normalized)
        }
        ScriptType::WindowsPowerShell | ScriptType::PosixShell => content.to_string(),
    }
}

/// Build the file name for a materialized script
pub fn materialized_file_name(script_id: &str, stamp: u64, script_type: ScriptType) -> String {
    format!(
        "{}{}_{}.{}",
        FILE_PREFIX,
        sanitize_id(script_id),
        stamp,
        script_type.extension()
    )
}

/// Whether `name` follows the materialized script naming convention
pub fn is_materialized_file_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(FILE_PREFIX) else {
        return false;
    };
    let Some((stem, ext)) = rest.rsplit_once('.') else {
        return false;
    };
    if !ScriptType::ALL.iter().any(|t| t.extension() == ext) {
        return false;
    }
    let Some((id, stamp)) = stem.rsplit_once('_') else {
        return false;
    };
    !id.is_empty() && !stamp.is_empty() && stamp.bytes().all(|b| b.is_ascii_digit())
}

/// Keep ids filesystem-safe; anything outside [A-Za-z0-9_-] becomes '-'
fn sanitize_id(script_id: &str) -> String {
    let cleaned: String = script_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "script".to_string()
    } else {
        cleaned
    }
}

/// Nanosecond wall-clock stamp, bumped so it strictly increases per process
fn next_stamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o755);
    }

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.flush()?;

    // The process umask may have stripped bits from the create mode
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}
