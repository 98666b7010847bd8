//! Persisted script records
//!
//! The shape a script store keeps for each saved script. Records arrive as
//! camelCase JSON; `to_run_request` turns one into something the runner can
//! execute.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::executor::{RunRequest, ScriptType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: String,
    pub category_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
    /// Wire name: "bash", "batch" or "powershell"
    pub script_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    /// Unix epoch milliseconds
    pub created_at: i64,
    pub updated_at: i64,
}

impl Script {
    /// Parse a single record from JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Build the run request for this record.
    ///
    /// Fails with UnsupportedScriptType when `script_type` is not a known name.
    pub fn to_run_request(&self) -> Result<RunRequest> {
        let script_type: ScriptType = self.script_type.parse()?;
        let mut request = RunRequest::new(self.id.clone(), self.content.clone(), script_type);
        if let Some(dir) = self.work_dir.as_deref().filter(|d| !d.trim().is_empty()) {
            request.working_directory = Some(PathBuf::from(dir));
        }
        Ok(request)
    }
}
