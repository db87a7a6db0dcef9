//! Agent status documents.
//!
//! After each iteration the agent is expected to have written `status.json`
//! next to its context document. The engine validates it here; a missing or
//! malformed document is synthesized as an `error` status by the caller —
//! never guessed as `continue`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::state::HistoryPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Continue,
    Stop,
    Error,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Continue => "continue",
            Decision::Stop => "stop",
            Decision::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkReport {
    #[serde(default)]
    pub items_completed: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDoc {
    pub decision: Decision,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub work: WorkReport,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Why a status document could not be used as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusProblem {
    Missing,
    Invalid(String),
}

/// Read and validate an agent-written status document.
pub fn read_status(path: &Path) -> Result<StatusDoc, StatusProblem> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StatusProblem::Missing),
        Err(e) => return Err(StatusProblem::Invalid(e.to_string())),
    };
    serde_json::from_str(&contents).map_err(|e| StatusProblem::Invalid(e.to_string()))
}

/// Build the replacement status for an iteration that produced no usable one.
pub fn synthesize_error(reason: &str, detail: &str) -> StatusDoc {
    StatusDoc {
        decision: Decision::Error,
        reason: reason.to_string(),
        summary: detail.to_string(),
        work: WorkReport::default(),
        errors: vec![detail.to_string()],
        timestamp: Some(Utc::now()),
    }
}

impl StatusDoc {
    /// The fields the state store appends to history for this iteration.
    pub fn history_payload(&self) -> HistoryPayload {
        HistoryPayload {
            decision: self.decision.as_str().to_string(),
            reason: self.reason.clone(),
            summary: self.summary.clone(),
            files_touched: self.work.files_touched.clone(),
            items_completed: self.work.items_completed.clone(),
            errors: self.errors.clone(),
        }
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        crate::fsutil::write_json_atomic(path, self)
    }
}
