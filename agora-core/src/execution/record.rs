use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ExecutionResultAddr;
use crate::{
    audit::{CrashEntry, EventEntry},
    content::ValueAddr,
    environment::EnvironmentSummary,
};

/// Written when an attempt starts.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct ExecutionAttempt {
    pub attempt_id: String,
    pub started_at: DateTime<Utc>,
    pub environment: EnvironmentSummary,
}

/// Standard streams captured during an attempt, or of a whole poll process
/// when its worker captured them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code of the poll process. `None` for output captured in-process,
    /// and for poll processes killed after timing out.
    pub exit_code: Option<i32>,
}

/// Written once when an attempt ends. Never mutated.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct ExecutionRecord {
    pub attempt_id: String,
    pub address: ExecutionResultAddr,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub environment: EnvironmentSummary,
    /// Stdout and stderr of the attempt. `None` when another capture was
    /// already active.
    pub output: Option<CapturedOutput>,
    pub crashes: Vec<CrashEntry>,
    pub events: Vec<EventEntry>,
    /// The published result, on success.
    pub result: Option<ValueAddr>,
}

impl ExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.result.is_some()
    }
}
