//! Summaries of the process and machine a piece of work ran on.
//!
//! Execution attempts, records and crash entries all carry an
//! [`EnvironmentSummary`], and compute-node liveness tokens are keyed by the
//! [`ComputeNode`] identity of the process that spawned the workers.
use std::{fs, path::PathBuf, sync::LazyLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serializer;

static RUNTIME_ID: LazyLock<String> = LazyLock::new(|| Uuid::new_v4().simple().to_string());

/// The identity of one running process on one machine.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct ComputeNode {
    /// Stable per machine.
    pub node_id: String,
    /// Unique per process.
    pub runtime_id: String,
}

impl ComputeNode {
    /// The identity of the current process.
    pub fn current() -> Self {
        Self {
            node_id: node_id(),
            runtime_id: RUNTIME_ID.clone(),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct EnvironmentSummary {
    pub node: ComputeNode,
    pub hostname: String,
    pub pid: u32,
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub executable: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub captured_at: DateTime<Utc>,
}

impl EnvironmentSummary {
    pub fn capture() -> Self {
        Self {
            node: ComputeNode::current(),
            hostname: hostname(),
            pid: std::process::id(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            executable: std::env::current_exe().ok(),
            working_dir: std::env::current_dir().ok(),
            captured_at: Utc::now(),
        }
    }
}

fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .into_iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn node_id() -> String {
    let fingerprint = format!(
        "{}|{}|{}",
        hostname(),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    serializer::digest(fingerprint.as_bytes())[..16].to_string()
}
