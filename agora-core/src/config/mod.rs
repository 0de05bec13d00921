//! Shared portal configuration.
//!
//! This module introduces types to facilitate the configuration of portals and
//! the worker processes they spawn.
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned with
//!   [`clap`] attributes to allow easy setup via command-line arguments or
//!   environment variables.
//! - [`Backend`]: Enumerates the available storage backends.
//!
//! # Usage:
//! Programs that open portals and the worker processes spawned on their behalf
//! share the same [`Config`]. The parent flattens it into environment
//! variables with [`Config::to_env`], and workers read it back with
//! [`Config::from_env`].
use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, ValueEnum};

use crate::error::{Error, Result};

const DEFAULT_BASE_DIR: &str = ".agora";
const DEFAULT_ISLAND: &str = "main";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_ATTEMPT_BACKOFF_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_CANDIDATES: usize = 10;
const HELP_HEADING: &str = "Agora options";

/// Represents the main configuration structure for a portal.
#[derive(Args, Clone, PartialEq, Debug)]
pub struct Config {
    /// Root directory of the persistent stores (file backend only).
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_BASE_DIR", default_value = DEFAULT_BASE_DIR)]
    pub base_dir: PathBuf,

    /// Specifies the storage backend to use.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_BACKEND", value_enum, default_value_t = Backend::File)]
    pub backend: Backend,

    /// Number of background worker processes to spawn when the portal opens.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_NUM_WORKERS", default_value_t = 0)]
    pub num_background_workers: usize,

    /// Island assigned to functions that do not name one.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_DEFAULT_ISLAND", default_value = DEFAULT_ISLAND)]
    pub default_island: String,

    /// Probability, in `[0, 1]`, of auditing a duplicate write or a cache hit
    /// against a fresh value.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_CONSISTENCY_CHECKS", default_value_t = 0.0)]
    pub p_consistency_checks: f64,

    /// Attempts after which a failing call is no longer retried.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Base of the exponential backoff between attempts, in milliseconds.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_BACKOFF_BASE_MS", default_value_t = DEFAULT_ATTEMPT_BACKOFF_MS)]
    pub attempt_backoff_ms: u64,

    /// Sleep between idle worker poll cycles, in milliseconds.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Number of queued requests a worker considers per poll cycle.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_MAX_CANDIDATES", default_value_t = DEFAULT_MAX_CANDIDATES)]
    pub max_candidates: usize,

    /// Wall-clock limit for one worker poll cycle, in seconds.
    #[arg(long, help_heading = HELP_HEADING, env = "AGORA_ATTEMPT_TIMEOUT_SECS")]
    pub attempt_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            backend: Default::default(),
            num_background_workers: 0,
            default_island: DEFAULT_ISLAND.to_string(),
            p_consistency_checks: 0.0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_backoff_ms: DEFAULT_ATTEMPT_BACKOFF_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            attempt_timeout_secs: None,
        }
    }
}

/// Enumerates the available storage backends.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Backend {
    /// A directory of files, shareable between processes.
    #[default]
    File,
    /// Process-local maps. Useful for tests; cannot back a swarm.
    InMemory,
}

impl Backend {
    fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::InMemory => "in-memory",
        }
    }
}

#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct EnvOnly {
    #[command(flatten)]
    config: Config,
}

impl Config {
    /// Short-hand for a file-backed configuration rooted at `base_dir`.
    pub fn at(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Short-hand for an in-memory configuration.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::InMemory,
            ..Default::default()
        }
    }

    /// Builds a configuration from `AGORA_*` environment variables, falling back
    /// to defaults.
    pub fn from_env() -> Result<Self> {
        let parsed = EnvOnly::try_parse_from(std::iter::empty::<String>())
            .map_err(|e| Error::Config(e.to_string()))?;
        parsed.config.validate()?;
        Ok(parsed.config)
    }

    /// Checks the invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.p_consistency_checks) {
            return Err(Error::Config(format!(
                "p_consistency_checks must be within [0, 1], got {}",
                self.p_consistency_checks
            )));
        }
        if self.num_background_workers > 0 && self.backend != Backend::File {
            return Err(Error::Config(
                "background workers require the file backend".to_string(),
            ));
        }
        if self.max_candidates == 0 {
            return Err(Error::Config("max_candidates must be positive".to_string()));
        }
        if self.default_island.is_empty() {
            return Err(Error::Config("default_island must not be empty".to_string()));
        }
        Ok(())
    }

    /// Flattens the configuration into the environment variables
    /// [`Config::from_env`] reads.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("AGORA_BASE_DIR", self.base_dir.display().to_string()),
            ("AGORA_BACKEND", self.backend.as_str().to_string()),
            (
                "AGORA_NUM_WORKERS",
                self.num_background_workers.to_string(),
            ),
            ("AGORA_DEFAULT_ISLAND", self.default_island.clone()),
            (
                "AGORA_CONSISTENCY_CHECKS",
                self.p_consistency_checks.to_string(),
            ),
            ("AGORA_MAX_ATTEMPTS", self.max_attempts.to_string()),
            ("AGORA_BACKOFF_BASE_MS", self.attempt_backoff_ms.to_string()),
            ("AGORA_POLL_INTERVAL_MS", self.poll_interval_ms.to_string()),
            ("AGORA_MAX_CANDIDATES", self.max_candidates.to_string()),
        ];
        if let Some(secs) = self.attempt_timeout_secs {
            env.push(("AGORA_ATTEMPT_TIMEOUT_SECS", secs.to_string()));
        }
        env
    }

    /// The configuration handed to spawned workers. Workers never spawn
    /// workers of their own.
    pub fn for_worker(&self) -> Self {
        Self {
            num_background_workers: 0,
            ..self.clone()
        }
    }

    pub fn attempt_backoff(&self) -> Duration {
        Duration::from_millis(self.attempt_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.attempt_backoff(), Duration::from_secs(10));
        assert_eq!(config.backend, Backend::File);
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let config = Config {
            p_consistency_checks: 1.5,
            ..Config::in_memory()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_workers_on_in_memory_backend() {
        let config = Config {
            num_background_workers: 2,
            ..Config::in_memory()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn env_round_trip_through_clap() {
        let config = Config {
            base_dir: PathBuf::from("/tmp/agora-test"),
            num_background_workers: 3,
            default_island: "science".to_string(),
            p_consistency_checks: 0.25,
            attempt_timeout_secs: Some(30),
            ..Default::default()
        };
        let mut args = Vec::new();
        for (key, value) in config.to_env() {
            let flag = match key {
                "AGORA_BASE_DIR" => "--base-dir",
                "AGORA_BACKEND" => "--backend",
                "AGORA_NUM_WORKERS" => "--num-background-workers",
                "AGORA_DEFAULT_ISLAND" => "--default-island",
                "AGORA_CONSISTENCY_CHECKS" => "--p-consistency-checks",
                "AGORA_MAX_ATTEMPTS" => "--max-attempts",
                "AGORA_BACKOFF_BASE_MS" => "--attempt-backoff-ms",
                "AGORA_POLL_INTERVAL_MS" => "--poll-interval-ms",
                "AGORA_MAX_CANDIDATES" => "--max-candidates",
                "AGORA_ATTEMPT_TIMEOUT_SECS" => "--attempt-timeout-secs",
                other => panic!("unexpected key {other}"),
            };
            args.push(flag.to_string());
            args.push(value);
        }
        let parsed = EnvOnly::try_parse_from(args).unwrap();
        assert_eq!(parsed.config, config);
    }

    #[test]
    fn worker_config_never_spawns_workers() {
        let config = Config {
            num_background_workers: 4,
            ..Default::default()
        };
        assert_eq!(config.for_worker().num_background_workers, 0);
        assert_eq!(config.for_worker().base_dir, config.base_dir);
    }
}
