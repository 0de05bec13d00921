//! Swarming: draining the request queue with a pool of worker processes.
//!
//! A portal opened with [`Config::num_background_workers`] greater than zero
//! writes a liveness token for its [`ComputeNode`] into the `compute_nodes`
//! store and re-launches the current executable that many times in the
//! *worker* role. Each worker then loops:
//!
//! 1. stop if the parent's token is gone, if the parent exited, or on Ctrl-C;
//! 2. launch the executable once more in the *poll* role, capturing its
//!    output and enforcing [`Config::attempt_timeout`];
//! 3. the poll process runs a single [`poll_once`] cycle and reports its
//!    [`PollOutcome`] through its exit code;
//! 4. after an idle cycle, sleep for the poll interval, with jitter.
//!
//! Running every attempt in a fresh process isolates workers from crashes,
//! leaks and runaway calls of the functions they run.
//!
//! A worker's stdin is a pipe held open by its parent. When the parent exits
//! without [`Portal::clear`](crate::portal::Portal::clear), even through a
//! panic or a kill, the workers read end of input, remove the parent's token
//! and stop.
//!
//! Programs that swarm must call [`maybe_run_worker`] first thing in `main`,
//! since workers are copies of the program itself:
//!
//! ```no_run
//! use agora::{config::Config, portal::Portal};
//!
//! fn main() -> anyhow::Result<()> {
//!     agora::swarm::maybe_run_worker();
//!
//!     let portal = Portal::open(Config {
//!         num_background_workers: 4,
//!         ..Config::at(".agora")
//!     })?;
//!     // ...
//!     portal.clear()?;
//!     Ok(())
//! }
//! ```
use std::{
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    environment::{ComputeNode, EnvironmentSummary},
    error::{Error, Result},
    storage::{KvStore, StoreKey},
};

mod poll;
mod worker;

pub use poll::{poll_once, PollOutcome};

/// Environment variable naming the role a process was launched in.
pub const ROLE_ENV: &str = "AGORA_WORKER_ROLE";
const PARENT_NODE_ENV: &str = "AGORA_PARENT_NODE";
const PARENT_RUNTIME_ENV: &str = "AGORA_PARENT_RUNTIME";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// The role a process was launched in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    /// A long-lived background worker.
    Worker,
    /// A single poll cycle.
    Poll,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Poll => "poll",
        }
    }

    /// The role of the current process, if it was launched as part of a swarm.
    pub fn current() -> Option<Self> {
        match std::env::var(ROLE_ENV).ok()?.as_str() {
            "worker" => Some(Self::Worker),
            "poll" => Some(Self::Poll),
            _ => None,
        }
    }
}

/// The liveness token a swarming portal keeps in `compute_nodes`.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct NodeToken {
    pub registered_at: DateTime<Utc>,
    pub workers: usize,
    pub environment: EnvironmentSummary,
}

pub(crate) fn token_key(node: &ComputeNode) -> Result<StoreKey> {
    StoreKey::new([node.node_id.as_str(), node.runtime_id.as_str()])
}

fn parent_from_env() -> Option<ComputeNode> {
    Some(ComputeNode {
        node_id: std::env::var(PARENT_NODE_ENV).ok()?,
        runtime_id: std::env::var(PARENT_RUNTIME_ENV).ok()?,
    })
}

/// Builds a command re-launching the current executable in `role`, configured
/// by `config`.
fn relaunch(config: &Config, role: Role, parent: &ComputeNode) -> Result<Command> {
    let exe = std::env::current_exe().map_err(|e| Error::storage("current executable", e))?;
    let mut command = Command::new(exe);
    command
        .env_remove("AGORA_ATTEMPT_TIMEOUT_SECS")
        .envs(config.to_env())
        .env(ROLE_ENV, role.as_str())
        .env(PARENT_NODE_ENV, &parent.node_id)
        .env(PARENT_RUNTIME_ENV, &parent.runtime_id);
    Ok(command)
}

/// Runs the swarm role of this process, if it has one, and exits.
///
/// Returns immediately in processes that were not launched by a swarm.
pub fn maybe_run_worker() {
    let Some(role) = Role::current() else {
        return;
    };
    dotenvy::dotenv().ok();
    crate::init::tracing();

    let code = match run_role(role) {
        Ok(code) => code,
        Err(e) => {
            error!(role = role.as_str(), "worker failed: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run_role(role: Role) -> anyhow::Result<i32> {
    let config = Config::from_env()?.for_worker();
    let parent = parent_from_env()
        .ok_or_else(|| anyhow::anyhow!("launched as a {} without a parent", role.as_str()))?;
    match role {
        Role::Worker => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async {
                worker::worker_loop(config, parent, worker::StopSignals::install()).await
            })?;
            Ok(0)
        }
        Role::Poll => {
            let portal = crate::portal::Portal::open(config)?;
            let outcome = poll_once(&portal)?;
            debug!(?outcome, "poll cycle finished");
            Ok(outcome.exit_code())
        }
    }
}

/// The workers spawned by one portal.
pub(crate) struct SwarmHandle {
    node: ComputeNode,
    children: Vec<Child>,
}

impl SwarmHandle {
    /// Registers the current process as a compute node and spawns
    /// `config.num_background_workers` workers.
    pub(crate) fn launch(config: &Config, nodes: &dyn KvStore) -> Result<Self> {
        let node = ComputeNode::current();
        let token = NodeToken {
            registered_at: Utc::now(),
            workers: config.num_background_workers,
            environment: EnvironmentSummary::capture(),
        };
        nodes.save(&token_key(&node)?, &token)?;

        let mut handle = Self {
            node,
            children: Vec::with_capacity(config.num_background_workers),
        };
        let worker_config = config.for_worker();
        for _ in 0..config.num_background_workers {
            // Workers watch for the end of their stdin to notice that this
            // process is gone.
            let spawned = relaunch(&worker_config, Role::Worker, &handle.node)?
                .stdin(Stdio::piped())
                .spawn();
            match spawned {
                Ok(child) => {
                    debug!(pid = child.id(), "spawned worker");
                    handle.children.push(child);
                }
                Err(e) => {
                    handle.shutdown(nodes);
                    return Err(Error::storage("current executable", e));
                }
            }
        }
        info!(workers = handle.children.len(), "swarm launched");
        Ok(handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn pids(&self) -> Vec<u32> {
        self.children.iter().map(Child::id).collect()
    }

    /// Removes the liveness token and reaps the workers, killing those that
    /// do not wind down within a grace period.
    pub(crate) fn shutdown(&mut self, nodes: &dyn KvStore) {
        match token_key(&self.node).and_then(|key| nodes.delete(&key)) {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to remove compute node token"),
        }

        for child in &mut self.children {
            drop(child.stdin.take());
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for mut child in self.children.drain(..) {
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(pid = child.id(), %status, "worker exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(REAP_INTERVAL),
                    Ok(None) | Err(_) => {
                        warn!(pid = child.id(), "killing worker");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for SwarmHandle {
    fn drop(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{in_memory::InMemoryStore, WriteMode};

    #[test]
    fn role_is_absent_outside_a_swarm() {
        if std::env::var_os(ROLE_ENV).is_none() {
            assert_eq!(Role::current(), None);
        }
    }

    #[test]
    fn token_keys_follow_node_identity() {
        let node = ComputeNode::current();
        let key = token_key(&node).unwrap();
        assert_eq!(key.segments(), [node.node_id.clone(), node.runtime_id.clone()]);
    }

    #[test]
    fn shutdown_removes_the_token() {
        let nodes = InMemoryStore::new(WriteMode::Mutable);
        let node = ComputeNode::current();
        let key = token_key(&node).unwrap();
        nodes
            .set(&key, &crate::serializer::to_bytes(&1u8).unwrap())
            .unwrap();
        let mut handle = SwarmHandle {
            node,
            children: Vec::new(),
        };
        handle.shutdown(&nodes);
        assert!(!nodes.contains(&key).unwrap());
    }
}
