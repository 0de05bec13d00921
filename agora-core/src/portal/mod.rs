//! Portals: the storage contexts everything else runs in.
//!
//! A [`Portal`] wraps one root store, selected by [`Config::backend`], and the
//! sub-stores derived from it:
//!
//! | sub-store            | key                          | mode      |
//! |----------------------|------------------------------|-----------|
//! | `value_store`        | `prefix / hash`              | immutable |
//! | `execution_results`  | `prefix / hash`              | immutable |
//! | `execution_requests` | `prefix / hash`              | mutable   |
//! | `execution_attempts` | `prefix / hash / attempt`    | immutable |
//! | `execution_records`  | `prefix / hash / attempt`    | immutable |
//! | `execution_outputs`  | `attempt`                    | immutable |
//! | `crash_history`      | `date / id`                  | immutable |
//! | `event_log`          | `date / id`                  | immutable |
//! | `compute_nodes`      | `node / runtime`             | mutable   |
//!
//! Portals are cheap to clone; clones share state and compare equal by
//! identity ([`Portal::ptr_eq`]). Opening a portal registers it as *live* until
//! [`Portal::clear`] destroys it. Live portals serve each other's values (see
//! [`content`](crate::content)) and back [`stack::best_portal_to_use`].
//!
//! # Example
//!
//! ```
//! use agora::{config::Config, portal::Portal};
//!
//! # fn main() -> agora::error::Result<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let portal = Portal::open(Config::at(dir.path()))?;
//! let addr = portal.put("hello")?;
//! {
//!     let _guard = portal.enter();
//!     // Code running here resolves `portal` as the current portal.
//! }
//! println!("{}", portal.describe()?);
//! portal.clear()?;
//! # Ok(())
//! # }
//! ```
use std::{
    collections::BTreeSet,
    fmt,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tracing::{info, instrument, warn};

use crate::{
    audit::{self, AuditLog},
    config::{Backend, Config},
    content::{ValueAddr, VerifiedStore},
    error::{Error, Result},
    function::registry::FunctionRegistry,
    storage::{self, KvStore, StoreKey, WriteMode},
    swarm::SwarmHandle,
};

pub mod stack;

pub use stack::{best_portal_to_use, current_portal, PortalGuard};

/// Something a portal can do.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Capability {
    /// Store and read content-addressed values.
    Values,
    /// Record crashes and events.
    Audit,
    /// Register functions.
    Registry,
    /// Execute and cache calls.
    Execution,
    /// Share the request queue with worker processes.
    Swarming,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Values => "values",
            Self::Audit => "audit",
            Self::Registry => "registry",
            Self::Execution => "execution",
            Self::Swarming => "swarming",
        }
    }
}

pub(crate) struct PortalInner {
    pub(crate) config: Config,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) values: VerifiedStore,
    pub(crate) results: VerifiedStore,
    pub(crate) requests: Arc<dyn KvStore>,
    pub(crate) attempts: Arc<dyn KvStore>,
    pub(crate) records: Arc<dyn KvStore>,
    pub(crate) outputs: Arc<dyn KvStore>,
    pub(crate) compute_nodes: Arc<dyn KvStore>,
    pub(crate) audit: AuditLog,
    pub(crate) registry: FunctionRegistry,
    pub(crate) known_values: DashSet<ValueAddr>,
    pub(crate) swarm: Mutex<Option<SwarmHandle>>,
}

impl Drop for PortalInner {
    fn drop(&mut self) {
        let handle = self
            .swarm
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            handle.shutdown(self.compute_nodes.as_ref());
        }
    }
}

/// A storage context. See the [module level documentation](self).
#[derive(Clone)]
pub struct Portal {
    pub(crate) inner: Arc<PortalInner>,
}

impl Portal {
    /// Opens a portal.
    ///
    /// Registers every function declared with the function attribute, installs
    /// the crash-recording panic hook, and spawns background workers when
    /// [`Config::num_background_workers`] is positive.
    #[instrument(skip_all, level = "debug", fields(base_dir = %config.base_dir.display()))]
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let p = config.p_consistency_checks;
        let open = |name: &str, mode| storage::open(&config, name, mode);

        let inner = PortalInner {
            values: VerifiedStore::new(open("value_store", WriteMode::Immutable)?, p),
            results: VerifiedStore::new(open("execution_results", WriteMode::Immutable)?, p),
            requests: open("execution_requests", WriteMode::Mutable)?,
            attempts: open("execution_attempts", WriteMode::Immutable)?,
            records: open("execution_records", WriteMode::Immutable)?,
            outputs: open("execution_outputs", WriteMode::Immutable)?,
            compute_nodes: open("compute_nodes", WriteMode::Mutable)?,
            audit: AuditLog::open(&config)?,
            registry: FunctionRegistry::default(),
            known_values: DashSet::new(),
            swarm: Mutex::new(None),
            created_at: Utc::now(),
            config,
        };
        let portal = Self {
            inner: Arc::new(inner),
        };

        let registered = portal
            .inner
            .registry
            .register_catalogue(&portal.inner.config.default_island)?;
        audit::install_panic_hook();
        stack::register_live(&portal);

        if portal.inner.config.num_background_workers > 0 {
            if let Err(e) = portal.launch_swarm() {
                stack::forget_live(&portal);
                return Err(e);
            }
        }

        info!(
            backend = ?portal.inner.config.backend,
            functions = registered,
            workers = portal.inner.config.num_background_workers,
            "opened portal"
        );
        Ok(portal)
    }

    /// Opens a process-local portal.
    pub fn in_memory() -> Result<Self> {
        Self::open(Config::in_memory())
    }

    fn launch_swarm(&self) -> Result<()> {
        let handle = SwarmHandle::launch(&self.inner.config, self.inner.compute_nodes.as_ref())?;
        *self.inner.swarm.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.config.base_dir
    }

    pub fn ptr_eq(&self, other: &Portal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Makes this portal the current one on the calling thread until the guard
    /// is dropped.
    pub fn enter(&self) -> PortalGuard {
        stack::enter(self)
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut capabilities = vec![
            Capability::Values,
            Capability::Audit,
            Capability::Registry,
            Capability::Execution,
        ];
        if self.inner.config.backend == Backend::File {
            capabilities.push(Capability::Swarming);
        }
        capabilities
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(Error::MissingCapability(capability.name()))
        }
    }

    /// Number of background workers this portal spawned.
    pub fn background_workers(&self) -> usize {
        self.inner
            .swarm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, SwarmHandle::len)
    }

    /// Process ids of the background workers this portal spawned.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.inner
            .swarm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or_else(Vec::new, SwarmHandle::pids)
    }

    /// Compute nodes whose liveness token is present.
    pub fn live_compute_nodes(&self) -> Result<usize> {
        self.inner.compute_nodes.count(&StoreKey::root())
    }

    /// Summarizes the contents of this portal.
    pub fn describe(&self) -> Result<PortalSummary> {
        let root = StoreKey::root();
        Ok(PortalSummary {
            base_dir: self.inner.config.base_dir.display().to_string(),
            backend: self.inner.config.backend,
            created_at: self.inner.created_at,
            stored_values: self.inner.values.inner().count(&root)?,
            cached_results: self.inner.results.inner().count(&root)?,
            queued_requests: self.inner.requests.count(&root)?,
            attempts: self.inner.attempts.count(&root)?,
            records: self.inner.records.count(&root)?,
            crashes: self.inner.audit.crash_count()?,
            events: self.inner.audit.event_count()?,
            islands: self.inner.registry.islands(),
            functions: self.inner.registry.function_count(),
            compute_nodes: self.live_compute_nodes()?,
            background_workers: self.background_workers(),
        })
    }

    /// Destroys the portal: stops its workers, deletes everything it stored,
    /// and removes it from the live portals.
    #[instrument(skip_all, level = "debug", fields(base_dir = %self.base_dir().display()))]
    pub fn clear(&self) -> Result<()> {
        let handle = self
            .inner
            .swarm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            handle.shutdown(self.inner.compute_nodes.as_ref());
        }
        stack::forget_live(self);

        let stores: [&dyn KvStore; 7] = [
            self.inner.values.inner().as_ref(),
            self.inner.results.inner().as_ref(),
            self.inner.requests.as_ref(),
            self.inner.attempts.as_ref(),
            self.inner.records.as_ref(),
            self.inner.outputs.as_ref(),
            self.inner.compute_nodes.as_ref(),
        ];
        for store in stores {
            if let Err(e) = store.clear() {
                warn!(error = %e, "failed to clear store");
                return Err(e);
            }
        }
        self.inner.audit.clear()?;
        self.inner.known_values.clear();
        Ok(())
    }
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal")
            .field("backend", &self.inner.config.backend)
            .field("base_dir", &self.inner.config.base_dir)
            .field("id", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// Counts of what a portal holds. Displays as a table.
#[derive(Clone, PartialEq, Debug)]
pub struct PortalSummary {
    pub base_dir: String,
    pub backend: Backend,
    pub created_at: DateTime<Utc>,
    pub stored_values: usize,
    pub cached_results: usize,
    pub queued_requests: usize,
    pub attempts: usize,
    pub records: usize,
    pub crashes: usize,
    pub events: usize,
    pub islands: BTreeSet<String>,
    pub functions: usize,
    pub compute_nodes: usize,
    pub background_workers: usize,
}

impl fmt::Display for PortalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let islands = self.islands.iter().cloned().collect::<Vec<_>>().join(", ");
        let rows: [(&str, String); 14] = [
            ("base directory", self.base_dir.clone()),
            ("backend", format!("{:?}", self.backend)),
            ("opened at", self.created_at.to_rfc3339()),
            ("stored values", self.stored_values.to_string()),
            ("cached results", self.cached_results.to_string()),
            ("queued requests", self.queued_requests.to_string()),
            ("attempts", self.attempts.to_string()),
            ("records", self.records.to_string()),
            ("crashes", self.crashes.to_string()),
            ("events", self.events.to_string()),
            ("islands", islands),
            ("functions", self.functions.to_string()),
            ("compute nodes", self.compute_nodes.to_string()),
            ("background workers", self.background_workers.to_string()),
        ];
        let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
        for (label, value) in rows {
            writeln!(f, "{label:<width$} | {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{function::Function, function::Value, kwargs};

    #[test]
    fn describe_counts_contents() {
        let portal = Portal::in_memory().unwrap();
        let identity = Function::new("identity_described", "fn identity(x) { x }", |_, kwargs| {
            kwargs.get::<Value>("x").map_err(Into::into)
        });
        portal
            .execute::<u64>(&identity, kwargs! { x = 3u64 }.unwrap())
            .unwrap();
        portal.log_event("done").unwrap();

        let summary = portal.describe().unwrap();
        assert_eq!(summary.cached_results, 1);
        assert_eq!(summary.queued_requests, 0);
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.records, 1);
        assert_eq!(summary.events, 1);
        assert!(summary.functions >= 1);
        assert!(summary.islands.contains("main"));
        assert_eq!(summary.background_workers, 0);
        assert!(summary.to_string().contains("cached results"));
        portal.clear().unwrap();
    }

    #[test]
    fn clear_removes_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        let portal = Portal::open(Config::at(dir.path())).unwrap();
        portal.put(&1u8).unwrap();
        portal.log_event("x").unwrap();
        portal.clear().unwrap();
        assert!(!stack::live_portals().iter().any(|p| p.ptr_eq(&portal)));
        let summary = portal.describe().unwrap();
        assert_eq!(summary.stored_values, 0);
        assert_eq!(summary.events, 0);
    }

    #[test]
    fn file_portals_can_swarm() {
        let dir = tempfile::TempDir::new().unwrap();
        let portal = Portal::open(Config::at(dir.path())).unwrap();
        assert!(portal.has(Capability::Swarming));
        portal.clear().unwrap();
        let portal = Portal::in_memory().unwrap();
        assert!(!portal.has(Capability::Swarming));
        assert!(portal.require(Capability::Execution).is_ok());
        portal.clear().unwrap();
    }
}
