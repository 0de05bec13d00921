//! Append-only crash history and event log.
//!
//! Both streams are stored in immutable stores keyed by
//! `(UTC date "YYYY-MM-DD", id)`. Ids default to the time of day followed by a
//! random suffix, so entries sort chronologically within a day.
//!
//! # Panics
//!
//! Opening a portal installs a process-wide panic hook (once). When a thread
//! panics, the hook writes a [`CrashEntry`] into the crash history of every
//! portal entered on that thread's stack, each exactly once, marks the panic as
//! logged so the execution layer does not record it a second time, and then
//! defers to the previously installed hook. Panics raised while guards run are
//! left out of the crash history.
use std::{
    any::Any,
    cell::{Cell, RefCell},
    sync::{Arc, Once},
};

use chrono::{DateTime, Utc};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    environment::EnvironmentSummary,
    error::Result,
    portal::{stack, Portal},
    serializer,
    storage::{self, KvStore, StoreKey, WriteMode},
};

thread_local! {
    static PANIC_LOGGED: Cell<bool> = const { Cell::new(false) };
    static QUIET: Cell<u32> = const { Cell::new(0) };
    static COLLECTORS: RefCell<Vec<Vec<EventEntry>>> = const { RefCell::new(Vec::new()) };
}

static INSTALL_HOOK: Once = Once::new();

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum CrashKind {
    Panic,
    Error,
}

/// One entry of the crash history.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct CrashEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: CrashKind,
    pub message: String,
    /// Causes of the error, outermost first.
    pub chain: Vec<String>,
    pub location: Option<String>,
    /// What was running when the crash happened, typically an execution
    /// address.
    pub context: Option<String>,
    pub environment: EnvironmentSummary,
}

impl CrashEntry {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: CrashKind::Error,
            message: err.to_string(),
            chain: err.chain().skip(1).map(ToString::to_string).collect(),
            location: None,
            context: None,
            environment: EnvironmentSummary::capture(),
        }
    }

    pub fn from_panic(message: String, location: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: CrashKind::Panic,
            message,
            chain: Vec::new(),
            location,
            context: None,
            environment: EnvironmentSummary::capture(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// One entry of the event log.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct EventEntry {
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// The crash history and event log of one portal.
#[derive(Debug, Clone)]
pub struct AuditLog {
    crashes: Arc<dyn KvStore>,
    events: Arc<dyn KvStore>,
}

fn entry_key(timestamp: &DateTime<Utc>, id: Option<&str>) -> Result<StoreKey> {
    let id = match id {
        Some(id) => id.to_string(),
        None => format!(
            "{}-{}",
            timestamp.format("%H%M%S%.6f").to_string().replace('.', "-"),
            &Uuid::new_v4().simple().to_string()[..8]
        ),
    };
    StoreKey::new([timestamp.format("%Y-%m-%d").to_string(), id])
}

impl AuditLog {
    pub(crate) fn open(config: &Config) -> Result<Self> {
        Ok(Self {
            crashes: storage::open(config, "crash_history", WriteMode::Immutable)?,
            events: storage::open(config, "event_log", WriteMode::Immutable)?,
        })
    }

    /// Appends a crash, keyed by `id` when given.
    #[instrument(skip_all, level = "debug", fields(message = %entry.message))]
    pub fn log_crash(&self, entry: &CrashEntry, id: Option<&str>) -> Result<StoreKey> {
        let key = entry_key(&entry.timestamp, id)?;
        self.crashes.save(&key, entry)?;
        Ok(key)
    }

    pub fn log_event(&self, entry: &EventEntry) -> Result<StoreKey> {
        let key = entry_key(&entry.timestamp, None)?;
        self.events.save(&key, entry)?;
        Ok(key)
    }

    pub fn crash_count(&self) -> Result<usize> {
        self.crashes.count(&StoreKey::root())
    }

    pub fn event_count(&self) -> Result<usize> {
        self.events.count(&StoreKey::root())
    }

    /// Every crash, oldest first.
    pub fn crashes(&self) -> Result<Vec<CrashEntry>> {
        read_all(self.crashes.as_ref())
    }

    /// Every event, oldest first.
    pub fn events(&self) -> Result<Vec<EventEntry>> {
        read_all(self.events.as_ref())
    }

    pub(crate) fn clear(&self) -> Result<()> {
        self.crashes.clear()?;
        self.events.clear()
    }
}

fn read_all<T: serde::de::DeserializeOwned>(store: &dyn KvStore) -> Result<Vec<T>> {
    let mut entries = Vec::new();
    for key in store.keys(&StoreKey::root())? {
        if let Some(entry) = store.load(&key)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

impl Portal {
    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// Appends an event to this portal's event log. Events logged while a call
    /// executes are also attached to its execution record.
    pub fn log_event<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let entry = EventEntry {
            timestamp: Utc::now(),
            payload: serializer::to_value(payload)?,
        };
        self.inner.audit.log_event(&entry)?;
        let _ = COLLECTORS.try_with(|collectors| {
            if let Some(current) = collectors.borrow_mut().last_mut() {
                current.push(entry);
            }
        });
        Ok(())
    }
}

/// Collects the events logged on this thread until finished.
pub(crate) struct EventCapture {
    finished: bool,
}

impl EventCapture {
    pub(crate) fn start() -> Self {
        COLLECTORS.with(|c| c.borrow_mut().push(Vec::new()));
        Self { finished: false }
    }

    pub(crate) fn finish(mut self) -> Vec<EventEntry> {
        self.finished = true;
        COLLECTORS
            .try_with(|c| c.borrow_mut().pop())
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}

impl Drop for EventCapture {
    fn drop(&mut self) {
        if !self.finished {
            let _ = COLLECTORS.try_with(|c| c.borrow_mut().pop());
        }
    }
}

/// Runs `f` with the panic hook's crash logging turned off on this thread.
pub(crate) fn quietly<T>(f: impl FnOnce() -> T) -> T {
    struct Restore;
    impl Drop for Restore {
        fn drop(&mut self) {
            let _ = QUIET.try_with(|quiet| quiet.set(quiet.get().saturating_sub(1)));
        }
    }

    QUIET.with(|quiet| quiet.set(quiet.get() + 1));
    let _restore = Restore;
    f()
}

/// Clears and returns whether the panic hook logged a panic on this thread.
pub(crate) fn take_panic_logged() -> bool {
    PANIC_LOGGED.with(|flag| flag.replace(false))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Installs the crash-forwarding panic hook, once per process.
pub(crate) fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let quiet = QUIET.try_with(Cell::get).unwrap_or(0) > 0;
            let portals = if quiet { Vec::new() } else { stack::entered_portals() };
            if !portals.is_empty() {
                let entry = CrashEntry::from_panic(
                    panic_message(info.payload()),
                    info.location().map(ToString::to_string),
                );
                for portal in &portals {
                    if let Err(e) = portal.audit().log_crash(&entry, None) {
                        warn!(error = %e, "failed to record panic in crash history");
                    }
                }
                let _ = PANIC_LOGGED.try_with(|flag| flag.set(true));
            }
            previous(info);
        }));
    });
}
