//! The per-thread stack of entered portals, and the process-wide list of live
//! portals.
//!
//! Entering a portal pushes it onto the calling thread's [`PortalStack`] and
//! returns a [`PortalGuard`]; dropping the guard pops it again. Entering the
//! portal that is already on top only bumps a re-entry counter, so recursive
//! calls that enter the same portal do not grow the stack.
//!
//! Guards must be released in reverse order of acquisition. Releasing a
//! portal that is not on top of the stack is a programming error: an explicit
//! [`PortalGuard::exit`] reports it as [`Error::StackMisuse`], and a guard
//! dropped out of order panics.
use std::{
    cell::RefCell,
    marker::PhantomData,
    sync::{LazyLock, Mutex, MutexGuard},
};

use tracing::{debug, trace};

use super::{Capability, Portal};
use crate::{
    config::Config,
    error::{Error, Result},
};

thread_local! {
    static STACK: RefCell<PortalStack> = RefCell::new(PortalStack::default());
}

static LIVE: LazyLock<Mutex<Vec<Portal>>> = LazyLock::new(Default::default);
static DEFAULT_LOCK: Mutex<()> = Mutex::new(());

/// A stack of entered portals with re-entry counts.
#[derive(Default, Debug)]
pub struct PortalStack {
    entries: Vec<(Portal, usize)>,
}

impl PortalStack {
    pub fn push(&mut self, portal: &Portal) {
        match self.entries.last_mut() {
            Some((top, depth)) if top.ptr_eq(portal) => *depth += 1,
            _ => self.entries.push((portal.clone(), 1)),
        }
    }

    pub fn pop(&mut self, portal: &Portal) -> Result<()> {
        match self.entries.last_mut() {
            Some((top, depth)) if top.ptr_eq(portal) => {
                *depth -= 1;
                if *depth == 0 {
                    self.entries.pop();
                }
                Ok(())
            }
            Some((top, _)) => Err(Error::StackMisuse(format!(
                "cannot exit {portal:?} while {top:?} is on top of the stack"
            ))),
            None => Err(Error::StackMisuse(format!(
                "cannot exit {portal:?}: the portal stack is empty"
            ))),
        }
    }

    pub fn top(&self) -> Option<&Portal> {
        self.entries.last().map(|(portal, _)| portal)
    }

    /// Number of distinct stack entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every portal on the stack, top first, each listed once.
    pub fn distinct(&self) -> Vec<Portal> {
        let mut seen: Vec<Portal> = Vec::with_capacity(self.entries.len());
        for (portal, _) in self.entries.iter().rev() {
            if !seen.iter().any(|p| p.ptr_eq(portal)) {
                seen.push(portal.clone());
            }
        }
        seen
    }
}

/// Runs `f` with the calling thread's portal stack.
pub fn with_stack<R>(f: impl FnOnce(&mut PortalStack) -> R) -> R {
    STACK.with(|stack| f(&mut stack.borrow_mut()))
}

/// The portals entered on the calling thread, top first, deduplicated.
///
/// Returns an empty list when called while the thread is being torn down.
pub fn entered_portals() -> Vec<Portal> {
    STACK
        .try_with(|stack| {
            stack
                .try_borrow()
                .map(|stack| stack.distinct())
                .unwrap_or_default()
        })
        .unwrap_or_default()
}

/// Releases a portal entered with [`enter`] when dropped.
///
/// The guard is bound to the thread that created it.
#[must_use = "the portal is exited as soon as the guard is dropped"]
pub struct PortalGuard {
    portal: Portal,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl PortalGuard {
    pub fn portal(&self) -> &Portal {
        &self.portal
    }

    /// Exits the portal, reporting out-of-order release instead of panicking.
    pub fn exit(mut self) -> Result<()> {
        self.released = true;
        with_stack(|stack| stack.pop(&self.portal))
    }
}

impl Drop for PortalGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let result = STACK.try_with(|stack| stack.borrow_mut().pop(&self.portal));
        if let Ok(Err(e)) = result {
            if !std::thread::panicking() {
                panic!("{e}");
            }
        }
    }
}

/// Pushes `portal` onto the calling thread's stack.
pub fn enter(portal: &Portal) -> PortalGuard {
    with_stack(|stack| stack.push(portal));
    trace!(portal = ?portal, "entered portal");
    PortalGuard {
        portal: portal.clone(),
        released: false,
        _not_send: PhantomData,
    }
}

/// The portal on top of the calling thread's stack, provided it offers
/// `capability`.
pub fn current_portal(capability: Capability) -> Result<Portal> {
    let portal = with_stack(|stack| stack.top().cloned())
        .ok_or_else(|| Error::StackMisuse("no portal is active on this thread".to_string()))?;
    portal.require(capability)?;
    Ok(portal)
}

/// Resolves the portal an operation should use.
///
/// In order of preference: `suggested`, the portal on top of the calling
/// thread's stack, the most recently opened live portal, and finally a
/// process default opened from `AGORA_*` environment variables.
pub fn best_portal_to_use(suggested: Option<&Portal>) -> Result<Portal> {
    if let Some(portal) = suggested {
        return Ok(portal.clone());
    }
    if let Some(portal) = with_stack(|stack| stack.top().cloned()) {
        return Ok(portal);
    }
    if let Some(portal) = most_recent_live() {
        return Ok(portal);
    }

    let _creating = DEFAULT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(portal) = most_recent_live() {
        return Ok(portal);
    }
    let config = Config::from_env()?;
    debug!(base_dir = %config.base_dir.display(), "opening default portal");
    Portal::open(config)
}

fn live() -> MutexGuard<'static, Vec<Portal>> {
    LIVE.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn register_live(portal: &Portal) {
    live().push(portal.clone());
}

pub(crate) fn forget_live(portal: &Portal) {
    live().retain(|p| !p.ptr_eq(portal));
}

/// Every live portal, oldest first.
pub fn live_portals() -> Vec<Portal> {
    live().clone()
}

fn most_recent_live() -> Option<Portal> {
    live().last().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentry_counts_instead_of_growing() {
        let portal = Portal::in_memory().unwrap();
        let outer = portal.enter();
        let inner = portal.enter();
        assert_eq!(with_stack(|s| s.len()), 1);
        drop(inner);
        assert!(current_portal(Capability::Values).unwrap().ptr_eq(&portal));
        drop(outer);
        assert!(with_stack(|s| s.is_empty()));
        portal.clear().unwrap();
    }

    #[test]
    fn nested_portals_unwind_in_order() {
        let a = Portal::in_memory().unwrap();
        let b = Portal::in_memory().unwrap();
        let ga = a.enter();
        {
            let _gb = b.enter();
            assert!(current_portal(Capability::Execution).unwrap().ptr_eq(&b));
            let entered = entered_portals();
            assert_eq!(entered.len(), 2);
            assert!(entered[0].ptr_eq(&b));
        }
        assert!(current_portal(Capability::Execution).unwrap().ptr_eq(&a));
        ga.exit().unwrap();
        a.clear().unwrap();
        b.clear().unwrap();
    }

    #[test]
    fn out_of_order_exit_is_reported() {
        let a = Portal::in_memory().unwrap();
        let b = Portal::in_memory().unwrap();
        let ga = a.enter();
        let gb = b.enter();
        assert!(matches!(ga.exit(), Err(Error::StackMisuse(_))));
        gb.exit().unwrap();
        // `a` is still on the stack since its release failed.
        with_stack(|s| s.pop(&a)).unwrap();
        a.clear().unwrap();
        b.clear().unwrap();
    }

    #[test]
    #[should_panic(expected = "portal stack misuse")]
    fn out_of_order_drop_panics() {
        let a = Portal::in_memory().unwrap();
        let b = Portal::in_memory().unwrap();
        let ga = a.enter();
        let _gb = b.enter();
        drop(ga);
    }

    #[test]
    fn current_portal_requires_an_entered_portal() {
        assert!(matches!(
            current_portal(Capability::Values),
            Err(Error::StackMisuse(_))
        ));
    }

    #[test]
    fn in_memory_portals_cannot_swarm() {
        let portal = Portal::in_memory().unwrap();
        let _guard = portal.enter();
        assert!(matches!(
            current_portal(Capability::Swarming),
            Err(Error::MissingCapability("swarming"))
        ));
        drop(_guard);
        portal.clear().unwrap();
    }

    #[test]
    fn suggestion_wins_over_stack() {
        let a = Portal::in_memory().unwrap();
        let b = Portal::in_memory().unwrap();
        let _guard = a.enter();
        assert!(best_portal_to_use(Some(&b)).unwrap().ptr_eq(&b));
        assert!(best_portal_to_use(None).unwrap().ptr_eq(&a));
        drop(_guard);
        a.clear().unwrap();
        b.clear().unwrap();
    }
}
