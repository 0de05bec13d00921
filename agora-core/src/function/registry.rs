//! The island-namespaced function catalogue of a portal.
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, OnceLock},
};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{Function, FunctionDescriptor, Kwargs};
use crate::{
    content::ValueAddr,
    error::{Error, Result},
    portal::Portal,
};

/// A function as registered under `(island, name)`.
#[derive(Debug)]
pub struct RegisteredFunction {
    descriptor: FunctionDescriptor,
    function: Function,
    transitive: OnceLock<BTreeSet<String>>,
}

impl RegisteredFunction {
    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn function(&self) -> &Function {
        &self.function
    }
}

#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: DashMap<(String, String), Arc<RegisteredFunction>>,
}

impl FunctionRegistry {
    /// Registers `function`, placing it in `default_island` unless it names an
    /// island of its own.
    ///
    /// Registering the same `(island, name)` again is a no-op when the source
    /// and dependency set are identical, and a
    /// [`RegistrationConflict`](Error::RegistrationConflict) otherwise.
    #[instrument(skip_all, level = "debug", fields(name = %function.name()))]
    pub fn register(&self, function: &Function, default_island: &str) -> Result<Arc<RegisteredFunction>> {
        let descriptor = function.descriptor(default_island);
        let key = (descriptor.island.clone(), descriptor.name.clone());
        match self.functions.entry(key) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                if existing.descriptor.source != descriptor.source
                    || existing.descriptor.dependencies != descriptor.dependencies
                {
                    return Err(Error::RegistrationConflict {
                        island: descriptor.island,
                        name: descriptor.name,
                    });
                }
                Ok(existing.clone())
            }
            Entry::Vacant(entry) => {
                debug!(island = %descriptor.island, "registered function");
                let registered = Arc::new(RegisteredFunction {
                    descriptor,
                    function: function.unfixed(),
                    transitive: OnceLock::new(),
                });
                entry.insert(registered.clone());
                Ok(registered)
            }
        }
    }

    pub fn lookup(&self, island: &str, name: &str) -> Option<Arc<RegisteredFunction>> {
        self.functions
            .get(&(island.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Every registered function reachable from `(island, name)` through
    /// declared dependencies, excluding the function itself.
    ///
    /// Computed once per registered function. Cycles are tolerated.
    pub fn transitive_dependencies(&self, island: &str, name: &str) -> Result<BTreeSet<String>> {
        let registered = self
            .lookup(island, name)
            .ok_or_else(|| Error::UnknownFunction {
                island: island.to_string(),
                name: name.to_string(),
            })?;
        Ok(registered
            .transitive
            .get_or_init(|| self.reachable(island, name, &registered.descriptor.dependencies))
            .clone())
    }

    fn reachable(&self, island: &str, root: &str, direct: &BTreeSet<String>) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<String> = direct.iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if name == root || visited.contains(&name) {
                continue;
            }
            if let Some(callee) = self.lookup(island, &name) {
                queue.extend(callee.descriptor.dependencies.iter().cloned());
                visited.insert(name);
            }
        }
        visited
    }

    pub fn islands(&self) -> BTreeSet<String> {
        self.functions.iter().map(|e| e.key().0.clone()).collect()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Registers every function declared with the function attribute.
    pub(crate) fn register_catalogue(&self, default_island: &str) -> Result<usize> {
        let mut count = 0;
        for declared in crate::__private::FUNCTIONS.iter() {
            self.register(&declared.function(), default_island)?;
            count += 1;
        }
        Ok(count)
    }
}

/// The identity of a function: what its address is computed from.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct FunctionSnapshot {
    pub descriptor: FunctionDescriptor,
    /// Normalized sources of every transitive dependency, by name.
    pub dependency_sources: BTreeMap<String, String>,
    /// Addresses of the arguments fixed by partial application.
    pub fixed_kwargs: BTreeMap<String, ValueAddr>,
}

impl Portal {
    pub fn registry(&self) -> &FunctionRegistry {
        &self.inner.registry
    }

    /// Registers `function` in this portal.
    pub fn register(&self, function: &Function) -> Result<Arc<RegisteredFunction>> {
        self.inner
            .registry
            .register(function, &self.config().default_island)
    }

    /// Registers `function` if needed and captures its identity.
    pub fn snapshot(&self, function: &Function) -> Result<FunctionSnapshot> {
        let registered = self.register(function)?;
        let descriptor = registered.descriptor().clone();
        let registry = &self.inner.registry;
        let mut dependency_sources = BTreeMap::new();
        for name in registry.transitive_dependencies(&descriptor.island, &descriptor.name)? {
            if let Some(dep) = registry.lookup(&descriptor.island, &name) {
                dependency_sources.insert(name, dep.descriptor().source.clone());
            }
        }
        Ok(FunctionSnapshot {
            descriptor,
            dependency_sources,
            fixed_kwargs: self.put_kwargs(function.fixed_kwargs())?,
        })
    }

    /// Stores every argument value, returning their addresses by name.
    pub(crate) fn put_kwargs(&self, kwargs: &Kwargs) -> Result<BTreeMap<String, ValueAddr>> {
        kwargs
            .iter()
            .map(|(name, value)| {
                let addr = self.put_value(crate::serializer::kind(value), value)?;
                Ok((name.clone(), addr))
            })
            .collect()
    }
}
