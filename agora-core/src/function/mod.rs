//! Functions, keyword arguments and guards.
//!
//! A [`Function`] is a named, deterministic computation taking keyword
//! arguments ([`Kwargs`]) and returning a CBOR [`Value`]. Functions live in
//! *islands*: namespaces of functions that may call one another. A function is
//! identified by `(island, name)` together with its normalized source text,
//! the set of function names it calls, and the sources of every function it
//! transitively depends on. Editing any of them changes the function's address
//! and therefore the addresses of all its cached results.
//!
//! Most functions are declared with the [`#[agora::function]`](macro@crate::function)
//! attribute, which registers them in a link-time catalogue
//! ([`StaticFunction`]). Every portal registers the whole catalogue when it
//! opens. Functions can also be built at runtime from closures:
//!
//! ```
//! use agora::{function::{Function, Kwargs, Value}, kwargs, portal::Portal};
//!
//! # fn main() -> anyhow::Result<()> {
//! let double = Function::new("double", "fn double(n: u64) -> u64 { n * 2 }", |_, kwargs| {
//!     let n: u64 = kwargs.get("n")?;
//!     Ok(Value::from(n * 2))
//! });
//!
//! let portal = Portal::in_memory()?;
//! let result: u64 = portal.execute(&double, kwargs! { n = 21u64 }?)?;
//! assert_eq!(result, 42);
//! # portal.clear()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Guards
//!
//! A guard is a predicate over the portal and the call's arguments. A call is
//! only executed when every guard of its function passes; a guard that panics
//! counts as failing. Swarm workers silently skip calls whose guards fail.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;

use crate::{
    audit,
    error::{Error, Result},
    portal::Portal,
    serializer,
};

pub mod registry;

pub use ciborium::value::Value;

/// The signature of a function body.
pub type Callable = Arc<dyn Fn(&Portal, &Kwargs) -> anyhow::Result<Value> + Send + Sync>;

/// The signature of a guard.
pub type GuardFn = Arc<dyn Fn(&Portal, &Kwargs) -> bool + Send + Sync>;

/// Keyword arguments, ordered by name.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct Kwargs(BTreeMap<String, Value>);

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Kwargs::insert`].
    pub fn with<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Sets the argument `name`, replacing a previous value.
    pub fn insert<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let value = serializer::to_value(value).map_err(|e| Error::argument(name, e.to_string()))?;
        self.0.insert(name.to_string(), value);
        Ok(())
    }

    pub fn insert_value(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    /// Decodes the argument `name`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| Error::argument(name, "missing"))?;
        serializer::from_value(value).map_err(|e| Error::argument(name, e.to_string()))
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds the fixed arguments of a partially applied function. Supplying a
    /// fixed argument again is an error.
    pub(crate) fn merged_with(mut self, fixed: &Kwargs) -> Result<Self> {
        for (name, value) in fixed.iter() {
            if self.0.contains_key(name) {
                return Err(Error::argument(name, "already fixed by partial application"));
            }
            self.0.insert(name.clone(), value.clone());
        }
        Ok(self)
    }
}

impl FromIterator<(String, Value)> for Kwargs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Builds [`Kwargs`] from `name = value` pairs.
///
/// Evaluates to a [`Result`](crate::error::Result), failing when a value
/// cannot be serialized.
///
/// ```
/// let kwargs = agora::kwargs! { n = 10u64, label = "ten" }.unwrap();
/// assert_eq!(kwargs.get::<u64>("n").unwrap(), 10);
/// ```
#[macro_export]
macro_rules! kwargs {
    () => {
        $crate::error::Result::<$crate::function::Kwargs>::Ok($crate::function::Kwargs::new())
    };
    ($($name:ident = $value:expr),+ $(,)?) => {
        (|| -> $crate::error::Result<$crate::function::Kwargs> {
            let mut kwargs = $crate::function::Kwargs::new();
            $(kwargs.insert(stringify!($name), &$value)?;)+
            Ok(kwargs)
        })()
    };
}

/// What the registry knows about a function.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct FunctionDescriptor {
    pub name: String,
    pub island: String,
    /// Normalized source text.
    pub source: String,
    /// Names of the functions it calls directly.
    pub dependencies: BTreeSet<String>,
    pub guards: Vec<String>,
}

/// A named guard.
#[derive(Clone)]
pub struct Guard {
    name: String,
    check: GuardFn,
}

impl Guard {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Portal, &Kwargs) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the guard. A panicking guard fails, without reaching the crash
    /// history.
    pub fn passes(&self, portal: &Portal, kwargs: &Kwargs) -> bool {
        let checked =
            audit::quietly(|| catch_unwind(AssertUnwindSafe(|| (self.check)(portal, kwargs))));
        match checked {
            Ok(passed) => passed,
            Err(_) => {
                warn!(guard = %self.name, "guard panicked");
                false
            }
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Guard").field(&self.name).finish()
    }
}

/// A callable function together with its identity.
#[derive(Clone)]
pub struct Function {
    name: String,
    island: Option<String>,
    source: String,
    dependencies: BTreeSet<String>,
    guards: Vec<Guard>,
    callable: Callable,
    fixed: Kwargs,
}

impl Function {
    /// Creates a function from a closure. `source` stands in for the body in
    /// the function's address and must change whenever the behavior does.
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        callable: impl Fn(&Portal, &Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            island: None,
            source: source.into(),
            dependencies: BTreeSet::new(),
            guards: Vec::new(),
            callable: Arc::new(callable),
            fixed: Kwargs::new(),
        }
    }

    /// Places the function in `island` instead of the portal's default.
    pub fn in_island(mut self, island: impl Into<String>) -> Self {
        self.island = Some(island.into());
        self
    }

    /// Declares the functions it calls.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    /// Partially applies the function. The fixed arguments become part of its
    /// identity.
    pub fn fix_kwargs(&self, kwargs: Kwargs) -> Result<Self> {
        let mut function = self.clone();
        function.fixed = kwargs.merged_with(&self.fixed)?;
        Ok(function)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The island, falling back to `default_island`.
    pub fn island_or<'a>(&'a self, default_island: &'a str) -> &'a str {
        self.island.as_deref().unwrap_or(default_island)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn fixed_kwargs(&self) -> &Kwargs {
        &self.fixed
    }

    pub fn descriptor(&self, default_island: &str) -> FunctionDescriptor {
        FunctionDescriptor {
            name: self.name.clone(),
            island: self.island_or(default_island).to_string(),
            source: self.source.clone(),
            dependencies: self.dependencies.clone(),
            guards: self.guards.iter().map(|g| g.name.clone()).collect(),
        }
    }

    /// The name of the first guard rejecting the call, if any.
    pub fn rejecting_guard(&self, portal: &Portal, kwargs: &Kwargs) -> Option<&str> {
        self.guards
            .iter()
            .find(|guard| !guard.passes(portal, kwargs))
            .map(Guard::name)
    }

    /// Runs the body. `kwargs` must already include the fixed arguments.
    pub(crate) fn call(&self, portal: &Portal, kwargs: &Kwargs) -> anyhow::Result<Value> {
        (self.callable)(portal, kwargs)
    }

    /// The function without its fixed arguments.
    pub(crate) fn unfixed(&self) -> Self {
        Self {
            fixed: Kwargs::new(),
            ..self.clone()
        }
    }

    /// Call-time arguments merged with the fixed ones.
    pub(crate) fn full_kwargs(&self, kwargs: Kwargs) -> Result<Kwargs> {
        kwargs.merged_with(&self.fixed)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("island", &self.island)
            .field("dependencies", &self.dependencies)
            .field("guards", &self.guards)
            .field("fixed", &self.fixed)
            .finish()
    }
}

/// A guard declared through the function attribute.
#[derive(Debug)]
pub struct StaticGuard {
    pub name: &'static str,
    pub check: fn(&Portal, &Kwargs) -> bool,
}

/// A function declared with the [`#[agora::function]`](macro@crate::function)
/// attribute.
///
/// The attribute emits one `static` per function, named after the function in
/// upper case, and adds it to the link-time catalogue.
#[derive(Debug)]
pub struct StaticFunction {
    pub name: &'static str,
    pub island: Option<&'static str>,
    pub source: &'static str,
    pub dependencies: &'static [&'static str],
    pub guards: &'static [StaticGuard],
    pub call: fn(&Portal, &Kwargs) -> anyhow::Result<Value>,
}

impl StaticFunction {
    pub fn function(&self) -> Function {
        let call = self.call;
        let mut function = Function::new(self.name, self.source, move |portal, kwargs| {
            call(portal, kwargs)
        })
        .depends_on(self.dependencies.iter().copied());
        function.island = self.island.map(str::to_string);
        for guard in self.guards {
            let check = guard.check;
            function = function.with_guard(Guard::new(guard.name, move |portal, kwargs| {
                check(portal, kwargs)
            }));
        }
        function
    }

    /// Executes the function through `portal`, returning the cached result
    /// when there is one.
    pub fn execute<T: DeserializeOwned>(&self, portal: &Portal, kwargs: Kwargs) -> Result<T> {
        portal.execute(&self.function(), kwargs)
    }

    /// Executes the function through the best available portal.
    pub fn call<T: DeserializeOwned>(&self, kwargs: Kwargs) -> Result<T> {
        let portal = crate::portal::stack::best_portal_to_use(None)?;
        self.execute(&portal, kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kwargs_are_name_ordered() {
        let a = crate::kwargs! { b = 2u8, a = 1u8 }.unwrap();
        let b = crate::kwargs! { a = 1u8, b = 2u8 }.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn missing_and_ill_typed_arguments() {
        let kwargs = crate::kwargs! { n = "ten" }.unwrap();
        assert!(matches!(
            kwargs.get::<u64>("m"),
            Err(Error::Argument { ref name, .. }) if name == "m"
        ));
        assert!(matches!(
            kwargs.get::<u64>("n"),
            Err(Error::Argument { ref name, .. }) if name == "n"
        ));
    }

    #[test]
    fn fixed_arguments_cannot_be_supplied_again() {
        let add = Function::new("add", "a + b", |_, kwargs| {
            let a: i64 = kwargs.get("a")?;
            let b: i64 = kwargs.get("b")?;
            Ok(Value::from(a + b))
        });
        let add_one = add.fix_kwargs(crate::kwargs! { a = 1 }.unwrap()).unwrap();
        assert!(add_one.full_kwargs(crate::kwargs! { b = 2 }.unwrap()).is_ok());
        assert!(matches!(
            add_one.full_kwargs(crate::kwargs! { a = 2 }.unwrap()),
            Err(Error::Argument { .. })
        ));
        assert!(add_one.fix_kwargs(crate::kwargs! { a = 5 }.unwrap()).is_err());
    }

    #[test]
    fn panicking_guard_fails() {
        let portal = Portal::in_memory().unwrap();
        let function = Function::new("f", "f", |_, _| Ok(Value::Null))
            .with_guard(Guard::new("ok", |_, _| true))
            .with_guard(Guard::new("explodes", |_, _| panic!("guard bug")));
        let entered = portal.enter();
        assert_eq!(
            function.rejecting_guard(&portal, &Kwargs::new()),
            Some("explodes")
        );
        drop(entered);
        assert_eq!(portal.audit().crash_count().unwrap(), 0);
        portal.clear().unwrap();
    }

    #[test]
    fn descriptor_uses_default_island() {
        let f = Function::new("f", "src", |_, _| Ok(Value::Null)).depends_on(["g"]);
        let d = f.descriptor("main");
        assert_eq!(d.island, "main");
        assert!(d.dependencies.contains("g"));
        let d = f.clone().in_island("science").descriptor("main");
        assert_eq!(d.island, "science");
    }
}
