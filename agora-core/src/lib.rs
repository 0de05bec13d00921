#![cfg_attr(docsrs, feature(doc_cfg))]

//! Content-addressed, memoized function execution for Rust.
//!
//! Agora turns function calls into stable keys and caches their results
//! durably, so a given computation runs once no matter how many processes ask
//! for it. Calls can run inline, or be queued and drained by a swarm of worker
//! processes that coordinate through nothing but the store itself.
//!
//! Features:
//! - **Content addressing**: values and call signatures hash to stable
//!   addresses, independent of argument order.
//! - **Durable memoization**: results are published first-writer-wins, so
//!   concurrent executions converge on a single cached result.
//! - **Swarming**: worker processes poll a shared request queue, with retries,
//!   exponential backoff and an attempt cap.
//! - **Auditing**: crashes and events are kept in date-partitioned logs, and
//!   every attempt leaves an immutable record.
//!
//! # How to use Agora
//!
//! Everything happens through a [`Portal`](crate::portal::Portal), a storage
//! context backed either by a directory shared between processes, or by
//! process-local maps.
//!
//! ## Declaring functions
//!
//! Functions declared with the [`function`](macro@function) attribute are registered in every
//! portal on open. Their address covers their source text and the source of
//! every function they call, so editing any of them invalidates the cache.
//!
//! ```
//! use agora::{kwargs, portal::Portal};
//!
//! #[agora::function]
//! fn fibonacci(n: u64) -> anyhow::Result<u64> {
//!     Ok(match n {
//!         0 | 1 => n,
//!         _ => FIBONACCI.call::<u64>(kwargs! { n = n - 1 }?)?
//!             + FIBONACCI.call::<u64>(kwargs! { n = n - 2 }?)?,
//!     })
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let portal = Portal::in_memory()?;
//! let _guard = portal.enter();
//! assert_eq!(FIBONACCI.call::<u64>(kwargs! { n = 10u64 }?)?, 55);
//! # drop(_guard);
//! # portal.clear()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Closures
//!
//! [`Function`](crate::function::Function) wraps closures for code that is not
//! known at compile time. Since a closure's body cannot be inspected, its
//! `source` must identify its behavior.
//!
//! ```
//! use agora::{function::{Function, Value}, kwargs, portal::Portal};
//!
//! # fn main() -> anyhow::Result<()> {
//! let portal = Portal::in_memory()?;
//! let square = Function::new("square", "n * n", |_, kwargs| {
//!     let n: u64 = kwargs.get("n")?;
//!     Ok(Value::from(n * n))
//! });
//! assert_eq!(portal.execute::<u64>(&square, kwargs! { n = 12u64 }?)?, 144);
//! # portal.clear()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Swarming
//!
//! See the [`swarm`] module.
pub mod audit;
pub mod config;
pub mod content;
pub mod environment;
pub mod error;
pub mod execution;
pub mod function;
pub mod init;
pub mod portal;
pub mod serializer;
pub mod storage;
pub mod swarm;

pub use agora_macros::function;
pub use error::{Error, Result};

#[doc(hidden)]
pub mod __private {
    pub use anyhow;
    pub use linkme;

    /// Every function declared with the function attribute.
    #[linkme::distributed_slice]
    pub static FUNCTIONS: [crate::function::StaticFunction];
}
