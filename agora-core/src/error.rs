//! Error types.
//!
//! Agora distinguishes failures that indicate a broken contract from failures
//! that are a normal part of running a distributed cache:
//!
//! - [`Error::RegistrationConflict`] and [`Error::ConsistencyViolation`] mean a
//!   caller broke the determinism or immutability contract. They are fatal and
//!   never retried.
//! - [`Error::ExecutionFailed`] wraps an error raised by user code. The attempt
//!   is recorded, and the call stays in the request queue so that any worker
//!   may retry it up to the attempt cap.
//! - [`Error::GuardRejected`] is returned when a guard refuses to run a call.
//!   Swarm workers skip such calls silently.
//! - [`Error::Timeout`] only stops the waiting caller; the queued work is
//!   unaffected.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Library error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The same `(island, name)` pair was registered twice with different
    /// definitions.
    #[error("function {island}::{name} is already registered with a different definition")]
    RegistrationConflict { island: String, name: String },

    /// Two different values were observed under one content address, or two
    /// different results under one call signature.
    #[error("consistency violation at {key}: {detail}")]
    ConsistencyViolation { key: String, detail: String },

    /// User code failed while executing a call.
    #[error("execution of {address} failed: {err:#}")]
    ExecutionFailed { address: String, err: anyhow::Error },

    /// A guard refused to let a call run.
    #[error("guard {guard} rejected execution of {function}")]
    GuardRejected { function: String, guard: String },

    /// A blocking wait gave up before the result appeared.
    #[error("timed out after {waited:?} waiting for {address}")]
    Timeout { address: String, waited: Duration },

    /// The function is not registered, or this binary carries a different
    /// version of it.
    #[error("unknown function {island}::{name}")]
    UnknownFunction { island: String, name: String },

    /// No live portal holds the value behind an address.
    #[error("value {address} is not present in any live portal")]
    MissingValue { address: String },

    /// Scoped portal acquisition was released out of order.
    #[error("portal stack misuse: {0}")]
    StackMisuse(String),

    /// The portal lacks a capability the caller asked for.
    #[error("portal does not provide the {0} capability")]
    MissingCapability(&'static str),

    /// A store key segment cannot be mapped onto the backend.
    #[error("invalid store key segment {segment:?}")]
    InvalidKey { segment: String },

    /// The storage backend failed.
    #[error("I/O error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("failed to decode value: {0}")]
    Decode(String),

    /// A keyword argument is missing, duplicated, or has the wrong shape.
    #[error("argument {name}: {reason}")]
    Argument { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn argument(name: &str, reason: impl Into<String>) -> Self {
        Self::Argument {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error signals a broken contract rather than a runtime
    /// condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RegistrationConflict { .. } | Self::ConsistencyViolation { .. }
        )
    }
}

impl From<ciborium::value::Error> for Error {
    fn from(value: ciborium::value::Error) -> Self {
        Self::Encode(value.to_string())
    }
}

impl<T: std::fmt::Debug> From<ciborium::ser::Error<T>> for Error {
    fn from(value: ciborium::ser::Error<T>) -> Self {
        Self::Encode(value.to_string())
    }
}

impl<T: std::fmt::Debug> From<ciborium::de::Error<T>> for Error {
    fn from(value: ciborium::de::Error<T>) -> Self {
        Self::Decode(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
