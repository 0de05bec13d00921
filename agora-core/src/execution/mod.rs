//! Memoized execution.
//!
//! Calling a function through a portal first computes the call's
//! [`ExecutionResultAddr`]: every argument value is stored, the name-sorted map
//! of argument addresses is stored, and the pair of function address and
//! argument-map address (the [`CallSignature`]) is stored. The result address
//! shares the signature's hash and is prefixed with the function's name.
//!
//! A result address moves through three states:
//!
//! - *unknown*: nothing is known about the call.
//! - *requested*: the call sits in the durable request queue, waiting for this
//!   process or a swarm worker to run it. Every attempt writes an
//!   [`ExecutionAttempt`] when it starts and an [`ExecutionRecord`] when it
//!   ends; failed attempts leave the request in the queue.
//! - *ready*: a result was published. Publication is first-writer-wins, so
//!   every observer sees the same single result. This state is terminal.
//!
//! Failed calls are retried with exponential backoff: a call that failed `n`
//! times is eligible again once `attempt_backoff * 2^n` has elapsed since its
//! most recent attempt, and is abandoned once `n` exceeds `max_attempts`.
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{LazyLock, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use ciborium::value::Value;
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    audit::{self, CrashEntry, EventCapture},
    content::{HashAddr, ValueAddr},
    environment::{ComputeNode, EnvironmentSummary},
    error::{Error, Result},
    function::{registry::FunctionSnapshot, Function, Kwargs},
    portal::Portal,
    serializer,
    storage::StoreKey,
};

mod capture;
mod record;

use capture::OutputCapture;
pub use record::{CapturedOutput, ExecutionAttempt, ExecutionRecord};

/// Environment variable through which a worker parent hands the attempt id of
/// a single-shot poll cycle to the child process.
pub const ATTEMPT_ID_ENV: &str = "AGORA_ATTEMPT_ID";

const SIGNATURE_PREFIX: &str = "call";
const FUNCTION_PREFIX: &str = "function";
const KWARGS_PREFIX: &str = "kwargs";
const INITIAL_POLL_DELAY: Duration = Duration::from_secs(1);
const MAX_POLL_DELAY: Duration = Duration::from_secs(64);
const POLL_JITTER: Duration = Duration::from_millis(500);

static INHERITED_ATTEMPT_ID: LazyLock<Mutex<Option<String>>> =
    LazyLock::new(|| Mutex::new(std::env::var(ATTEMPT_ID_ENV).ok()));

/// The address of the result of one call.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct ExecutionResultAddr(HashAddr);

impl ExecutionResultAddr {
    /// The name of the function called.
    pub fn prefix(&self) -> &str {
        self.0.prefix()
    }

    pub fn hash(&self) -> &str {
        self.0.hash()
    }

    pub fn key(&self) -> Result<StoreKey> {
        self.0.key()
    }

    pub(crate) fn from_key(key: &StoreKey) -> Option<Self> {
        HashAddr::from_key(key).map(Self)
    }

    fn signature_addr(&self) -> ValueAddr {
        ValueAddr::from_hash_addr(HashAddr::new(SIGNATURE_PREFIX, self.hash()))
    }

    fn attempt_key(&self, attempt_id: &str) -> Result<StoreKey> {
        self.key()?.join(attempt_id)
    }
}

impl fmt::Display for ExecutionResultAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "result:{}", self.0)
    }
}

/// What a call is: a function and its arguments, both by address.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct CallSignature {
    /// Address of the [`FunctionSnapshot`].
    pub function: ValueAddr,
    /// Address of the name-sorted map of argument addresses.
    pub kwargs: ValueAddr,
}

/// An entry of the request queue.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct ExecutionRequest {
    pub requested_at: DateTime<Utc>,
    pub requested_by: ComputeNode,
}

/// A call with its address resolved.
#[derive(Clone, Debug)]
pub struct PreparedCall {
    pub address: ExecutionResultAddr,
    pub function: Function,
    /// Call-time arguments, without the function's fixed ones.
    pub kwargs: Kwargs,
}

pub(crate) fn new_attempt_id() -> String {
    let inherited = INHERITED_ATTEMPT_ID
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    inherited.unwrap_or_else(|| {
        format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string().replace('.', "-"),
            &Uuid::new_v4().simple().to_string()[..12]
        )
    })
}

impl Portal {
    /// Computes the result address of calling `function` with `kwargs`,
    /// storing the values the address is derived from.
    pub fn address(&self, function: &Function, kwargs: &Kwargs) -> Result<ExecutionResultAddr> {
        Ok(self.prepare(function, kwargs.clone())?.address)
    }

    #[instrument(skip_all, level = "debug", fields(function = %function.name()))]
    pub fn prepare(&self, function: &Function, kwargs: Kwargs) -> Result<PreparedCall> {
        // Rejects arguments that collide with fixed ones.
        function.full_kwargs(kwargs.clone())?;

        let snapshot = self.snapshot(function)?;
        let function_addr = self.put_value(FUNCTION_PREFIX, &serializer::to_value(&snapshot)?)?;
        let packed = self.put_kwargs(&kwargs)?;
        let kwargs_addr = self.put_value(KWARGS_PREFIX, &serializer::to_value(&packed)?)?;
        let signature = CallSignature {
            function: function_addr,
            kwargs: kwargs_addr,
        };
        let signature_addr = self.put_value(SIGNATURE_PREFIX, &serializer::to_value(&signature)?)?;

        Ok(PreparedCall {
            address: ExecutionResultAddr(HashAddr::new(function.name(), signature_addr.hash())),
            function: function.clone(),
            kwargs,
        })
    }

    /// Whether a result was published for `address`.
    pub fn is_ready(&self, address: &ExecutionResultAddr) -> Result<bool> {
        self.inner.results.contains(&address.key()?)
    }

    /// The address of the published result, if any.
    pub fn result_addr(&self, address: &ExecutionResultAddr) -> Result<Option<ValueAddr>> {
        match self.inner.results.get(&address.key()?)? {
            Some(bytes) => Ok(Some(serializer::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Adds the call to the request queue, unless it is already queued.
    pub fn request_execution(&self, address: &ExecutionResultAddr) -> Result<()> {
        let key = address.key()?;
        if self.inner.requests.contains(&key)? {
            return Ok(());
        }
        let request = ExecutionRequest {
            requested_at: Utc::now(),
            requested_by: ComputeNode::current(),
        };
        self.inner.requests.save(&key, &request)?;
        // Drop the request if a result was published meanwhile.
        if self.is_ready(address)? {
            self.inner.requests.delete(&key)?;
            return Ok(());
        }
        debug!(%address, "requested execution");
        Ok(())
    }

    /// Queues a call without waiting for it. Swarm workers, or a later
    /// [`Portal::get`], pick it up.
    pub fn swarm(&self, function: &Function, kwargs: Kwargs) -> Result<ExecutionResultAddr> {
        let call = self.prepare(function, kwargs)?;
        if !self.is_ready(&call.address)? {
            self.request_execution(&call.address)?;
        }
        Ok(call.address)
    }

    /// Every queued result address.
    pub fn pending_requests(&self) -> Result<Vec<ExecutionResultAddr>> {
        Ok(self
            .inner
            .requests
            .keys(&StoreKey::root())?
            .iter()
            .filter_map(ExecutionResultAddr::from_key)
            .collect())
    }

    pub fn execution_attempts(&self, address: &ExecutionResultAddr) -> Result<Vec<ExecutionAttempt>> {
        let prefix = address.key()?;
        let mut attempts = Vec::new();
        for key in self.inner.attempts.keys(&prefix)? {
            if let Some(attempt) = self.inner.attempts.load(&key)? {
                attempts.push(attempt);
            }
        }
        Ok(attempts)
    }

    /// Every sealed record of `address`. Output a worker captured from the
    /// whole poll process replaces the output captured during the attempt.
    pub fn execution_records(&self, address: &ExecutionResultAddr) -> Result<Vec<ExecutionRecord>> {
        let prefix = address.key()?;
        let mut records = Vec::new();
        for key in self.inner.records.keys(&prefix)? {
            let Some(mut record) = self.inner.records.load::<ExecutionRecord>(&key)? else {
                continue;
            };
            let stored = self
                .inner
                .outputs
                .load(&StoreKey::new([record.attempt_id.as_str()])?)?;
            if stored.is_some() {
                record.output = stored;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Stores the output a worker parent captured for `attempt_id`.
    pub(crate) fn store_output(&self, attempt_id: &str, output: &CapturedOutput) -> Result<()> {
        self.inner.outputs.save(&StoreKey::new([attempt_id])?, output)?;
        Ok(())
    }

    /// Whether the call should be attempted now.
    ///
    /// False once ready, once the number of attempts exceeds the configured
    /// cap, and while the backoff window of the most recent attempt is open.
    pub fn needs_execution(&self, address: &ExecutionResultAddr) -> Result<bool> {
        if self.is_ready(address)? {
            return Ok(false);
        }
        let attempts = self.execution_attempts(address)?;
        let Some(last) = attempts.iter().map(|a| a.started_at).max() else {
            return Ok(true);
        };
        let n = u32::try_from(attempts.len()).unwrap_or(u32::MAX);
        if n > self.config().max_attempts {
            return Ok(false);
        }
        let window = self
            .config()
            .attempt_backoff()
            .saturating_mul(2u32.saturating_pow(n));
        let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
        Ok(elapsed >= window)
    }

    /// Rebuilds the call behind `address` from the stored signature.
    ///
    /// Fails with [`Error::UnknownFunction`] when this binary does not carry
    /// the exact function the signature was computed from.
    pub fn resolve_call(&self, address: &ExecutionResultAddr) -> Result<PreparedCall> {
        let signature: CallSignature = self.get_value(&address.signature_addr())?;
        let snapshot: FunctionSnapshot = self.get_value(&signature.function)?;
        let descriptor = &snapshot.descriptor;
        let unknown = || Error::UnknownFunction {
            island: descriptor.island.clone(),
            name: descriptor.name.clone(),
        };

        let registered = self
            .registry()
            .lookup(&descriptor.island, &descriptor.name)
            .ok_or_else(unknown)?;
        let mut fixed = Kwargs::new();
        for (name, addr) in &snapshot.fixed_kwargs {
            fixed.insert_value(name.clone(), self.get_value::<Value>(addr)?);
        }
        let function = registered.function().fix_kwargs(fixed)?;
        if self.snapshot(&function)? != snapshot {
            return Err(unknown());
        }

        let packed: std::collections::BTreeMap<String, ValueAddr> = self.get_value(&signature.kwargs)?;
        let mut kwargs = Kwargs::new();
        for (name, addr) in packed {
            let value: Value = self.get_value(&addr)?;
            kwargs.insert_value(name, value);
        }

        Ok(PreparedCall {
            address: address.clone(),
            function,
            kwargs,
        })
    }

    /// The function behind `address`.
    pub fn function_for(&self, address: &ExecutionResultAddr) -> Result<Function> {
        Ok(self.resolve_call(address)?.function)
    }

    /// The call-time arguments behind `address`.
    pub fn kwargs_for(&self, address: &ExecutionResultAddr) -> Result<Kwargs> {
        Ok(self.resolve_call(address)?.kwargs)
    }

    /// Whether this process can run the call: it knows the exact function,
    /// and every guard passes.
    pub fn can_be_executed(&self, address: &ExecutionResultAddr) -> Result<bool> {
        let call = match self.resolve_call(address) {
            Ok(call) => call,
            Err(Error::UnknownFunction { .. } | Error::MissingValue { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let full = call.function.full_kwargs(call.kwargs)?;
        Ok(call.function.rejecting_guard(self, &full).is_none())
    }

    /// Executes `function`, returning the cached result when there is one.
    pub fn execute<T: DeserializeOwned>(&self, function: &Function, kwargs: Kwargs) -> Result<T> {
        let call = self.prepare(function, kwargs)?;
        let value = self.execute_prepared(&call)?;
        serializer::from_value(&value)
    }

    /// Executes the call behind `address`.
    pub fn execute_at(&self, address: &ExecutionResultAddr) -> Result<Value> {
        let call = self.resolve_call(address)?;
        self.execute_prepared(&call)
    }

    /// Executes the call behind `address` if it needs execution and can be
    /// executed here. Returns whether it ran.
    pub fn run_if_needed(&self, address: &ExecutionResultAddr) -> Result<bool> {
        if !self.needs_execution(address)? || !self.can_be_executed(address)? {
            return Ok(false);
        }
        self.execute_at(address)?;
        Ok(true)
    }

    #[instrument(skip_all, level = "debug", fields(address = %call.address))]
    pub fn execute_prepared(&self, call: &PreparedCall) -> Result<Value> {
        if let Some(result) = self.result_addr(&call.address)? {
            let value: Value = self.get_value(&result)?;
            if self.inner.results.should_check() {
                self.recheck(call, &value)?;
            }
            return Ok(value);
        }

        let full = call.function.full_kwargs(call.kwargs.clone())?;
        if let Some(guard) = call.function.rejecting_guard(self, &full) {
            return Err(Error::GuardRejected {
                function: call.function.name().to_string(),
                guard: guard.to_string(),
            });
        }

        self.request_execution(&call.address)?;
        self.attempt(call, &full)
    }

    /// Re-runs a cached call and compares the fresh result with the cached one.
    fn recheck(&self, call: &PreparedCall, cached: &Value) -> Result<()> {
        let full = call.function.full_kwargs(call.kwargs.clone())?;
        let fresh = {
            let _guard = self.enter();
            catch_unwind(AssertUnwindSafe(|| call.function.call(self, &full)))
        };
        audit::take_panic_logged();
        let fresh = match fresh {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                return Err(Error::ExecutionFailed {
                    address: call.address.to_string(),
                    err,
                })
            }
            Err(payload) => {
                return Err(Error::ExecutionFailed {
                    address: call.address.to_string(),
                    err: anyhow::anyhow!("panicked: {}", audit::panic_message(payload.as_ref())),
                })
            }
        };
        if serializer::value_to_bytes(&fresh)? != serializer::value_to_bytes(cached)? {
            warn!(address = %call.address, "re-execution produced a different result");
            return Err(Error::ConsistencyViolation {
                key: call.address.to_string(),
                detail: "re-execution produced a different result".to_string(),
            });
        }
        Ok(())
    }

    fn attempt(&self, call: &PreparedCall, full: &Kwargs) -> Result<Value> {
        let attempt_id = new_attempt_id();
        let key = call.address.attempt_key(&attempt_id)?;
        let started = ExecutionAttempt {
            attempt_id: attempt_id.clone(),
            started_at: Utc::now(),
            environment: EnvironmentSummary::capture(),
        };
        self.inner.attempts.save(&key, &started)?;
        info!(address = %call.address, attempt = %attempt_id, "executing");

        audit::take_panic_logged();
        let capture = EventCapture::start();
        let output = OutputCapture::start();
        let outcome = {
            let _guard = self.enter();
            catch_unwind(AssertUnwindSafe(|| call.function.call(self, full)))
        };
        let output = output.finish();
        let events = capture.finish();

        let mut record = ExecutionRecord {
            attempt_id: attempt_id.clone(),
            address: call.address.clone(),
            started_at: started.started_at,
            finished_at: Utc::now(),
            environment: started.environment,
            output,
            crashes: Vec::new(),
            events,
            result: None,
        };

        let (err, crash, already_logged) = match outcome {
            Ok(Ok(value)) => {
                let value_addr = self.put_value(serializer::kind(&value), &value)?;
                let published = self.publish_result(&call.address, &value_addr)?;
                record.result = Some(published.clone());
                self.inner.records.save(&key, &record)?;
                self.inner.requests.delete(&call.address.key()?)?;
                if published != value_addr {
                    debug!(address = %call.address, "another attempt published first");
                    return self.get_value(&published);
                }
                return Ok(value);
            }
            Ok(Err(err)) => {
                let crash = CrashEntry::from_error(&err).with_context(call.address.to_string());
                // A nested attempt already logged its own failure.
                let nested = matches!(
                    err.downcast_ref::<Error>(),
                    Some(Error::ExecutionFailed { .. })
                );
                (err, crash, nested)
            }
            Err(payload) => {
                let message = audit::panic_message(payload.as_ref());
                let crash = CrashEntry::from_panic(message.clone(), None)
                    .with_context(call.address.to_string());
                (
                    anyhow::anyhow!("panicked: {message}"),
                    crash,
                    audit::take_panic_logged(),
                )
            }
        };

        warn!(address = %call.address, attempt = %attempt_id, error = %err, "execution failed");
        if !already_logged {
            self.audit().log_crash(&crash, Some(attempt_id.as_str()))?;
        }
        record.crashes.push(crash);
        self.inner.records.save(&key, &record)?;

        match err.downcast::<Error>() {
            Ok(inner) if inner.is_fatal() => Err(inner),
            Ok(inner) => Err(Error::ExecutionFailed {
                address: call.address.to_string(),
                err: inner.into(),
            }),
            Err(err) => Err(Error::ExecutionFailed {
                address: call.address.to_string(),
                err,
            }),
        }
    }

    /// Publishes `value` as the result of `address`, returning the result
    /// that won.
    fn publish_result(&self, address: &ExecutionResultAddr, value: &ValueAddr) -> Result<ValueAddr> {
        let key = address.key()?;
        let bytes = serializer::to_bytes(value)?;
        match self.inner.results.put(&key, &bytes) {
            Err(Error::ConsistencyViolation { key, .. }) => Err(Error::ConsistencyViolation {
                key,
                detail: "two attempts published different results".to_string(),
            }),
            Err(e) => Err(e),
            Ok(_) => self.result_addr(address)?.ok_or_else(|| Error::MissingValue {
                address: address.to_string(),
            }),
        }
    }

    /// Blocks until the result of `address` is available, requesting its
    /// execution if needed.
    ///
    /// Polls with exponential backoff starting at one second, with up to half a
    /// second of jitter either way, and gives up with [`Error::Timeout`] once
    /// `timeout` elapsed.
    #[instrument(skip_all, level = "debug", fields(address = %address))]
    pub fn get<T: DeserializeOwned>(
        &self,
        address: &ExecutionResultAddr,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let started = Instant::now();
        let mut delay = INITIAL_POLL_DELAY;
        loop {
            if let Some(result) = self.result_addr(address)? {
                return self.get_value(&result);
            }
            self.request_execution(address)?;

            let mut sleep = jittered(delay);
            if let Some(timeout) = timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(Error::Timeout {
                        address: address.to_string(),
                        waited,
                    });
                }
                sleep = sleep.min(timeout - waited);
            }
            std::thread::sleep(sleep);
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(-1.0..=1.0) * POLL_JITTER.as_secs_f64();
    Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
}
