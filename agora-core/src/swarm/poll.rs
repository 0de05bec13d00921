use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{Error, Result},
    execution::ExecutionResultAddr,
    portal::Portal,
};

const EXIT_IDLE: i32 = 0;
const EXIT_EXECUTED: i32 = 10;
const EXIT_FAILED: i32 = 11;

/// What a single poll cycle did.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PollOutcome {
    /// No queued call was eligible.
    Idle,
    /// A call ran and its result is published.
    Executed(ExecutionResultAddr),
    /// A call ran and failed. Its request stays queued.
    Failed(ExecutionResultAddr),
}

impl PollOutcome {
    /// The exit code a poll process reports this outcome with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Idle => EXIT_IDLE,
            Self::Executed(_) => EXIT_EXECUTED,
            Self::Failed(_) => EXIT_FAILED,
        }
    }

    /// Whether a poll process that exited with `code` went idle.
    pub(crate) fn was_idle(code: Option<i32>) -> bool {
        code == Some(EXIT_IDLE)
    }

    pub(crate) fn describe_exit(code: Option<i32>) -> &'static str {
        match code {
            Some(EXIT_IDLE) => "idle",
            Some(EXIT_EXECUTED) => "executed",
            Some(EXIT_FAILED) => "failed",
            Some(_) => "crashed",
            None => "killed",
        }
    }
}

/// Runs one poll cycle against `portal`.
///
/// Considers up to [`max_candidates`](crate::config::Config::max_candidates)
/// queued calls in random order, keeps those that need execution and can be
/// executed by this binary, and runs one of them, picked uniformly at random.
/// Candidates whose checks fail are skipped.
#[instrument(skip_all, level = "debug")]
pub fn poll_once(portal: &Portal) -> Result<PollOutcome> {
    let mut rng = rand::thread_rng();
    let mut pending = portal.pending_requests()?;
    pending.shuffle(&mut rng);
    pending.truncate(portal.config().max_candidates);

    let eligible: Vec<_> = pending
        .into_iter()
        .filter(|address| match is_eligible(portal, address) {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(%address, error = %e, "skipping candidate");
                false
            }
        })
        .collect();
    debug!(eligible = eligible.len(), "scanned request queue");

    let Some(address) = eligible.choose(&mut rng) else {
        return Ok(PollOutcome::Idle);
    };
    match portal.execute_at(address) {
        Ok(_) => {
            info!(%address, "executed queued call");
            Ok(PollOutcome::Executed(address.clone()))
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(Error::GuardRejected { .. }) => Ok(PollOutcome::Idle),
        Err(e) => {
            warn!(%address, error = %e, "queued call failed");
            Ok(PollOutcome::Failed(address.clone()))
        }
    }
}

fn is_eligible(portal: &Portal, address: &ExecutionResultAddr) -> Result<bool> {
    Ok(portal.needs_execution(address)? && portal.can_be_executed(address)?)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        function::{Function, Guard, Kwargs, Value},
        kwargs,
    };

    #[test]
    fn idle_on_an_empty_queue() {
        let portal = Portal::in_memory().unwrap();
        assert_eq!(poll_once(&portal).unwrap(), PollOutcome::Idle);
        portal.clear().unwrap();
    }

    #[test]
    fn drains_queued_calls() {
        let portal = Portal::in_memory().unwrap();
        let double = Function::new("double_polled", "fn double(n) { 2 * n }", |_, kwargs| {
            let n: u64 = kwargs.get("n")?;
            Ok(Value::from(2 * n))
        });
        let first = portal.swarm(&double, kwargs! { n = 1u64 }.unwrap()).unwrap();
        let second = portal.swarm(&double, kwargs! { n = 2u64 }.unwrap()).unwrap();

        let mut executed = Vec::new();
        for _ in 0..2 {
            match poll_once(&portal).unwrap() {
                PollOutcome::Executed(address) => executed.push(address),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        executed.sort();
        let mut expected = vec![first.clone(), second];
        expected.sort();
        assert_eq!(executed, expected);
        assert_eq!(poll_once(&portal).unwrap(), PollOutcome::Idle);
        assert_eq!(portal.get::<u64>(&first, None).unwrap(), 2);
        portal.clear().unwrap();
    }

    #[test]
    fn guarded_calls_are_never_picked() {
        let portal = Portal::in_memory().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let calls = counter.clone();
        let guarded = Function::new("guarded_polled", "fn guarded()", move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .with_guard(Guard::new("never", |_, _| false));
        let address = portal.swarm(&guarded, Kwargs::new()).unwrap();

        for _ in 0..3 {
            assert_eq!(poll_once(&portal).unwrap(), PollOutcome::Idle);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(portal.pending_requests().unwrap(), vec![address]);
        portal.clear().unwrap();
    }

    #[test]
    fn failures_back_off() {
        let portal = Portal::in_memory().unwrap();
        let failing = Function::new("failing_polled", "fn failing()", |_, _| {
            anyhow::bail!("nope")
        });
        let address = portal.swarm(&failing, Kwargs::new()).unwrap();
        assert_eq!(
            poll_once(&portal).unwrap(),
            PollOutcome::Failed(address.clone())
        );
        // The failed call waits out its backoff window.
        assert_eq!(poll_once(&portal).unwrap(), PollOutcome::Idle);
        assert_eq!(portal.pending_requests().unwrap(), vec![address]);
        portal.clear().unwrap();
    }

    #[test]
    fn exit_codes() {
        assert!(PollOutcome::was_idle(Some(PollOutcome::Idle.exit_code())));
        assert_eq!(PollOutcome::describe_exit(Some(10)), "executed");
        assert_eq!(PollOutcome::describe_exit(Some(1)), "crashed");
        assert_eq!(PollOutcome::describe_exit(None), "killed");
    }
}
