use std::{io::Read, process::Stdio, thread, time::Duration};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{relaunch, token_key, PollOutcome, Role};
use crate::{
    config::Config,
    environment::ComputeNode,
    execution::{self, CapturedOutput, ATTEMPT_ID_ENV},
    portal::Portal,
};

/// How a worker learns that it should stop, besides its parent's token
/// disappearing.
#[derive(Clone, Default)]
pub(crate) struct StopSignals {
    /// Ctrl-C.
    pub(crate) interrupted: CancellationToken,
    /// The parent process exited.
    pub(crate) orphaned: CancellationToken,
}

impl StopSignals {
    /// Watches for Ctrl-C, and for end of input on stdin. The parent holds
    /// the write end of its workers' stdin for as long as it lives, however
    /// it exits.
    pub(crate) fn install() -> Self {
        let signals = Self::default();

        let interrupted = signals.interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.cancel();
            }
        });

        // A plain thread, since a blocking stdin read would hold up runtime
        // shutdown.
        let orphaned = signals.orphaned.clone();
        thread::spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 64];
            while matches!(stdin.read(&mut buf), Ok(n) if n > 0) {}
            orphaned.cancel();
        });
        signals
    }

    fn stopped(&self) -> bool {
        self.interrupted.is_cancelled() || self.orphaned.is_cancelled()
    }

    async fn wait(&self) {
        tokio::select! {
            _ = self.interrupted.cancelled() => {}
            _ = self.orphaned.cancelled() => {}
        }
    }
}

/// Runs poll cycles in child processes until the parent's liveness token
/// disappears, the parent exits, or the process is interrupted.
///
/// A worker whose parent exited without removing its token removes it.
#[instrument(skip_all, level = "debug", fields(parent = %parent.runtime_id))]
pub(crate) async fn worker_loop(
    config: Config,
    parent: ComputeNode,
    signals: StopSignals,
) -> Result<()> {
    let portal = Portal::open(config.clone())?;
    let token_key = token_key(&parent)?;

    info!("worker started");
    while !signals.stopped() {
        if !portal.inner.compute_nodes.contains(&token_key)? {
            info!("parent token is gone, shutting down");
            break;
        }

        let idle = tokio::select! {
            _ = signals.wait() => break,
            polled = poll_in_child(&config, &parent, &portal) => match polled {
                Ok(idle) => idle,
                Err(e) => {
                    warn!("poll cycle failed: {e:#}");
                    true
                }
            },
        };
        if idle {
            tokio::select! {
                _ = signals.wait() => {}
                _ = tokio::time::sleep(jittered(config.poll_interval())) => {}
            }
        }
    }

    if signals.orphaned.is_cancelled() {
        info!("parent exited, removing its token");
        portal.inner.compute_nodes.delete(&token_key)?;
    }
    info!("worker stopped");
    Ok(())
}

/// Runs one poll cycle in a child process and stores its output under the
/// attempt id handed to it. Returns whether the cycle went idle.
async fn poll_in_child(config: &Config, parent: &ComputeNode, portal: &Portal) -> Result<bool> {
    let attempt_id = execution::new_attempt_id();
    let mut command = Command::from(relaunch(config, Role::Poll, parent)?);
    command
        .env(ATTEMPT_ID_ENV, &attempt_id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().context("spawning a poll process")?;
    let stdout = child.stdout.take().context("missing child stdout pipe")?;
    let stderr = child.stderr.take().context("missing child stderr pipe")?;

    let timeout = config.attempt_timeout();
    let wait = async {
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status.map(Some),
                Err(_) => {
                    warn!(attempt = %attempt_id, ?timeout, "poll process timed out");
                    child.kill().await.map(|_| None)
                }
            },
            None => child.wait().await.map(Some),
        }
    };
    let (stdout, stderr, status) = futures::join!(read_all(stdout), read_all(stderr), wait);
    let exit_code = status.context("waiting for the poll process")?.and_then(|s| s.code());

    debug!(
        attempt = %attempt_id,
        outcome = PollOutcome::describe_exit(exit_code),
        "poll process exited"
    );
    if PollOutcome::was_idle(exit_code) {
        return Ok(true);
    }

    let output = CapturedOutput {
        stdout,
        stderr,
        exit_code,
    };
    portal
        .store_output(&attempt_id, &output)
        .context("storing captured output")?;
    Ok(false)
}

async fn read_all(mut pipe: impl AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..=1.5);
    interval.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let interval = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jittered(interval);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
    }

    #[tokio::test]
    async fn read_all_collects_everything() {
        let data: &[u8] = b"line one\nline two\n";
        assert_eq!(read_all(data).await, "line one\nline two\n");
    }

    #[tokio::test]
    async fn worker_stops_without_a_parent_token() {
        let dir = tempfile::TempDir::new().unwrap();
        let parent = ComputeNode {
            node_id: "nobody".to_string(),
            runtime_id: "gone".to_string(),
        };
        worker_loop(Config::at(dir.path()), parent, StopSignals::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn orphaned_worker_removes_the_parent_token() {
        let dir = tempfile::TempDir::new().unwrap();
        let portal = Portal::open(Config::at(dir.path())).unwrap();
        let parent = ComputeNode {
            node_id: "node".to_string(),
            runtime_id: "exited".to_string(),
        };
        let key = token_key(&parent).unwrap();
        portal.inner.compute_nodes.save(&key, &1u8).unwrap();
        assert_eq!(portal.live_compute_nodes().unwrap(), 1);

        let signals = StopSignals::default();
        signals.orphaned.cancel();
        worker_loop(Config::at(dir.path()), parent, signals).await.unwrap();
        assert_eq!(portal.live_compute_nodes().unwrap(), 0);
        portal.clear().unwrap();
    }
}
